//! Output decoding for the two supported model head layouts: a single
//! on-chip-NMS output, or a raw 9-output multi-scale pose head with
//! DFL-encoded boxes.

use crate::inference::letterbox::Letterbox;
use crate::labels;
use crate::types::{BoundingBox, Detection, Keypoint, ModelTask};
use tracing::{debug, warn};

/// IoU threshold for suppressing overlapping raw-head candidates.
pub const IOU_THRESHOLD: f32 = 0.45;
/// DFL bins per box edge.
pub const REG_MAX: usize = 16;
/// Channels of one DFL output per cell: four edges of [`REG_MAX`] bins.
pub const DFL_CHANNELS: usize = 4 * REG_MAX;

const DFL_TEMPERATURE: f32 = 5.0;
const STRIDES: [u32; 3] = [8, 16, 32];
const SCALE_NAMES: [[&str; 3]; 3] = [
    ["conv43", "conv44", "conv45"],
    ["conv57", "conv58", "conv59"],
    ["conv70", "conv71", "conv72"],
];

/// Everything a decode pass needs besides the raw buffers.
pub struct DecodeContext<'a> {
    pub input_width: u32,
    pub input_height: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub letterbox: Letterbox,
    pub confidence_threshold: f32,
    pub task: ModelTask,
    pub num_keypoints: usize,
    pub labels: &'a [String],
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Squash a value through sigmoid only when it reads like a logit, i.e.
/// falls outside `[0, 1]`.
fn maybe_sigmoid(x: f32) -> f32 {
    if !(0.0..=1.0).contains(&x) {
        sigmoid(x)
    } else {
        x
    }
}

/// Clamp model-plane corners back into the source frame and build an
/// integer box. Clamping happens before the width/height subtraction so the
/// box can never leave the frame. Returns `None` for degenerate boxes.
fn bbox_from_corners(
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    frame_width: u32,
    frame_height: u32,
) -> Option<BoundingBox> {
    let fw = frame_width as f32;
    let fh = frame_height as f32;

    let x1 = x1.clamp(0.0, fw);
    let y1 = y1.clamp(0.0, fh);
    let x2 = x2.clamp(0.0, fw);
    let y2 = y2.clamp(0.0, fh);

    let bbox = BoundingBox {
        x: x1 as i32,
        y: y1 as i32,
        width: (x2 - x1) as i32,
        height: (y2 - y1) as i32,
    };

    (bbox.width > 0 && bbox.height > 0).then_some(bbox)
}

/// Map a model-plane keypoint into normalized source-frame coordinates.
fn keypoint_to_frame(kx_model: f32, ky_model: f32, visible: f32, ctx: &DecodeContext) -> Keypoint {
    let fx = ctx
        .letterbox
        .unmap_x(kx_model)
        .clamp(0.0, (ctx.frame_width - 1) as f32);
    let fy = ctx
        .letterbox
        .unmap_y(ky_model)
        .clamp(0.0, (ctx.frame_height - 1) as f32);
    Keypoint {
        x: (fx / ctx.frame_width as f32).clamp(0.0, 1.0),
        y: (fy / ctx.frame_height as f32).clamp(0.0, 1.0),
        visible,
    }
}

// ============================================================================
// On-chip NMS output
// ============================================================================

/// Decode the single NMS output buffer: `num_classes x max_bboxes_per_class`
/// slots of `[y_min, x_min, y_max, x_max, score, (kx, ky, kconf)...]`, all
/// normalized to the model input plane.
///
/// The params-per-slot stride is derived from the buffer size; when it
/// disagrees with the documented `5 + 3*num_keypoints`, the derived value
/// wins (some NMS emitters pad slots).
pub fn decode_nms_output(
    output: &[f32],
    num_classes: usize,
    max_bboxes_per_class: usize,
    ctx: &DecodeContext,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    let total_slots = num_classes * max_bboxes_per_class;
    if total_slots == 0 {
        return detections;
    }

    let derived_params = output.len() / total_slots;
    let keypoint_params = if ctx.task == ModelTask::Pose {
        ctx.num_keypoints * 3
    } else {
        0
    };
    let expected_params = 5 + keypoint_params;

    let det_params = if derived_params > 0 && derived_params != expected_params {
        debug!(
            derived = derived_params,
            expected = expected_params,
            "NMS slot stride differs from documented layout, using derived value"
        );
        derived_params
    } else {
        expected_params
    };

    // Keypoints can only come out of the slot tail that actually exists.
    let slot_keypoints = if det_params > 5 {
        ctx.num_keypoints.min((det_params - 5) / 3)
    } else {
        0
    };

    for cls in 0..num_classes {
        for slot in 0..max_bboxes_per_class {
            let offset = (cls * max_bboxes_per_class + slot) * det_params;
            if offset + 5 > output.len() {
                break;
            }

            let y_min = output[offset];
            let x_min = output[offset + 1];
            let y_max = output[offset + 2];
            let x_max = output[offset + 3];
            let score = output[offset + 4];

            if score < ctx.confidence_threshold {
                continue;
            }

            // Normalized-to-input -> model pixels -> source frame.
            let x1 = ctx.letterbox.unmap_x(x_min * ctx.input_width as f32);
            let y1 = ctx.letterbox.unmap_y(y_min * ctx.input_height as f32);
            let x2 = ctx.letterbox.unmap_x(x_max * ctx.input_width as f32);
            let y2 = ctx.letterbox.unmap_y(y_max * ctx.input_height as f32);

            let Some(bbox) = bbox_from_corners(x1, y1, x2, y2, ctx.frame_width, ctx.frame_height)
            else {
                continue;
            };

            let mut keypoints = Vec::with_capacity(slot_keypoints);
            for k in 0..slot_keypoints {
                let kp_offset = offset + 5 + k * 3;
                if kp_offset + 3 > output.len() {
                    break;
                }
                let kx_model = output[kp_offset] * ctx.input_width as f32;
                let ky_model = output[kp_offset + 1] * ctx.input_height as f32;
                keypoints.push(keypoint_to_frame(
                    kx_model,
                    ky_model,
                    output[kp_offset + 2],
                    ctx,
                ));
            }

            detections.push(Detection {
                class_name: labels::class_name(ctx.labels, cls as i32),
                class_id: cls as i32,
                confidence: score,
                bbox,
                keypoints,
                event_setting_ids: Vec::new(),
            });
        }
    }

    detections
}

// ============================================================================
// Raw multi-scale YOLO-pose head
// ============================================================================

struct ScaleSlot {
    stride: u32,
    dfl: usize,
    class: usize,
    keypoints: Option<usize>,
}

/// Identify the DFL/class/keypoint output triple of each pyramid scale by
/// tensor name. Sizes collide between roles when the class count lines up
/// with keypoint channels, names never do.
fn map_scales(names: &[String]) -> Vec<ScaleSlot> {
    let mut scales = Vec::new();

    for (scale_idx, convs) in SCALE_NAMES.iter().enumerate() {
        let find = |conv: &str| names.iter().position(|n| n.contains(conv));
        let dfl = find(convs[0]);
        let class = find(convs[1]);
        let keypoints = find(convs[2]);

        if let (Some(dfl), Some(class)) = (dfl, class) {
            scales.push(ScaleSlot {
                stride: STRIDES[scale_idx],
                dfl,
                class,
                keypoints,
            });
        }
    }

    scales
}

/// Softmax-weighted expectation of one DFL edge distribution, in stride
/// units. `edges` is one cell's `[L0..15, T0..15, R0..15, B0..15]` block.
fn decode_dfl_edge(edges: &[f32], edge_idx: usize) -> f32 {
    let bins = &edges[edge_idx * REG_MAX..(edge_idx + 1) * REG_MAX];
    let max = bins.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut weighted = 0.0f32;
    let mut total = 0.0f32;
    for (i, &v) in bins.iter().enumerate() {
        let w = ((v - max) * DFL_TEMPERATURE).exp();
        weighted += w * i as f32;
        total += w;
    }
    weighted / total
}

struct Candidate {
    corners: [f32; 4],
    score: f32,
    class_id: i32,
    keypoints: Vec<[f32; 3]>,
}

/// Decode the raw multi-scale head: per active scale, per grid cell, class
/// argmax, DFL box around the cell-center anchor, and keypoints at
/// `(g + raw*2) * stride`; then class-agnostic NMS over all scales.
pub fn decode_raw_yolo(outputs: &[Vec<f32>], names: &[String], ctx: &DecodeContext) -> Vec<Detection> {
    let scales = map_scales(names);
    if scales.is_empty() {
        warn!("no pyramid scales recognized among {} outputs", names.len());
        return Vec::new();
    }

    let mut candidates: Vec<Candidate> = Vec::new();

    for scale in &scales {
        let grid_w = (ctx.input_width / scale.stride) as usize;
        let grid_h = (ctx.input_height / scale.stride) as usize;
        let cells = grid_w * grid_h;
        if cells == 0 {
            continue;
        }

        let dfl_data = &outputs[scale.dfl];
        let class_data = &outputs[scale.class];
        let kp_data = scale.keypoints.map(|idx| &outputs[idx]);

        let num_classes = class_data.len() / cells;
        let kp_per_cell = kp_data.map(|d| d.len() / cells).unwrap_or(0);
        let cell_keypoints = kp_per_cell / 3;

        if num_classes == 0 || dfl_data.len() < cells * DFL_CHANNELS {
            warn!(
                stride = scale.stride,
                "scale output sizes do not cover the grid, skipping"
            );
            continue;
        }

        for gy in 0..grid_h {
            for gx in 0..grid_w {
                let cell = gy * grid_w + gx;
                let class_base = cell * num_classes;

                let mut best_score = 0.0f32;
                let mut best_class = 0usize;
                for c in 0..num_classes {
                    let score = maybe_sigmoid(class_data[class_base + c]);
                    if score > best_score {
                        best_score = score;
                        best_class = c;
                    }
                }

                if best_score < ctx.confidence_threshold {
                    continue;
                }

                let dfl_base = cell * DFL_CHANNELS;
                let edges = &dfl_data[dfl_base..dfl_base + DFL_CHANNELS];
                let stride = scale.stride as f32;
                let dist_left = decode_dfl_edge(edges, 0) * stride;
                let dist_top = decode_dfl_edge(edges, 1) * stride;
                let dist_right = decode_dfl_edge(edges, 2) * stride;
                let dist_bottom = decode_dfl_edge(edges, 3) * stride;

                let anchor_x = (gx as f32 + 0.5) * stride;
                let anchor_y = (gy as f32 + 0.5) * stride;

                let x1 = anchor_x - dist_left;
                let y1 = anchor_y - dist_top;
                let x2 = anchor_x + dist_right;
                let y2 = anchor_y + dist_bottom;

                // Degenerate or fully outside the input plane.
                if x2 <= 0.0 || y2 <= 0.0 || x1 >= ctx.input_width as f32 || y1 >= ctx.input_height as f32
                {
                    continue;
                }
                if x2 - x1 <= 0.0 || y2 - y1 <= 0.0 {
                    continue;
                }

                let mut keypoints = Vec::with_capacity(cell_keypoints);
                if let Some(kp_data) = kp_data {
                    let kp_base = cell * kp_per_cell;
                    for k in 0..cell_keypoints {
                        let kx_raw = kp_data[kp_base + k * 3];
                        let ky_raw = kp_data[kp_base + k * 3 + 1];
                        let visible = maybe_sigmoid(kp_data[kp_base + k * 3 + 2]);

                        let kx = (gx as f32 + kx_raw * 2.0) * stride;
                        let ky = (gy as f32 + ky_raw * 2.0) * stride;
                        keypoints.push([kx, ky, visible]);
                    }
                }

                candidates.push(Candidate {
                    corners: [x1, y1, x2, y2],
                    score: best_score,
                    class_id: best_class as i32,
                    keypoints,
                });
            }
        }
    }

    let boxes: Vec<[f32; 4]> = candidates.iter().map(|c| c.corners).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    let keep = apply_nms(&boxes, &scores, IOU_THRESHOLD);

    keep.into_iter()
        .filter_map(|idx| {
            let c = &candidates[idx];
            let x1 = ctx.letterbox.unmap_x(c.corners[0]);
            let y1 = ctx.letterbox.unmap_y(c.corners[1]);
            let x2 = ctx.letterbox.unmap_x(c.corners[2]);
            let y2 = ctx.letterbox.unmap_y(c.corners[3]);

            let bbox = bbox_from_corners(x1, y1, x2, y2, ctx.frame_width, ctx.frame_height)?;

            let keypoints = c
                .keypoints
                .iter()
                .map(|kp| keypoint_to_frame(kp[0], kp[1], kp[2], ctx))
                .collect();

            Some(Detection {
                class_name: labels::class_name(ctx.labels, c.class_id),
                class_id: c.class_id,
                confidence: c.score,
                bbox,
                keypoints,
                event_setting_ids: Vec::new(),
            })
        })
        .collect()
}

/// Class-agnostic non-maximum suppression. Boxes are `[x1, y1, x2, y2]`;
/// returns kept indices ordered by descending score.
pub fn apply_nms(boxes: &[[f32; 4]], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; scores.len()];

    for (pos, &idx) in order.iter().enumerate() {
        if suppressed[idx] {
            continue;
        }
        keep.push(idx);

        let a = &boxes[idx];
        let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);

        for &jdx in &order[pos + 1..] {
            if suppressed[jdx] {
                continue;
            }
            let b = &boxes[jdx];

            let x1 = a[0].max(b[0]);
            let y1 = a[1].max(b[1]);
            let x2 = a[2].min(b[2]);
            let y2 = a[3].min(b[3]);

            let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
            let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
            let union = area_a + area_b - inter;
            let iou = if union > 0.0 { inter / union } else { 0.0 };

            if iou > iou_threshold {
                suppressed[jdx] = true;
            }
        }
    }

    keep
}
