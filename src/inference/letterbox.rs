/// Parameters of one aspect-preserving resize into the model input plane,
/// kept for mapping detections back to the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Scale factor applied to the source
    pub scale: f32,
    /// Padding on the left (and right)
    pub pad_x: i32,
    /// Padding on the top (and bottom)
    pub pad_y: i32,
    /// Resized width before padding
    pub new_w: i32,
    /// Resized height before padding
    pub new_h: i32,
}

impl Letterbox {
    /// No-op mapping for a source that already matches the input plane.
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            scale: 1.0,
            pad_x: 0,
            pad_y: 0,
            new_w: width as i32,
            new_h: height as i32,
        }
    }

    /// Map a model-plane x coordinate back to the source frame.
    pub fn unmap_x(&self, x_model: f32) -> f32 {
        (x_model - self.pad_x as f32) / self.scale
    }

    /// Map a model-plane y coordinate back to the source frame.
    pub fn unmap_y(&self, y_model: f32) -> f32 {
        (y_model - self.pad_y as f32) / self.scale
    }

    /// Map a source-frame x coordinate into the model plane.
    pub fn map_x(&self, x_src: f32) -> f32 {
        x_src * self.scale + self.pad_x as f32
    }

    /// Map a source-frame y coordinate into the model plane.
    pub fn map_y(&self, y_src: f32) -> f32 {
        y_src * self.scale + self.pad_y as f32
    }
}

/// Gray fill used for padding and for batch slots with no frame.
pub const PAD_VALUE: u8 = 114;

/// Letterbox `src` (packed RGB8, `src_w`×`src_h`) into `dst`
/// (`dst_w`×`dst_h`): scale by `min(dst_w/src_w, dst_h/src_h)`, center, pad
/// with [`PAD_VALUE`], nearest-neighbor sampling.
///
/// `dst` must hold `dst_w * dst_h * 3` bytes.
pub fn letterbox_resize(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut [u8],
    dst_w: u32,
    dst_h: u32,
) -> Letterbox {
    let scale_w = dst_w as f32 / src_w as f32;
    let scale_h = dst_h as f32 / src_h as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((src_w as f32 * scale).round() as i32).clamp(1, dst_w as i32);
    let new_h = ((src_h as f32 * scale).round() as i32).clamp(1, dst_h as i32);

    let pad_x = (dst_w as i32 - new_w) / 2;
    let pad_y = (dst_h as i32 - new_h) / 2;

    dst.fill(PAD_VALUE);

    let x_ratio = src_w as f32 / new_w as f32;
    let y_ratio = src_h as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = ((y as f32 * y_ratio) as u32).min(src_h - 1) as usize;
        let src_row = src_y * src_w as usize * 3;
        let dst_row = ((y + pad_y) as usize * dst_w as usize + pad_x as usize) * 3;

        for x in 0..new_w {
            let src_x = ((x as f32 * x_ratio) as u32).min(src_w - 1) as usize;
            let src_idx = src_row + src_x * 3;
            let dst_idx = dst_row + x as usize * 3;
            dst[dst_idx..dst_idx + 3].copy_from_slice(&src[src_idx..src_idx + 3]);
        }
    }

    Letterbox {
        scale,
        pad_x,
        pad_y,
        new_w,
        new_h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mapping() {
        let lb = Letterbox::identity(640, 640);
        assert_eq!(lb.unmap_x(100.0), 100.0);
        assert_eq!(lb.unmap_y(5.0), 5.0);
    }

    #[test]
    fn test_wide_source_pads_vertically() {
        let src = vec![255u8; 200 * 100 * 3];
        let mut dst = vec![0u8; 100 * 100 * 3];
        let lb = letterbox_resize(&src, 200, 100, &mut dst, 100, 100);

        assert_eq!(lb.scale, 0.5);
        assert_eq!(lb.new_w, 100);
        assert_eq!(lb.new_h, 50);
        assert_eq!(lb.pad_x, 0);
        assert_eq!(lb.pad_y, 25);

        // Pad rows are gray, content rows are white.
        assert_eq!(dst[0], PAD_VALUE);
        let mid = (50 * 100 + 50) * 3;
        assert_eq!(dst[mid], 255);
        let last = (99 * 100 + 50) * 3;
        assert_eq!(dst[last], PAD_VALUE);
    }

    #[test]
    fn test_forward_inverse_round_trip() {
        let src = vec![0u8; 1920 * 1080 * 3];
        let mut dst = vec![0u8; 640 * 640 * 3];
        let lb = letterbox_resize(&src, 1920, 1080, &mut dst, 640, 640);

        // For points inside the content region, inverse then forward lands
        // within half a pixel.
        for &(mx, my) in &[(0.0f32, 180.0f32), (320.0, 320.0), (639.0, 459.0)] {
            let sx = lb.unmap_x(mx);
            let sy = lb.unmap_y(my);
            assert!((lb.map_x(sx) - mx).abs() <= 0.5);
            assert!((lb.map_y(sy) - my).abs() <= 0.5);
        }
    }

    #[test]
    fn test_new_size_rounding() {
        // 1000x748 into 640x640: scale = 0.64, 748*0.64 = 478.72 -> 479.
        let src = vec![0u8; 1000 * 748 * 3];
        let mut dst = vec![0u8; 640 * 640 * 3];
        let lb = letterbox_resize(&src, 1000, 748, &mut dst, 640, 640);
        assert_eq!(lb.new_w, 640);
        assert_eq!(lb.new_h, 479);
        assert_eq!(lb.pad_y, (640 - 479) / 2);
    }
}
