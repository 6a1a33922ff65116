//! Planar helpers for event evaluation, all in normalized frame
//! coordinates.

/// 2D point in normalized `[0, 1]` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

impl Point2D {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Ray-casting containment test. Polygons with fewer than three vertices
/// contain nothing.
pub fn point_in_polygon(point: Point2D, polygon: &[Point2D]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i].x, polygon[i].y);
        let (xj, yj) = (polygon[j].x, polygon[j].y);

        if ((yi > point.y) != (yj > point.y))
            && (point.x < (xj - xi) * (point.y - yi) / (yj - yi) + xi)
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Signed side of `p` relative to the directed line `a -> b`:
/// the 2D cross product `(b - a) x (p - a)`.
pub fn signed_side(a: Point2D, b: Point2D, p: Point2D) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Perpendicular distance from `p` to the infinite line through `a` and
/// `b`. Degenerates to point distance when `a == b`.
pub fn distance_to_line(a: Point2D, b: Point2D, p: Point2D) -> f32 {
    let len = ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
    if len <= f32::EPSILON {
        return ((p.x - a.x).powi(2) + (p.y - a.y).powi(2)).sqrt();
    }
    signed_side(a, b, p).abs() / len
}

/// Acute angle between two vectors in degrees: angles past 90 fold back
/// (`180 - angle`). `None` when either vector has no length.
pub fn acute_angle_degrees(v1: (f32, f32), v2: (f32, f32)) -> Option<f32> {
    let len1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
    let len2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
    if len1 <= f32::EPSILON || len2 <= f32::EPSILON {
        return None;
    }

    let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / (len1 * len2)).clamp(-1.0, 1.0);
    let mut angle = cos.acos().to_degrees();
    if angle > 90.0 {
        angle = 180.0 - angle;
    }
    Some(angle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point2D> {
        vec![
            Point2D::new(0.1, 0.1),
            Point2D::new(0.9, 0.1),
            Point2D::new(0.9, 0.9),
            Point2D::new(0.1, 0.9),
        ]
    }

    #[test]
    fn test_point_in_polygon() {
        assert!(point_in_polygon(Point2D::new(0.5, 0.5), &square()));
        assert!(point_in_polygon(Point2D::new(0.2, 0.4), &square()));
        assert!(!point_in_polygon(Point2D::new(0.95, 0.5), &square()));
        assert!(!point_in_polygon(Point2D::new(0.0, 0.0), &square()));
    }

    #[test]
    fn test_degenerate_polygon_contains_nothing() {
        let line = vec![Point2D::new(0.0, 0.0), Point2D::new(1.0, 1.0)];
        assert!(!point_in_polygon(Point2D::new(0.5, 0.5), &line));
        assert!(!point_in_polygon(Point2D::new(0.5, 0.5), &[]));
    }

    #[test]
    fn test_signed_side() {
        // Vertical line going down: left of it is negative.
        let a = Point2D::new(0.5, 0.0);
        let b = Point2D::new(0.5, 1.0);
        let side = signed_side(a, b, Point2D::new(0.55, 0.5));
        assert!((side - (-0.05)).abs() < 1e-6);
        assert!(signed_side(a, b, Point2D::new(0.45, 0.5)) > 0.0);
        assert_eq!(signed_side(a, b, Point2D::new(0.5, 0.7)), 0.0);
    }

    #[test]
    fn test_distance_to_line() {
        let a = Point2D::new(0.5, 0.0);
        let b = Point2D::new(0.5, 1.0);
        assert!((distance_to_line(a, b, Point2D::new(0.55, 0.5)) - 0.05).abs() < 1e-6);
        assert!((distance_to_line(a, b, Point2D::new(0.7, 0.9)) - 0.2).abs() < 1e-6);
        // Degenerate segment: point distance.
        let d = distance_to_line(a, a, Point2D::new(0.5, 0.4));
        assert!((d - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_acute_angle() {
        let a = acute_angle_degrees((1.0, 0.0), (0.0, 1.0)).unwrap();
        assert!((a - 90.0).abs() < 1e-3);

        // 135 degrees folds to 45.
        let a = acute_angle_degrees((1.0, 0.0), (-1.0, 1.0)).unwrap();
        assert!((a - 45.0).abs() < 1e-3);

        let a = acute_angle_degrees((1.0, 0.0), (1.0, 0.0)).unwrap();
        assert!(a.abs() < 1e-3);

        assert!(acute_angle_degrees((0.0, 0.0), (1.0, 0.0)).is_none());
    }

    #[test]
    fn test_angle_never_exceeds_ninety() {
        for deg in 0..360 {
            let rad = (deg as f32).to_radians();
            let v = (rad.cos(), rad.sin());
            let angle = acute_angle_degrees((1.0, 0.0), v).unwrap();
            assert!(angle <= 90.0 + 1e-3, "angle {angle} at {deg} degrees");
        }
    }
}
