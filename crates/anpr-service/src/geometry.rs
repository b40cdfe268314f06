use common::plates::PlateBox;

/// Intersection over Union of two axis-aligned boxes.
///
/// Boxes without area never overlap anything, so the result is 0.0 for them.
pub fn iou(a: &PlateBox, b: &PlateBox) -> f32 {
    let x1 = (a.x as u64).max(b.x as u64);
    let y1 = (a.y as u64).max(b.y as u64);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let area_a = a.area();
    let area_b = b.area();
    if area_a == 0 || area_b == 0 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = area_a + area_b - intersection;
    (intersection as f64 / union as f64) as f32
}
