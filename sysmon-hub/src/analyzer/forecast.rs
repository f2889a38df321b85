/// Least-squares line through `points` (x = 0, 1, ..) evaluated one step past
/// the last point. Returns `None` for fewer than two points.
pub fn linear_next(points: &[f64]) -> Option<f64> {
    let n = points.len();
    if n < 2 {
        return None;
    }

    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = points.iter().sum::<f64>() / nf;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in points.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    Some(intercept + slope * nf)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
