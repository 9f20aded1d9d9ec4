use std::time::Duration;

/// Fixed retry delay with optional symmetric jitter (`jitter_frac` of the base).
pub fn fixed_jitter_delay(base: Duration, jitter_frac: f32) -> Duration {
    if jitter_frac <= 0.0 || base.is_zero() {
        return base;
    }
    let nanos = base.as_nanos() as i128;
    let jitter = ((nanos as f64) * (jitter_frac as f64)).round() as i128;
    let delta = fastrand::i128(-jitter..=jitter);
    let result = (nanos + delta).max(0) as u128;
    Duration::from_nanos(result as u64)
}
