use std::time::{Duration, Instant};

// Jitter spans +/- base / JITTER_DIVISOR, i.e. 20%.
const JITTER_DIVISOR: u32 = 5;

// 2^31 already saturates any realistic max backoff.
const MAX_EXPONENT: u32 = 31;

// Deadlines that do not fit in an `Instant` are pushed out this far instead.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Exponential backoff with symmetric jitter.
///
/// The delay doubles from `min_backoff` with each attempt, is capped at
/// `max_backoff`, receives up to +/-20% random jitter and is finally clamped to
/// `[min_backoff, max_backoff]`. An `attempts` value of zero counts as the first attempt.
pub fn calculate_backoff(attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Duration {
    if min_backoff >= max_backoff {
        return max_backoff;
    }

    let exponent = attempts.max(1).saturating_sub(1).min(MAX_EXPONENT);
    let base = min_backoff.saturating_mul(1 << exponent).min(max_backoff);

    let jitter = (base / JITTER_DIVISOR).mul_f64(rand::random::<f64>());
    let delay = if rand::random::<bool>() {
        base.saturating_add(jitter)
    } else {
        base.saturating_sub(jitter)
    };

    delay.clamp(min_backoff, max_backoff)
}

/// `now + delay`, saturating instead of panicking when the sum is not
/// representable.
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
