use chrono::{DateTime, Duration, Utc};

//====================================================================
// Assorted helper functions.
//====================================================================

// Seconds since the epoch as a float, microsecond resolution
#[inline]
pub fn timestamp(time: &DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 * 1e-6
}

#[inline]
pub fn utc_from_timestamp(timestamp: f64) -> DateTime<Utc> {
    let micros = (timestamp * 1e6).round() as i64;
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1000) as u32,
    )
    .unwrap_or_default()
}

#[inline]
pub fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::nanoseconds((seconds * 1e9).round() as i64)
}

#[inline]
pub fn duration_to_seconds(duration: Duration) -> f64 {
    match duration.num_nanoseconds() {
        Some(nanos) => nanos as f64 * 1e-9,
        None => duration.num_milliseconds() as f64 * 1e-3,
    }
}

// Shell style matching of SEED codes, supports `*` and `?`
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

// Percentile of already sorted data using linear interpolation between
// closest ranks, `q` in [0, 100]
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

// Mean and (population) standard deviation ignoring NaNs
pub fn nan_mean_std(data: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = data.into_iter().filter(|v| !v.is_nan()).collect();
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
