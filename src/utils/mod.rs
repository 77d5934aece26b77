mod helper_functions;
#[cfg(test)]
pub mod testing;

pub use helper_functions::{
    duration_to_seconds, has_wildcard, nan_mean_std, percentile_sorted, seconds_to_duration,
    timestamp, utc_from_timestamp, wildcard_match,
};
