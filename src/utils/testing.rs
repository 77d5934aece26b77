#![allow(clippy::await_holding_lock, unused)]

//=====================================================================
// Shared fixtures for the tests of all modules. The synthetic SDS
// archive is written once and reused by every test that needs it.
//=====================================================================

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lazy_static::lazy_static;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tempfile::TempDir;

use crate::trace_data::{write_to_sds, Encoding, Stats, Stream, Trace};

lazy_static! {
    pub static ref SYNTHETIC_SDS: Mutex<Option<TempDir>> = Mutex::new(None);
    pub static ref FIXTURE_START: DateTime<Utc> = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    pub static ref FIXTURE_GAP: (DateTime<Utc>, DateTime<Utc>) = (
        Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2021, 1, 1, 13, 0, 0).unwrap(),
    );
}

pub const FIXTURE_DAYS: i64 = 2;
pub const FIXTURE_SAMPLING_RATE: f64 = 1.0;
pub const FIXTURE_IDS: [(&str, &str, &str, &str); 3] = [
    ("GR", "GRA1", "", "HHZ"),
    ("GR", "GRA1", "", "HHN"),
    ("GR", "GRA2", "", "HHZ"),
];

// Seeded standard normal samples
pub fn gaussian_noise(npts: usize, seed: u64) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array1::from_iter((0..npts).map(|_| rng.sample::<f64, _>(StandardNormal)))
}

/// Two days of 1 Hz noise for three channels. GR.GRA2 misses one hour.
pub fn synthetic_stream() -> Stream {
    let npts = (FIXTURE_DAYS * 86400) as usize;
    let (gap_start, gap_end) = *FIXTURE_GAP;
    FIXTURE_IDS
        .iter()
        .enumerate()
        .map(|(i, (net, sta, loc, cha))| {
            let stats = Stats::new(net, sta, loc, cha, *FIXTURE_START, FIXTURE_SAMPLING_RATE);
            let mut data = gaussian_noise(npts, i as u64 + 1) * 100.0;
            if *sta == "GRA2" {
                let first = (gap_start - *FIXTURE_START).num_seconds() as usize;
                let last = (gap_end - *FIXTURE_START).num_seconds() as usize;
                data.slice_mut(ndarray::s![first..last]).fill(f64::NAN);
            }
            Trace::new(stats, data)
        })
        .collect()
}

// Root of the synthetic SDS archive, written on first use
pub fn synthetic_sds_root() -> PathBuf {
    let mut sds = SYNTHETIC_SDS.lock().unwrap();
    if sds.is_none() {
        let dir = TempDir::new().unwrap();
        write_to_sds(dir.path(), &synthetic_stream(), Encoding::Float64).unwrap();
        *sds = Some(dir);
    }
    sds.as_ref().unwrap().path().to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::utils::nan_mean_std;

    #[test]
    fn test_gaussian_noise_is_seeded_standard_normal() {
        assert_eq!(gaussian_noise(100, 4), gaussian_noise(100, 4));
        assert_ne!(gaussian_noise(100, 4), gaussian_noise(100, 5));

        let noise = gaussian_noise(50_000, 1);
        let (mean, std) = nan_mean_std(noise.iter().copied());
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.03);
        assert_abs_diff_eq!(std, 1.0, epsilon = 0.03);
        assert!(noise.iter().any(|v| v.abs() > 3.0));
    }
}
