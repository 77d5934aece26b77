use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::datatype::{self, Header, Record, Series, Unit, Vector};
use crate::error::{MiicError, MiicResult};
use crate::signal::{analytic_signal, gaussian_bandpass};
use crate::trace_data::{StoreClient, Stream, Trace};
use crate::utils::{seconds_to_duration, timestamp, utc_from_timestamp};

/// Magnitude of the analytic signal.
pub fn envelope(data: ArrayView1<f64>) -> Array1<f64> {
    analytic_signal(data).mapv(|c| c.norm())
}

//=====================================================================
// Envelopes of a stream band-passed with a Gaussian around `freq`.
// Traces are processed piecewise between NaN gaps.
//=====================================================================
#[derive(Debug, Clone, PartialEq)]
pub struct Envelopes {
    pub stream: Stream,
    pub freq: f64,
    pub bandwidth_factor: f64,
}

impl Envelopes {
    pub fn from_stream(stream: &Stream, freq: f64, bandwidth_factor: f64) -> MiicResult<Self> {
        let mut pieces = Vec::new();
        for trace in stream.iter() {
            for piece in trace.split() {
                let filtered = gaussian_bandpass(piece.data.view(), piece.stats.sampling_rate, freq, bandwidth_factor)?;
                pieces.push(Trace::new(piece.stats.clone(), envelope(filtered.view())));
            }
        }
        let mut envelopes = Stream::from(pieces);
        envelopes.merge();
        Ok(Self { stream: envelopes, freq, bandwidth_factor })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayleighFit {
    pub sigma: f64,
    pub rms: f64,
    pub misfit: f64,
}

impl RayleighFit {
    const NAN: RayleighFit = RayleighFit { sigma: f64::NAN, rms: f64::NAN, misfit: f64::NAN };
}

/// Least squares fit of the Rayleigh scale to every row of `samples`.
/// Sorted samples are matched against Rayleigh quantiles, only points
/// whose plotting position lies inside `percentile_range` take part.
pub fn fit_rayleigh_distribution(samples: ArrayView2<f64>, percentile_range: (f64, f64)) -> Vec<RayleighFit> {
    let (lower, upper) = percentile_range;
    samples
        .outer_iter()
        .map(|row| {
            let mut values: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
            values.sort_by(f64::total_cmp);
            let n = values.len() as f64;

            let (quantiles, selected): (Vec<f64>, Vec<f64>) = values
                .iter()
                .enumerate()
                .filter_map(|(i, &x)| {
                    let p = (i as f64 + 0.5) / n;
                    (lower..=upper).contains(&(100.0 * p)).then(|| ((-2.0 * (1.0 - p).ln()).sqrt(), x))
                })
                .unzip();
            if selected.len() < 3 {
                return RayleighFit::NAN;
            }

            let sxq: f64 = selected.iter().zip(&quantiles).map(|(x, q)| x * q).sum();
            let sqq: f64 = quantiles.iter().map(|q| q * q).sum();
            let sigma = sxq / sqq;
            let residual = selected
                .iter()
                .zip(&quantiles)
                .map(|(x, q)| (x - sigma * q).powi(2))
                .sum::<f64>()
                / selected.len() as f64;
            RayleighFit { sigma, rms: sigma * 2f64.sqrt(), misfit: residual.sqrt() / sigma }
        })
        .collect()
}

//=====================================================================
// Field amplitude estimation: Rayleigh scale of band-passed envelopes
// in fixed windows aligned to `ref_time`.
//=====================================================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldAmplitudes {
    pub freqs: Vec<f64>,
    pub bandwidth_factor: f64,
    pub percentile_range: (f64, f64),
    /// Seconds.
    pub window_length: f64,
    pub ref_time: DateTime<Utc>,
    /// Fraction of valid samples a window needs.
    pub required_data: f64,
    /// Seconds of extra data read on either side.
    pub pad: f64,
    pub calc_chi: bool,
    pub one_letter_key: bool,
}

impl Default for FieldAmplitudes {
    fn default() -> Self {
        Self {
            freqs: vec![0.5, 1.0, 2.0],
            bandwidth_factor: 0.1,
            percentile_range: (5.0, 95.0),
            window_length: 3600.0,
            ref_time: DateTime::<Utc>::UNIX_EPOCH,
            required_data: 0.8,
            pad: 600.0,
            calc_chi: false,
            one_letter_key: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeResult {
    pub network: String,
    pub station: String,
    pub freqs: Vec<f64>,
    /// Rayleigh scale per `<component>_<freq>`.
    pub sigma: BTreeMap<String, Series>,
    pub misfit: BTreeMap<String, Series>,
}

impl AmplitudeResult {
    pub fn to_records(&self) -> BTreeMap<String, Record> {
        let mut records: BTreeMap<String, Record> = BTreeMap::new();
        let freqs = Vector::new(Header::new("frequency", "f", Unit::parse("Hz").unwrap_or_default()), Array1::from(self.freqs.clone()));
        records.insert("freqs".to_string(), freqs.into());
        for (key, series) in &self.sigma {
            records.insert(format!("sigma_{}", key), series.clone().into());
        }
        for (key, series) in &self.misfit {
            records.insert(format!("misfit_{}", key), series.clone().into());
        }
        records
    }
}

impl FieldAmplitudes {
    pub fn validate(&self) -> MiicResult<()> {
        if self.freqs.is_empty() || self.freqs.iter().any(|f| *f <= 0.0) {
            return Err(MiicError::invalid(format!("frequencies must be positive, got {:?}", self.freqs)));
        }
        if !(self.required_data > 0.0 && self.required_data <= 1.0) {
            return Err(MiicError::invalid(format!("required_data must be in (0, 1], got {}", self.required_data)));
        }
        if self.window_length <= 0.0 || self.bandwidth_factor <= 0.0 || self.pad < 0.0 {
            return Err(MiicError::invalid("window length and bandwidth factor must be positive"));
        }
        let (lower, upper) = self.percentile_range;
        if !(0.0 <= lower && lower < upper && upper <= 100.0) {
            return Err(MiicError::invalid(format!("invalid percentile range {:?}", self.percentile_range)));
        }
        Ok(())
    }

    /// Starts of the windows aligned to `ref_time` that lie inside `[start, end)`.
    pub fn window_starts(&self, start: &DateTime<Utc>, end: &DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let reference = timestamp(&self.ref_time);
        let first = reference + ((timestamp(start) - reference) / self.window_length - 1e-9).ceil() * self.window_length;
        let last = timestamp(end) + 1e-6;
        (0..)
            .map(|i| first + i as f64 * self.window_length)
            .take_while(|t| t + self.window_length <= last)
            .map(utc_from_timestamp)
            .collect()
    }

    fn component_key(&self, trace: &Trace) -> String {
        if self.one_letter_key {
            trace.stats.channel.chars().last().map(String::from).unwrap_or_default()
        } else {
            trace.stats.channel.clone()
        }
    }

    // Window samples of `trace`, one row per window, NaN where data is missing
    fn window_matrix(&self, trace: &Trace, starts: &[DateTime<Utc>]) -> Array2<f64> {
        let sampling_rate = trace.stats.sampling_rate;
        let nwin = (self.window_length * sampling_rate).round() as usize;
        let mut windows = Array2::from_elem((starts.len(), nwin), f64::NAN);
        let trace_start = timestamp(&trace.stats.starttime);
        for (mut row, start) in windows.outer_iter_mut().zip(starts) {
            let offset = ((timestamp(start) - trace_start) * sampling_rate).round() as i64;
            for (k, slot) in row.iter_mut().enumerate() {
                let idx = offset + k as i64;
                if idx >= 0 && (idx as usize) < trace.npts() {
                    *slot = trace.data[idx as usize];
                }
            }
            let valid = row.iter().filter(|v| !v.is_nan()).count();
            if (valid as f64) < self.required_data * nwin as f64 {
                row.fill(f64::NAN);
            }
        }
        windows
    }

    pub fn estimate(&self, stream: &Stream, start: &DateTime<Utc>, end: &DateTime<Utc>) -> MiicResult<AmplitudeResult> {
        self.validate()?;
        let first = stream.first().ok_or_else(|| MiicError::NoData(format!("no waveforms between {} and {}", start, end)))?;
        let starts = self.window_starts(start, end);
        if starts.is_empty() {
            return Err(MiicError::NoData(format!("no complete window between {} and {}", start, end)));
        }

        let mut merged = stream.clone();
        merged.merge();
        let mut result = AmplitudeResult {
            network: first.stats.network.clone(),
            station: first.stats.station.clone(),
            freqs: self.freqs.clone(),
            sigma: BTreeMap::new(),
            misfit: BTreeMap::new(),
        };

        for &freq in &self.freqs {
            let envelopes = Envelopes::from_stream(&merged, freq, self.bandwidth_factor)?;
            for trace in envelopes.stream.iter() {
                let key = format!("{}_{}", self.component_key(trace), freq);
                if let Some(kept) = result.sigma.get(&key) {
                    warn!(
                        "Component key {} of {} collides with {}, keeping the first estimate",
                        key,
                        trace.id(),
                        kept.meta.description
                    );
                    continue;
                }
                let fits = fit_rayleigh_distribution(self.window_matrix(trace, &starts).view(), self.percentile_range);
                let delta = seconds_to_duration(self.window_length);
                let description = format!("{} at {} Hz", trace.id(), freq);

                let sigma = Array1::from_iter(fits.iter().map(|fit| fit.sigma));
                let meta = Header::new("field amplitude", "sigma", Unit::dimensionless()).with_description(description.clone());
                result.sigma.insert(key.clone(), Series::new(meta, starts[0], delta, sigma)?);
                if self.calc_chi {
                    let misfit = Array1::from_iter(fits.iter().map(|fit| fit.misfit));
                    let meta = Header::dimensionless("Rayleigh misfit").with_description(description);
                    result.misfit.insert(key, Series::new(meta, starts[0], delta, misfit)?);
                }
            }
        }
        Ok(result)
    }
}

//=====================================================================
// Field amplitudes of stations in a waveform store.
//=====================================================================
#[derive(Clone)]
pub struct FaClient {
    pub store: StoreClient,
    pub params: FieldAmplitudes,
}

impl FaClient {
    pub fn new(store: StoreClient, params: FieldAmplitudes) -> MiicResult<Self> {
        params.validate()?;
        Ok(Self { store, params })
    }

    async fn padded_waveforms(&self, network: &str, station: &str, location: &str, channel: &str, start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<Stream> {
        let pad = seconds_to_duration(self.params.pad);
        self.store.get_waveforms(network, station, location, channel, &(*start - pad), &(*end + pad)).await
    }

    pub async fn compute(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<AmplitudeResult> {
        let stream = self.padded_waveforms(network, station, location, channel, start, end).await?;
        let result = self
            .params
            .estimate(&stream, start, end)
            .with_context(|| format!("Field amplitudes of {}.{} failed", network, station))?;
        Ok(result)
    }

    /// Download concurrently, then estimate in parallel. Stations without
    /// data or with failing estimates are logged and left out.
    pub async fn compute_bulk(
        &self,
        stations: &[(String, String)],
        location: &str,
        channel: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        concurrency: usize,
    ) -> BTreeMap<String, AmplitudeResult> {
        let streams: Vec<(String, Stream)> = futures::stream::iter(stations)
            .map(|(network, station)| async move {
                let stream = self
                    .padded_waveforms(network, station, location, channel, start, end)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("No waveforms for {}.{}: {:#}", network, station, e);
                        Stream::new()
                    });
                (format!("{}.{}", network, station), stream)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let results: DashMap<String, AmplitudeResult> = DashMap::new();
        streams.par_iter().filter(|(_, stream)| !stream.is_empty()).for_each(|(code, stream)| {
            match self.params.estimate(stream, start, end) {
                Ok(result) => {
                    results.insert(code.clone(), result);
                }
                Err(e) => warn!("Field amplitudes of {} failed: {}", code, e),
            }
        });
        info!("Estimated field amplitudes for {} of {} stations", results.len(), stations.len());
        results.into_iter().collect()
    }

    /// Write `FA-NET.STA.miic` into `dir`.
    pub fn save<P: AsRef<Path>>(&self, result: &AmplitudeResult, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("FA-{}.{}.miic", result.network, result.station));
        datatype::save(&path, &result.to_records())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::f64::consts::PI;

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use chrono::Duration;
    use tempfile::tempdir;

    use crate::trace_data::{FsClient, Stats};
    use crate::utils::testing::{gaussian_noise, synthetic_sds_root, FIXTURE_START};

    #[test]
    fn test_envelope_of_sine() {
        let data = Array1::from_iter((0..2000).map(|i| 2.0 * (2.0 * PI * 0.05 * i as f64).sin()));
        let env = envelope(data.view());
        for i in 200..1800 {
            assert_abs_diff_eq!(env[i], 2.0, epsilon = 0.05);
        }
    }

    #[test]
    fn test_rayleigh_fit_on_exact_quantiles() {
        let n = 200;
        let sigma = 3.5;
        let row: Vec<f64> = (0..n)
            .rev()
            .map(|i| {
                let p = (i as f64 + 0.5) / n as f64;
                sigma * (-2.0 * (1.0 - p).ln()).sqrt()
            })
            .collect();
        let mut samples = Array2::from_elem((3, n), f64::NAN);
        samples.row_mut(0).assign(&Array1::from(row.clone()));
        samples.row_mut(1).slice_mut(ndarray::s![..2]).assign(&Array1::from(row[..2].to_vec()));

        let fits = fit_rayleigh_distribution(samples.view(), (0.0, 100.0));
        assert_relative_eq!(fits[0].sigma, sigma, max_relative = 1e-12);
        assert_relative_eq!(fits[0].rms, sigma * 2f64.sqrt(), max_relative = 1e-12);
        assert!(fits[0].misfit < 1e-12);
        assert!(fits[1].sigma.is_nan());
        assert!(fits[2].sigma.is_nan());
    }

    #[test]
    fn test_rayleigh_fit_recovers_noise_envelope() {
        let n = 20000;
        let (a, b) = (gaussian_noise(n, 11), gaussian_noise(n, 12));
        let amplitude = Array1::from_iter(a.iter().zip(b.iter()).map(|(x, y)| 3.0 * (x * x + y * y).sqrt()));
        let samples = amplitude.insert_axis(ndarray::Axis(0));
        let fit = fit_rayleigh_distribution(samples.view(), (5.0, 95.0))[0];
        assert_relative_eq!(fit.sigma, 3.0, max_relative = 0.03);
        assert!(fit.misfit < 0.05);
    }

    #[test]
    fn test_window_starts_are_aligned() {
        let params = FieldAmplitudes { window_length: 3600.0, ..Default::default() };
        let start = *FIXTURE_START + Duration::minutes(30);
        let starts = params.window_starts(&start, &(*FIXTURE_START + Duration::hours(4)));
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0], *FIXTURE_START + Duration::hours(1));
        assert!(FieldAmplitudes { required_data: 0.0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_estimate_marks_gaps() {
        let params = FieldAmplitudes { freqs: vec![0.1, 0.2], bandwidth_factor: 0.2, calc_chi: true, ..Default::default() };
        let client = FsClient::new(synthetic_sds_root());
        let start = *FIXTURE_START + Duration::hours(6);
        let end = *FIXTURE_START + Duration::hours(18);
        let stream = client
            .get_waveforms("GR", "GRA2", "*", "*", &(start - Duration::minutes(10)), &(end + Duration::minutes(10)))
            .unwrap();

        let result = params.estimate(&stream, &start, &end).unwrap();
        assert_eq!(result.sigma.keys().collect::<Vec<_>>(), vec!["Z_0.1", "Z_0.2"]);
        let sigma = &result.sigma["Z_0.1"];
        assert_eq!(sigma.len(), 12);
        assert_eq!(sigma.start, start);
        for (i, value) in sigma.data.iter().enumerate() {
            if i == 6 {
                assert!(value.is_nan());
            } else {
                assert!(value.is_finite() && *value > 0.0);
            }
        }
        assert_eq!(result.misfit.len(), 2);
        assert_eq!(result.to_records().len(), 5);
    }

    #[test]
    fn test_one_letter_key_collision_keeps_first() {
        let start = *FIXTURE_START;
        let end = start + Duration::hours(2);
        let npts = 3 * 3600;
        let stream: Stream = ["BHZ", "HHZ"]
            .iter()
            .enumerate()
            .map(|(i, cha)| {
                let stats = Stats::new("GR", "GRA1", "", cha, start - Duration::minutes(30), 1.0);
                Trace::new(stats, gaussian_noise(npts, 20 + i as u64) * (1.0 + 9.0 * i as f64))
            })
            .collect();

        let params = FieldAmplitudes { freqs: vec![0.1], ..Default::default() };
        let result = params.estimate(&stream, &start, &end).unwrap();
        assert_eq!(result.sigma.keys().collect::<Vec<_>>(), vec!["Z_0.1"]);
        assert!(result.sigma["Z_0.1"].meta.description.starts_with("GR.GRA1..BHZ"));

        let params = FieldAmplitudes { one_letter_key: false, ..params };
        let result = params.estimate(&stream, &start, &end).unwrap();
        assert_eq!(result.sigma.keys().collect::<Vec<_>>(), vec!["BHZ_0.1", "HHZ_0.1"]);
        assert!(result.sigma["HHZ_0.1"].data[0] > 5.0 * result.sigma["BHZ_0.1"].data[0]);
    }

    #[tokio::test]
    async fn test_fa_client_bulk_and_save() {
        let store = StoreClient::new(synthetic_sds_root(), None, true);
        let params = FieldAmplitudes { freqs: vec![0.1], window_length: 1800.0, pad: 300.0, ..Default::default() };
        let client = FaClient::new(store, params).unwrap();
        let start = *FIXTURE_START + Duration::hours(20);
        let end = start + Duration::hours(3);

        let stations = vec![
            ("GR".to_string(), "GRA1".to_string()),
            ("GR".to_string(), "GRA2".to_string()),
            ("XX".to_string(), "NONE".to_string()),
        ];
        let results = client.compute_bulk(&stations, "*", "*", &start, &end, 2).await;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["GR.GRA1", "GR.GRA2"]);
        assert_eq!(results["GR.GRA1"].sigma.len(), 2);

        let single = client.compute("GR", "GRA1", "*", "*", &start, &end).await.unwrap();
        assert_eq!(single, results["GR.GRA1"]);

        let dir = tempdir().unwrap();
        let path = client.save(&single, dir.path()).unwrap();
        assert!(path.ends_with("FA-GR.GRA1.miic"));
        let records = datatype::load(&path).unwrap();
        assert_eq!(records["sigma_Z_0.1"].as_series(), single.sigma.get("Z_0.1"));
    }
}
