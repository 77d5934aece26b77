use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Zip};
use rayon::prelude::*;
use realfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::correlate::preprocessing::{apply_fd_steps, apply_td_steps, pad_rows, zero_padding, FdStep, TdStep, ZeroPadding};
use crate::error::{MiicError, MiicResult};
use crate::logging::init_tracing;
use crate::monitor::{save_corr_bulks, CorrBulk, CorrStats, PairGeometry};
use crate::signal::{irfft, rfft, rfftfreq};
use crate::trace_data::{calc_az_baz_dist, FsClient, Inventory, Stats, StoreClient, Stream};
use crate::utils::{has_wildcard, seconds_to_duration, timestamp, wildcard_match};

//=====================================================================
// Noise cross-correlation of preprocessed waveforms. Every correlation
// window gives one row per trace combination, the rows of a station pair
// are stored together in one archive.
//=====================================================================

/// Which traces of a stream are correlated with each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum CombinationMethod {
    /// Traces of different stations.
    #[default]
    BetweenStations,
    /// Traces of the same station with different components.
    BetweenComponents,
    /// Every trace with itself.
    AutoComponents,
    /// Every pair once, autocorrelations included.
    AllSimpleCombinations,
    /// Every ordered pair.
    AllCombinations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationOptions {
    /// Network codes, paired with `station`. A list of length one is
    /// repeated to the length of the other.
    pub network: Vec<String>,
    pub station: Vec<String>,
    pub channel: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Seconds of data read at once.
    pub read_len: f64,
    /// Length of one correlation window in seconds.
    pub corr_len: f64,
    /// Seconds between the starts of two correlation windows.
    pub corr_inc: f64,
    /// Maximum lag kept on each side of zero in seconds.
    pub length_to_save: f64,
    /// Shift the correlations so that zero lag is the same instant for both
    /// traces.
    pub center_correlation: bool,
    pub normalize_correlation: bool,
    pub combination_method: CombinationMethod,
    pub zero_padding: ZeroPadding,
    pub td_preprocessing: Vec<TdStep>,
    pub fd_preprocessing: Vec<FdStep>,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        // 2021-01-01 and 2021-02-01
        let start_date = DateTime::from_timestamp(1_609_459_200, 0).unwrap_or_default();
        let end_date = DateTime::from_timestamp(1_612_137_600, 0).unwrap_or_default();
        Self {
            network: vec!["*".to_string()],
            station: vec!["*".to_string()],
            channel: "*".to_string(),
            start_date,
            end_date,
            read_len: 86400.0,
            corr_len: 3600.0,
            corr_inc: 3600.0,
            length_to_save: 100.0,
            center_correlation: true,
            normalize_correlation: true,
            combination_method: CombinationMethod::BetweenStations,
            zero_padding: ZeroPadding::AvoidWrapFastLen,
            td_preprocessing: vec![TdStep::Detrend, TdStep::Taper { p: 0.01 }, TdStep::SignBit],
            fd_preprocessing: vec![
                FdStep::SpectralWhitening { joint_norm: false },
                FdStep::Filter { flimit: [0.01, 0.02, 9.0, 10.0] },
            ],
        }
    }
}

impl CorrelationOptions {
    pub fn validate(&self, sampling_rate: f64) -> MiicResult<()> {
        if self.end_date <= self.start_date {
            return Err(MiicError::invalid(format!(
                "end_date {} is not after start_date {}", self.end_date, self.start_date
            )));
        }
        for (name, value) in [("read_len", self.read_len), ("corr_len", self.corr_len), ("corr_inc", self.corr_inc)] {
            if value <= 0.0 {
                return Err(MiicError::invalid(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.read_len < self.corr_len {
            return Err(MiicError::invalid(format!(
                "read_len ({} s) is shorter than corr_len ({} s)", self.read_len, self.corr_len
            )));
        }
        if self.length_to_save < 0.0 || self.length_to_save >= self.corr_len {
            return Err(MiicError::invalid(format!(
                "length_to_save must be in [0, corr_len), got {}", self.length_to_save
            )));
        }
        self.station_pairs()?;

        let nyquist = sampling_rate / 2.0;
        for step in &self.fd_preprocessing {
            if let FdStep::Filter { flimit } = step {
                if flimit[3] > nyquist {
                    return Err(MiicError::Frequency(format!(
                        "upper corner {} Hz is above the Nyquist frequency ({} Hz)", flimit[3], nyquist
                    )));
                }
            }
        }
        Ok(())
    }

    /// Network and station patterns paired up.
    pub fn station_pairs(&self) -> MiicResult<Vec<(String, String)>> {
        let (nnet, nsta) = (self.network.len(), self.station.len());
        let pairs = match (nnet, nsta) {
            (0, _) | (_, 0) => Vec::new(),
            (n, m) if n == m => self.network.iter().cloned().zip(self.station.iter().cloned()).collect(),
            (1, _) => self.station.iter().map(|sta| (self.network[0].clone(), sta.clone())).collect(),
            (_, 1) => self.network.iter().map(|net| (net.clone(), self.station[0].clone())).collect(),
            _ => {
                return Err(MiicError::invalid(format!(
                    "{} network and {} station codes, the lists need the same length or one of them length 1",
                    nnet, nsta
                )))
            }
        };
        if pairs.is_empty() {
            return Err(MiicError::invalid("no network and station codes given"));
        }
        Ok(pairs)
    }

    /// Start of every correlation window that fits between `start_date`
    /// and `end_date`.
    pub fn windows(&self) -> Vec<DateTime<Utc>> {
        let inc = seconds_to_duration(self.corr_inc);
        let len = seconds_to_duration(self.corr_len);
        let mut starts = Vec::new();
        let mut start = self.start_date;
        while start + len <= self.end_date {
            starts.push(start);
            start += inc;
        }
        starts
    }
}

fn component(stats: &Stats) -> Option<char> {
    stats.channel.chars().last()
}

/// Index pairs of the traces in `stream` that are correlated.
pub fn calc_cross_combis(stream: &Stream, method: CombinationMethod) -> Vec<(usize, usize)> {
    let n = stream.len();
    let mut combis = Vec::new();
    for i in 0..n {
        let first = &stream[i].stats;
        match method {
            CombinationMethod::BetweenStations => combis.extend(
                (i + 1..n)
                    .filter(|&j| first.network != stream[j].stats.network || first.station != stream[j].stats.station)
                    .map(|j| (i, j)),
            ),
            CombinationMethod::BetweenComponents => combis.extend(
                (i + 1..n)
                    .filter(|&j| {
                        let second = &stream[j].stats;
                        first.network == second.network
                            && first.station == second.station
                            && component(first) != component(second)
                    })
                    .map(|j| (i, j)),
            ),
            CombinationMethod::AutoComponents => combis.push((i, i)),
            CombinationMethod::AllSimpleCombinations => combis.extend((i..n).map(|j| (i, j))),
            CombinationMethod::AllCombinations => combis.extend((0..n).map(|j| (i, j))),
        }
    }
    combis
}

/// Metadata of the correlation of `first` with `second`. Codes are joined
/// with `-`, the location codes are dropped. The pair geometry is taken
/// from `inventory` when both stations are listed.
pub fn combine_stats(first: &Stats, second: &Stats, inventory: Option<&Inventory>) -> CorrStats {
    let geometry = inventory.and_then(|inv| {
        let source = inv.get_station(&first.network, &first.station)?;
        let receiver = inv.get_station(&second.network, &second.station)?;
        let (az, baz, dist) = calc_az_baz_dist(source.latitude, source.longitude, receiver.latitude, receiver.longitude);
        Some(PairGeometry {
            stla: source.latitude,
            stlo: source.longitude,
            stel: source.elevation,
            evla: receiver.latitude,
            evlo: receiver.longitude,
            evel: receiver.elevation,
            dist: dist / 1000.0,
            az,
            baz,
        })
    });
    if geometry.is_none() {
        debug!("No station coordinates for {}.{} and {}.{}", first.network, first.station, second.network, second.station);
    }
    CorrStats {
        network: format!("{}-{}", first.network, second.network),
        station: format!("{}-{}", first.station, second.station),
        channel: format!("{}-{}", first.channel, second.channel),
        sampling_rate: first.sampling_rate,
        geometry,
        ..Default::default()
    }
}

// 2 sum |X|^2 - |X_0|^2, the energy of the trace times its length
fn spectral_energy(spectrum: ArrayView1<Complex64>) -> f64 {
    2.0 * spectrum.iter().map(|c| c.norm_sqr()).sum::<f64>() - spectrum[0].norm_sqr()
}

/// Correlate the rows of `data` for every index pair in `combis`.
///
/// `offsets` holds the start time of every row in seconds. Each output row
/// covers `length_to_save` seconds of lag on both sides, the second value
/// is the lag of its first sample.
pub fn pxcorr(
    data: ArrayView2<f64>,
    offsets: &[f64],
    combis: &[(usize, usize)],
    sampling_rate: f64,
    options: &CorrelationOptions,
) -> MiicResult<(Array2<f64>, Vec<f64>)> {
    if offsets.len() != data.nrows() {
        return Err(MiicError::shape(&[data.nrows()], &[offsets.len()]));
    }
    if let Some(&(i, j)) = combis.iter().find(|(i, j)| *i >= data.nrows() || *j >= data.nrows()) {
        return Err(MiicError::invalid(format!("combination ({}, {}) of {} traces", i, j, data.nrows())));
    }
    let nfft = zero_padding(data.ncols(), options.zero_padding, sampling_rate, options.length_to_save);
    let n_save = (options.length_to_save * sampling_rate).ceil() as usize;
    if 2 * n_save + 1 > nfft {
        return Err(MiicError::invalid(format!(
            "{} lag samples do not fit into {} padded samples", 2 * n_save + 1, nfft
        )));
    }

    let padded = pad_rows(data, nfft);
    let rows = (0..padded.nrows())
        .into_par_iter()
        .map(|i| rfft(padded.row(i)))
        .collect::<MiicResult<Vec<_>>>()?;
    let mut spectra = Array2::zeros((rows.len(), nfft / 2 + 1));
    for (mut target, row) in spectra.outer_iter_mut().zip(rows) {
        target.assign(&row);
    }
    let freqs = rfftfreq(nfft, 1.0 / sampling_rate);
    apply_fd_steps(&mut spectra, &options.fd_preprocessing, freqs.view(), nfft)?;

    let correlations = combis
        .par_iter()
        .map(|&(i, j)| -> MiicResult<(Array1<f64>, f64)> {
            let mut offset = offsets[i] - offsets[j];
            let roffset = if options.center_correlation {
                0.0
            } else {
                (offset * sampling_rate).trunc() / sampling_rate
            };
            offset -= roffset;

            let (first, second) = (spectra.row(i), spectra.row(j));
            let norm = if options.normalize_correlation {
                (spectral_energy(first) * spectral_energy(second)).sqrt() / nfft as f64
            } else {
                1.0
            };
            let cross = Zip::from(&first).and(&second).and(&freqs).map_collect(|a, b, f| {
                a.conj() * b * Complex64::from_polar(1.0, 2.0 * std::f64::consts::PI * f * offset)
            });
            let full = irfft(cross.view(), nfft)?;

            let mut row = Array1::zeros(2 * n_save + 1);
            row.slice_mut(s![..n_save]).assign(&full.slice(s![nfft - n_save..]));
            row.slice_mut(s![n_save..]).assign(&full.slice(s![..=n_save]));
            if norm > 0.0 {
                row /= norm;
            }
            Ok((row, -(n_save as f64) / sampling_rate - roffset))
        })
        .collect::<MiicResult<Vec<_>>>()?;

    let mut result = Array2::zeros((combis.len(), 2 * n_save + 1));
    let mut start_lags = Vec::with_capacity(combis.len());
    for (mut target, (row, start_lag)) in result.outer_iter_mut().zip(correlations) {
        target.assign(&row);
        start_lags.push(start_lag);
    }
    Ok((result, start_lags))
}

// Rows of one channel combination collected over the windows
struct CorrRows {
    stats: CorrStats,
    rows: Vec<Array1<f64>>,
}

pub struct Correlator {
    pub options: Options,
    /// Network and station codes with the wildcards resolved.
    pub stations: Vec<(String, String)>,
    pub client: FsClient,
    pub inventory: Inventory,
    pub outdir: PathBuf,
}

impl Correlator {
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;
        init_tracing(options.debug, Some(options.log_dir().as_path()))?;

        let outdir = options.corr_dir();
        fs::create_dir_all(&outdir).with_context(|| format!("Failed to create {}", outdir.display()))?;

        let indir = options.sds_root.join(&options.preprocess.outfolder);
        let store = StoreClient::new(&indir, None, true);
        let mut stations = Vec::new();
        for (net, sta) in options.co.station_pairs()? {
            if has_wildcard(&net) || has_wildcard(&sta) {
                let found = store.available_stations(&net)?;
                stations.extend(found.into_iter().filter(|(_, code)| wildcard_match(&sta, code)));
            } else {
                stations.push((net, sta));
            }
        }
        stations.sort();
        stations.dedup();

        let inventory = StoreClient::new(&options.sds_root, None, true).read_inventory()?;
        info!(
            "Correlating {} station(s) from {}, {} window(s) of {} s",
            stations.len(), indir.display(), options.co.windows().len(), options.co.corr_len
        );
        Ok(Self { client: FsClient::new(indir), options, stations, inventory, outdir })
    }

    fn read(&self, start: &DateTime<Utc>, end: &DateTime<Utc>) -> Stream {
        let channel = &self.options.co.channel;
        let mut stream = Stream::new();
        for (net, sta) in &self.stations {
            match self.client.get_waveforms(net, sta, "*", channel, start, end) {
                Ok(traces) => stream.extend(traces),
                Err(e) => warn!("No data for {}.{} from {} to {}: {:#}", net, sta, start, end, e),
            }
        }
        stream.merge();
        stream
    }

    /// Correlations of all combinations in the window starting at `start`.
    /// Traces with gaps in the window are left out.
    pub fn correlate_window(&self, stream: &Stream, start: &DateTime<Utc>) -> MiicResult<Vec<(CorrStats, Array1<f64>)>> {
        let co = &self.options.co;
        let end = *start + seconds_to_duration(co.corr_len);
        let mut window = stream.clone();
        window.trim(start, &end);
        let Some(sampling_rate) = window.first().map(|tr| tr.stats.sampling_rate) else {
            return Ok(Vec::new());
        };
        if let Some(other) = window.iter().find(|tr| tr.stats.sampling_rate != sampling_rate) {
            return Err(MiicError::invalid(format!(
                "{} is sampled at {} Hz, {} at {} Hz", other.id(), other.stats.sampling_rate, window[0].id(), sampling_rate
            )));
        }
        let npts = (co.corr_len * sampling_rate).round() as usize;
        window.retain(|tr| tr.npts() >= npts && tr.data.iter().take(npts).all(|v| v.is_finite()));

        let combis = calc_cross_combis(&window, co.combination_method);
        if combis.is_empty() {
            return Ok(Vec::new());
        }
        let mut data = Array2::zeros((window.len(), npts));
        for (mut row, trace) in data.outer_iter_mut().zip(window.iter()) {
            row.assign(&trace.data.slice(s![..npts]));
        }
        let offsets: Vec<f64> = window.iter().map(|tr| timestamp(&tr.stats.starttime) - timestamp(start)).collect();

        apply_td_steps(&mut data, &co.td_preprocessing, sampling_rate)?;
        let (correlations, start_lags) = pxcorr(data.view(), &offsets, &combis, sampling_rate, co)?;

        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(combis.len());
        for ((&(i, j), row), start_lag) in combis.iter().zip(correlations.outer_iter()).zip(start_lags) {
            let mut stats = combine_stats(&window[i].stats, &window[j].stats, Some(&self.inventory));
            if !seen.insert(stats.id()) {
                warn!("Skipping {} and {}, their correlation id {} is taken", window[i].id(), window[j].id(), stats.id());
                continue;
            }
            stats.start_lag = start_lag;
            stats.corr_start = vec![*start];
            stats.corr_end = vec![end];
            result.push((stats, row.to_owned()));
        }
        Ok(result)
    }

    /// Correlate all windows and write one archive per station pair to
    /// `outdir`. Returns the written archives.
    pub fn pxcorr(&self) -> Result<Vec<PathBuf>> {
        let co = &self.options.co;
        let mut blocks: BTreeMap<i64, Vec<DateTime<Utc>>> = BTreeMap::new();
        for start in co.windows() {
            let block = ((timestamp(&start) - timestamp(&co.start_date)) / co.read_len).floor() as i64;
            blocks.entry(block).or_default().push(start);
        }

        let mut collected: BTreeMap<String, CorrRows> = BTreeMap::new();
        for starts in blocks.values() {
            let (Some(first), Some(last)) = (starts.first(), starts.last()) else {
                continue;
            };
            let stream = self.read(first, &(*last + seconds_to_duration(co.corr_len)));
            debug!("Read {} trace(s) from {}", stream.len(), first);

            let windows = starts
                .par_iter()
                .map(|start| self.correlate_window(&stream, start).with_context(|| format!("Correlation of window {} failed", start)))
                .collect::<Result<Vec<_>>>()?;
            for (stats, row) in windows.into_iter().flatten() {
                match collected.get_mut(&stats.id()) {
                    Some(entry) if (entry.stats.start_lag - stats.start_lag).abs() > 0.5 / stats.sampling_rate => {
                        warn!("Skipping {} at {}, its lags are shifted against the earlier windows", stats.id(), stats.corr_start[0]);
                    }
                    Some(entry) => {
                        entry.stats.corr_start.extend(stats.corr_start);
                        entry.stats.corr_end.extend(stats.corr_end);
                        entry.rows.push(row);
                    }
                    None => {
                        collected.insert(stats.id(), CorrRows { stats, rows: vec![row] });
                    }
                }
            }
        }

        let mut per_pair: BTreeMap<String, Vec<CorrBulk>> = BTreeMap::new();
        for CorrRows { stats, rows } in collected.into_values() {
            let views: Vec<_> = rows.iter().map(|row| row.view()).collect();
            let data = ndarray::stack(ndarray::Axis(0), &views).map_err(|e| MiicError::invalid(e.to_string()))?;
            let file = format!("{}.{}.miic", stats.network, stats.station);
            per_pair.entry(file).or_default().push(CorrBulk::new(data, stats)?);
        }

        let mut written = Vec::new();
        for (file, bulks) in per_pair {
            let path = self.outdir.join(file);
            save_corr_bulks(&path, &bulks)?;
            info!("Saved {} channel combination(s) to {}", bulks.len(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone};
    use ndarray::Axis;
    use tempfile::tempdir;

    use crate::monitor::load_corr_bulks;
    use crate::trace_data::{write_to_sds, Encoding, Station, Trace};
    use crate::utils::testing::{gaussian_noise, synthetic_stream};

    fn argmax(row: ArrayView1<f64>) -> usize {
        row.iter().enumerate().fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best }).0
    }

    fn plain_options() -> CorrelationOptions {
        CorrelationOptions { td_preprocessing: Vec::new(), fd_preprocessing: Vec::new(), ..Default::default() }
    }

    #[test]
    fn test_calc_cross_combis() {
        let mut stream = synthetic_stream();
        stream.sort();
        // GRA1 HHN, GRA1 HHZ, GRA2 HHZ
        assert_eq!(calc_cross_combis(&stream, CombinationMethod::BetweenStations), vec![(0, 2), (1, 2)]);
        assert_eq!(calc_cross_combis(&stream, CombinationMethod::BetweenComponents), vec![(0, 1)]);
        assert_eq!(calc_cross_combis(&stream, CombinationMethod::AutoComponents), vec![(0, 0), (1, 1), (2, 2)]);
        assert_eq!(calc_cross_combis(&stream, CombinationMethod::AllSimpleCombinations).len(), 6);
        assert_eq!(calc_cross_combis(&stream, CombinationMethod::AllCombinations).len(), 9);
        assert!(calc_cross_combis(&Stream::new(), CombinationMethod::AllCombinations).is_empty());
        assert_eq!("betweenComponents".parse::<CombinationMethod>().unwrap(), CombinationMethod::BetweenComponents);
    }

    #[test]
    fn test_combine_stats() {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let first = Stats::new("GR", "GRA1", "", "HHZ", start, 25.0);
        let second = Stats::new("GR", "GRA2", "00", "HHE", start, 25.0);
        let inventory = Inventory(vec![
            Station { network: "GR".into(), station: "GRA1".into(), latitude: 49.691888, longitude: 11.22172, elevation: 499.5, ..Default::default() },
            Station { network: "GR".into(), station: "GRA2".into(), latitude: 49.655208, longitude: 11.359444, elevation: 503.0, ..Default::default() },
        ]);

        let stats = combine_stats(&first, &second, Some(&inventory));
        assert_eq!(stats.id(), "GR-GR.GRA1-GRA2.HHZ-HHE");
        assert_eq!(stats.sampling_rate, 25.0);
        let geometry = stats.geometry.unwrap();
        assert_eq!((geometry.stla, geometry.evel), (49.691888, 503.0));
        assert_abs_diff_eq!(geometry.dist, 10.7, epsilon = 0.2);
        assert!(geometry.az > 90.0 && geometry.az < 180.0);
        assert_abs_diff_eq!((geometry.baz - geometry.az).abs(), 180.0, epsilon = 0.5);

        assert!(combine_stats(&first, &second, None).geometry.is_none());
        let other = Stats::new("XX", "FAR", "", "HHZ", start, 25.0);
        assert!(combine_stats(&first, &other, Some(&inventory)).geometry.is_none());
    }

    #[test]
    fn test_pxcorr_finds_delay() {
        let (npts, delay, fs) = (2000, 7, 10.0);
        let noise = gaussian_noise(npts + delay, 3);
        let leading = noise.slice(s![delay..]).to_owned();
        let lagging = noise.slice(s![..npts]).to_owned();
        let data = ndarray::stack![Axis(0), leading, lagging];

        let mut options = plain_options();
        options.length_to_save = 5.0;
        let combis = [(0, 1), (0, 0), (1, 0)];
        let (corr, start_lags) = pxcorr(data.view(), &[0.0, 0.0], &combis, fs, &options).unwrap();
        assert_eq!(corr.dim(), (3, 101));
        assert_eq!(start_lags, vec![-5.0; 3]);

        assert_eq!(argmax(corr.row(0)), 50 + delay);
        assert_eq!(argmax(corr.row(1)), 50);
        assert_eq!(argmax(corr.row(2)), 50 - delay);
        // The Nyquist bin is counted twice in the spectral energy
        assert_abs_diff_eq!(corr[[1, 50]], 1.0, epsilon = 1e-2);
        assert!(corr[[0, 50 + delay]] > 0.9 && corr[[0, 50 + delay]] <= 1.0);

        // Whitened and band limited spectra keep the peak
        options.fd_preprocessing = vec![
            FdStep::SpectralWhitening { joint_norm: false },
            FdStep::Filter { flimit: [0.2, 0.5, 3.0, 4.0] },
        ];
        let (corr, _) = pxcorr(data.view(), &[0.0, 0.0], &combis[..1], fs, &options).unwrap();
        assert_eq!(argmax(corr.row(0)), 50 + delay);

        options.length_to_save = 150.0;
        options.zero_padding = ZeroPadding::NextFastLen;
        assert!(pxcorr(data.view(), &[0.0, 0.0], &combis, fs, &options).is_err());
        assert!(pxcorr(data.view(), &[0.0], &combis, fs, &options).is_err());
    }

    #[test]
    fn test_pxcorr_offsets() {
        let noise = gaussian_noise(1000, 11);
        let data = ndarray::stack![Axis(0), noise, noise];
        let mut options = plain_options();
        options.length_to_save = 5.0;
        options.center_correlation = false;

        // Whole samples are left in the lag axis, fractions are shifted
        let (corr, start_lags) = pxcorr(data.view(), &[0.3, 0.0], &[(0, 1)], 10.0, &options).unwrap();
        assert_abs_diff_eq!(start_lags[0], -5.3, epsilon = 1e-12);
        assert_eq!(argmax(corr.row(0)), 50);

        // Centring moves the whole offset into the phase shift
        options.center_correlation = true;
        let (corr, start_lags) = pxcorr(data.view(), &[0.3, 0.0], &[(0, 1)], 10.0, &options).unwrap();
        assert_eq!(start_lags[0], -5.0);
        assert_eq!(argmax(corr.row(0)), 47);
    }

    #[test]
    fn test_options_validation() {
        let options = CorrelationOptions::default();
        options.validate(25.0).unwrap();
        assert!(options.validate(10.0).is_err());
        assert_eq!(options.windows().len(), 31 * 24);

        let pairs = CorrelationOptions { network: vec!["GR".into()], station: vec!["GRA1".into(), "GRA2".into()], ..Default::default() };
        let expected = vec![("GR".to_string(), "GRA1".to_string()), ("GR".to_string(), "GRA2".to_string())];
        assert_eq!(pairs.station_pairs().unwrap(), expected);
        let mismatch = CorrelationOptions {
            network: vec!["GR".into(), "BW".into()],
            station: vec!["A".into(), "B".into(), "C".into()],
            ..Default::default()
        };
        assert!(mismatch.validate(25.0).is_err());
        let too_long = CorrelationOptions { length_to_save: 3600.0, ..Default::default() };
        assert!(too_long.validate(25.0).is_err());
    }

    #[test]
    fn test_correlator_writes_archives() {
        let dir = tempdir().unwrap();
        let (fs_hz, delay, hours) = (5.0, 10, 2);
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let npts = hours * 3600 * 5;

        let mut options = Options::default();
        options.proj_dir = dir.path().join("project");
        options.sds_root = dir.path().join("sds");
        options.preprocess.sampling_rate = fs_hz;
        options.co.network = vec!["XX".into()];
        options.co.station = vec!["*".into()];
        options.co.start_date = start;
        options.co.end_date = start + Duration::hours(hours as i64);
        options.co.read_len = 3600.0;
        options.co.corr_len = 1800.0;
        options.co.corr_inc = 1800.0;
        options.co.length_to_save = 20.0;
        options.co.fd_preprocessing = vec![
            FdStep::SpectralWhitening { joint_norm: false },
            FdStep::Filter { flimit: [0.05, 0.1, 1.5, 2.0] },
        ];

        // STA2 records the wavefield of STA1 two seconds later
        let noise = gaussian_noise(npts + delay, 21);
        let stream = Stream::from(vec![
            Trace::new(Stats::new("XX", "STA1", "", "HHZ", start, fs_hz), noise.slice(s![delay..]).to_owned()),
            Trace::new(Stats::new("XX", "STA2", "", "HHZ", start, fs_hz), noise.slice(s![..npts]).to_owned()),
        ]);
        write_to_sds(&options.sds_root.join(&options.preprocess.outfolder), &stream, Encoding::Float64).unwrap();
        StoreClient::new(&options.sds_root, None, false)
            .write_inventory(&Inventory(vec![
                Station { network: "XX".into(), station: "STA1".into(), latitude: 50.0, longitude: 10.0, ..Default::default() },
                Station { network: "XX".into(), station: "STA2".into(), latitude: 50.0, longitude: 10.1, ..Default::default() },
            ]))
            .unwrap();

        let correlator = Correlator::new(options).unwrap();
        let expected = vec![("XX".to_string(), "STA1".to_string()), ("XX".to_string(), "STA2".to_string())];
        assert_eq!(correlator.stations, expected);
        let written = correlator.pxcorr().unwrap();
        assert_eq!(written, vec![correlator.outdir.join("XX-XX.STA1-STA2.miic")]);

        let bulks = load_corr_bulks(&written[0]).unwrap();
        assert_eq!(bulks.len(), 1);
        let bulk = &bulks[0];
        assert_eq!(bulk.stats.channel, "HHZ-HHZ");
        assert_eq!(bulk.data.dim(), (4, 201));
        assert_eq!(bulk.stats.start_lag, -20.0);
        assert_eq!(bulk.stats.corr_start[3], start + Duration::minutes(90));
        assert_eq!(bulk.stats.corr_end[0], start + Duration::minutes(30));
        for row in bulk.data.outer_iter() {
            assert_eq!(argmax(row), 100 + delay);
        }
        let geometry = bulk.stats.geometry.unwrap();
        assert_abs_diff_eq!(geometry.dist, 7.15, epsilon = 0.1);
        assert_abs_diff_eq!(geometry.az, 90.0, epsilon = 0.1);
    }
}
