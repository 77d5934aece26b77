use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Slice};
use tracing::{debug, info, warn};

use crate::error::{MiicError, MiicResult};
use crate::signal::{cosine_lowpass, fourier_resample};
use crate::trace_data::{write_to_sds, Encoding, StoreClient, Stream, Trace};
use crate::utils::seconds_to_duration;

//=====================================================================
// Preparation of raw waveforms: trend and gap handling, tapering and
// anti-alias filtered downsampling.
//=====================================================================

/// Remove the least squares line from `data`.
pub fn detrend(data: ArrayView1<f64>) -> Array1<f64> {
    let n = data.len();
    if n < 2 {
        return data.map(|_| 0.0);
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = data.mean().unwrap_or(0.0);
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in data.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }
    let slope = sxy / sxx;
    Array1::from_iter(data.iter().enumerate().map(|(i, y)| y - y_mean - slope * (i as f64 - x_mean)))
}

/// Sine shaped taper over `taper_len` seconds at both ends of the trace.
pub fn cos_taper(trace: &mut Trace, taper_len: f64) -> MiicResult<()> {
    let taper_npts = (taper_len * trace.stats.sampling_rate).round() as usize;
    if taper_npts == 0 {
        return Ok(());
    }
    let npts = trace.npts();
    if 2 * taper_npts > npts {
        return Err(MiicError::invalid(format!(
            "taper of {} s does not fit into {} ({} samples)", taper_len, trace.id(), npts
        )));
    }
    let ramp_step = PI / (2 * taper_npts - 1) as f64;
    for i in 0..taper_npts {
        let weight = (i as f64 * ramp_step).sin();
        trace.data[i] *= weight;
        trace.data[npts - 1 - i] *= weight;
    }
    Ok(())
}

/// Downsample to `sampling_rate_new`. The anti-alias low-pass stops at
/// half the new rate (0.45 of it for factors above 16). Integer factors
/// decimate, others resample in the frequency domain.
pub fn resample_or_decimate(trace: &Trace, sampling_rate_new: f64) -> MiicResult<Trace> {
    let sampling_rate = trace.stats.sampling_rate;
    if sampling_rate_new > sampling_rate {
        return Err(MiicError::Frequency(format!(
            "new sampling rate {} Hz is higher than the native {} Hz of {}", sampling_rate_new, sampling_rate, trace.id()
        )));
    }
    if sampling_rate_new <= 0.0 {
        return Err(MiicError::invalid(format!("sampling rate must be positive, got {}", sampling_rate_new)));
    }
    if sampling_rate_new == sampling_rate {
        return Ok(trace.clone());
    }

    let factor = sampling_rate / sampling_rate_new;
    let stop_edge = if factor <= 16.0 { 0.5 } else { 0.45 } * sampling_rate_new;
    let filtered = cosine_lowpass(trace.data.view(), sampling_rate, 0.8 * stop_edge, stop_edge)?;

    let data = if (factor - factor.round()).abs() < 1e-9 {
        let step = factor.round() as usize;
        filtered.slice(s![..;step]).to_owned()
    } else {
        let num = (trace.npts() as f64 / factor).round() as usize;
        fourier_resample(filtered.view(), num)?
    };
    let mut stats = trace.stats.clone();
    stats.sampling_rate = sampling_rate_new;
    Ok(Trace::new(stats, data))
}

/// Linear interpolation over NaN runs of at most `max_gap_len` samples.
/// Runs touching either end of the data stay NaN.
pub fn interpolate_gaps(data: ArrayView1<f64>, max_gap_len: Option<usize>) -> Array1<f64> {
    let mut out = data.to_owned();
    let max_gap_len = max_gap_len.unwrap_or(data.len());
    let mut i = 0;
    while i < out.len() {
        if !out[i].is_nan() {
            i += 1;
            continue;
        }
        let gap_start = i;
        while i < out.len() && out[i].is_nan() {
            i += 1;
        }
        let gap_len = i - gap_start;
        if gap_start == 0 || i == out.len() {
            continue;
        }
        if gap_len > max_gap_len {
            debug!("Gap of {} samples too large, not interpolating", gap_len);
            continue;
        }
        let (left, right) = (out[gap_start - 1], out[i]);
        let step = (right - left) / (gap_len + 1) as f64;
        for k in 0..gap_len {
            out[gap_start + k] = left + step * (k + 1) as f64;
        }
    }
    out
}

/// Remove traces no longer than `length` seconds.
pub fn discard_short_traces(stream: &mut Stream, length: f64) {
    stream.retain(|tr| {
        let keep = tr.npts() as f64 / tr.stats.sampling_rate > length;
        if !keep {
            debug!("Discarding short trace {} at {}", tr.id(), tr.stats.starttime);
        }
        keep
    });
}

/// Cut `start` seconds from the beginning and `end` seconds from the end
/// of every trace.
pub fn trim_stream_delta(stream: &mut Stream, start: f64, end: f64) {
    for trace in stream.iter_mut() {
        let new_start = trace.stats.starttime + seconds_to_duration(start);
        let new_end = trace.endtime() - seconds_to_duration(end);
        trace.trim(&new_start, &new_end);
    }
}

/// Interpolate short gaps, drop snippets shorter than `retain_len`
/// seconds and taper the ends of what remains.
pub fn gap_handler(stream: Stream, max_interpolation_length: usize, retain_len: f64, taper_len: f64) -> MiicResult<Stream> {
    let mut stream = stream;
    stream.merge();
    for trace in stream.iter_mut() {
        trace.data = interpolate_gaps(trace.data.view(), Some(max_interpolation_length));
    }
    stream.split();
    discard_short_traces(&mut stream, retain_len.max(2.0 * taper_len));
    for trace in stream.iter_mut() {
        cos_taper(trace, taper_len)?;
    }
    stream.merge();
    Ok(stream)
}

/// Moving mean over `2 * win_half_len + 1` samples along `axis`, NaN
/// values are ignored.
pub fn nan_moving_average(data: ArrayView2<f64>, win_half_len: usize, axis: Axis) -> Array2<f64> {
    let len = data.len_of(axis);
    let mut out = Array2::from_elem(data.raw_dim(), f64::NAN);
    for ii in 0..len {
        let window = data.slice_axis(axis, Slice::from(ii.saturating_sub(win_half_len)..(ii + win_half_len + 1).min(len)));
        let mut target = out.index_axis_mut(axis, ii);
        for (slot, lane) in target.iter_mut().zip(window.lanes(axis)) {
            let (sum, count) = lane
                .iter()
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
            if count > 0 {
                *slot = sum / count as f64;
            }
        }
    }
    out
}

//=====================================================================
// Station-wise preprocessing from a store into an SDS tree below
// `sds_root/outfolder`.
//=====================================================================
#[derive(Clone)]
pub struct Preprocessor {
    pub store: StoreClient,
    pub sampling_rate: f64,
    pub outdir: PathBuf,
    pub chunk_len: f64,
    pub taper_len: f64,
}

impl Preprocessor {
    pub fn new(store: StoreClient, sampling_rate: f64, outfolder: &str) -> MiicResult<Self> {
        let is_year = outfolder.len() == 4 && outfolder.chars().all(|c| c.is_ascii_digit());
        if outfolder == "inventory" || is_year || outfolder.is_empty() {
            return Err(MiicError::invalid(format!("'{}' cannot be used as output folder", outfolder)));
        }
        if sampling_rate <= 0.0 {
            return Err(MiicError::invalid(format!("sampling rate must be positive, got {}", sampling_rate)));
        }
        let outdir = store.sds_root.join(outfolder);
        Ok(Self { store, sampling_rate, outdir, chunk_len: 3600.0, taper_len: 30.0 })
    }

    pub fn with_chunks(mut self, chunk_len: f64, taper_len: f64) -> Self {
        self.chunk_len = chunk_len;
        self.taper_len = taper_len;
        self
    }

    /// Write to `outdir` instead of a folder inside the store.
    pub fn with_outdir<P: AsRef<Path>>(mut self, outdir: P) -> Self {
        self.outdir = outdir.as_ref().to_path_buf();
        self
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    // Detrend, taper and downsample one padded chunk
    fn process_chunk(&self, mut chunk: Trace) -> MiicResult<Trace> {
        if self.sampling_rate > chunk.stats.sampling_rate {
            return Err(MiicError::Frequency(format!(
                "the new sample rate ({} Hz) is higher than the native one of {} ({} Hz)",
                self.sampling_rate, chunk.id(), chunk.stats.sampling_rate
            )));
        }
        chunk.data = detrend(chunk.data.view());
        cos_taper(&mut chunk, self.taper_len)?;
        let mut processed = resample_or_decimate(&chunk, self.sampling_rate)?;
        processed.data.mapv_inplace(|v| v as f32 as f64);
        Ok(processed)
    }

    fn process_trace(&self, trace: &Trace, padding: f64) -> Stream {
        let mut processed = Stream::new();
        let chunk = seconds_to_duration(self.chunk_len);
        let pad = seconds_to_duration(padding);
        let mut chunk_start = trace.stats.starttime + pad;
        let data_end = trace.endtime() - pad;
        while chunk_start < data_end {
            let chunk_end = (chunk_start + chunk).min(data_end);
            let mut padded = trace.clone();
            padded.trim(&(chunk_start - pad), &(chunk_end + pad));
            match self.process_chunk(padded) {
                Ok(mut tr) => {
                    tr.trim(&chunk_start, &chunk_end);
                    processed.push(tr);
                }
                Err(MiicError::Frequency(msg)) => {
                    warn!("{}. Trace is skipped.", msg);
                    return Stream::new();
                }
                Err(e) => debug!("Chunk of {} at {} skipped: {}", trace.id(), chunk_start, e),
            }
            chunk_start = chunk_end;
        }
        processed
    }

    /// Preprocess one station and write the result. Without times, all
    /// data in the store is used. Returns the number of traces written.
    pub async fn preprocess(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) => (start, end),
            _ => self.store.available_times(network, station)?,
        };
        let padding = 3.0 * self.taper_len;
        let pad = seconds_to_duration(padding);

        let mut written = 0;
        let mut request_start = start;
        while request_start < end {
            let request_end = (request_start + Duration::days(1)).min(end);
            let mut raw = self
                .store
                .get_waveforms(network, station, location, channel, &(request_start - pad), &(request_end + pad))
                .await?;
            raw.split();

            let mut processed: Stream = raw.iter().flat_map(|tr| self.process_trace(tr, padding)).collect();
            processed.merge();
            processed.trim(&request_start, &request_end);
            if !processed.is_empty() {
                write_to_sds(&self.outdir, &processed, Encoding::Float32)?;
                written += processed.len();
            }
            request_start = request_end;
        }
        info!("Preprocessed {}.{} from {} to {}: {} trace(s)", network, station, start, end, written);
        Ok(written)
    }

    /// Preprocess several stations concurrently. `stations` requires a
    /// network, without it every station of the store matching `network`
    /// is processed.
    pub async fn preprocess_bulk(
        &self,
        network: Option<&str>,
        stations: Option<&[String]>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        concurrency: usize,
    ) -> Result<()> {
        let stations: Vec<(String, String)> = match (network, stations) {
            (None, Some(_)) => {
                return Err(MiicError::invalid("a network is required together with a station list").into());
            }
            (Some(network), Some(stations)) => stations.iter().map(|s| (network.to_string(), s.clone())).collect(),
            (network, None) => self.store.available_stations(network.unwrap_or("*"))?,
        };

        futures::stream::iter(stations)
            .map(|(network, station)| async move {
                let result = self.preprocess(&network, &station, "*", "*", start, end).await;
                (network, station, result)
            })
            .buffer_unordered(concurrency.max(1))
            .for_each(|(network, station, result)| async move {
                if let Err(e) = result {
                    warn!("Preprocessing of {}.{} failed: {:#}", network, station, e);
                }
            })
            .await;
        Ok(())
    }
}
