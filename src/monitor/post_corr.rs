use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::warn;

use crate::error::{MiicError, MiicResult};
use crate::monitor::CorrStats;
use crate::signal::{butterworth_bandpass, cosine_lowpass, fourier_resample};
use crate::utils::{nan_mean_std, percentile_sorted, seconds_to_duration, timestamp};

//=====================================================================
// Post processing of correlation matrices. Rows are correlation
// functions of consecutive time windows, columns are lag samples.
//=====================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SmoothingWindow {
    Flat,
    #[default]
    Hanning,
    Hamming,
    Bartlett,
    Blackman,
}

impl SmoothingWindow {
    fn weights(&self, len: usize) -> Array1<f64> {
        if len == 1 {
            return Array1::ones(1);
        }
        let m = (len - 1) as f64;
        Array1::from_iter((0..len).map(|i| {
            let x = 2.0 * PI * i as f64 / m;
            match self {
                SmoothingWindow::Flat => 1.0,
                SmoothingWindow::Hanning => 0.5 - 0.5 * x.cos(),
                SmoothingWindow::Hamming => 0.54 - 0.46 * x.cos(),
                SmoothingWindow::Bartlett => 1.0 - (2.0 * i as f64 / m - 1.0).abs(),
                SmoothingWindow::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
            }
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NormType {
    /// Root mean square.
    Energy,
    /// Mean absolute value.
    Abssum,
    Max,
    #[default]
    Absmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum ExtractMethod {
    Mean,
    /// Mean of the rows after scaling each to unit energy.
    NormMean,
    /// Mean of the rows whose similarity to the mean trace is at least the
    /// given percentile of all similarities.
    SimilarityPercentile(f64),
}

// Apply `f` to every row in parallel and stack the results
fn map_rows<F>(data: ArrayView2<f64>, f: F) -> MiicResult<Array2<f64>>
where
    F: Fn(ArrayView1<f64>) -> MiicResult<Array1<f64>> + Sync,
{
    let rows = (0..data.nrows())
        .into_par_iter()
        .map(|i| f(data.row(i)))
        .collect::<MiicResult<Vec<_>>>()?;
    let ncols = rows.first().map_or(data.ncols(), |row| row.len());
    Array2::from_shape_vec((rows.len(), ncols), rows.iter().flat_map(|row| row.iter().copied()).collect())
        .map_err(|e| MiicError::invalid(e.to_string()))
}

// Column wise mean over the selected rows ignoring NaNs
fn nan_mean_of_rows(data: ArrayView2<f64>, rows: &[usize]) -> Array1<f64> {
    Array1::from_iter((0..data.ncols()).map(|j| nan_mean_std(rows.iter().map(|&i| data[[i, j]])).0))
}

fn rms(row: ArrayView1<f64>) -> f64 {
    let (mean_square, _) = nan_mean_std(row.iter().map(|v| v * v));
    mean_square.sqrt()
}

/// Clip values to `thres` times the standard deviation, computed over the
/// whole matrix or along `axis`.
pub fn corr_mat_clip(data: &mut Array2<f64>, thres: f64, axis: Option<Axis>) -> MiicResult<()> {
    if thres < 0.0 {
        return Err(MiicError::invalid(format!("clipping threshold must not be negative, got {}", thres)));
    }
    let clip = |value: f64, limit: f64| value.max(-limit).min(limit);
    match axis {
        None => {
            let (_, std) = nan_mean_std(data.iter().copied());
            let limit = thres * std;
            data.mapv_inplace(|v| clip(v, limit));
        }
        Some(axis) => {
            // lanes along the other axis, e.g. rows for axis 1
            for mut lane in data.lanes_mut(axis) {
                let (_, std) = nan_mean_std(lane.iter().copied());
                let limit = thres * std;
                lane.mapv_inplace(|v| clip(v, limit));
            }
        }
    }
    Ok(())
}

/// Smooth by convolution with a normalised window. The ends are extended
/// with point reflections of the signal.
pub fn smooth(x: ArrayView1<f64>, window_len: usize, window: SmoothingWindow) -> MiicResult<Array1<f64>> {
    let n = x.len();
    if n < window_len {
        return Err(MiicError::invalid(format!("input of {} samples is shorter than the window ({})", n, window_len)));
    }
    if window_len < 3 {
        return Ok(x.to_owned());
    }

    let mut padded = Vec::with_capacity(n + 2 * window_len - 1);
    padded.extend((0..window_len).map(|j| 2.0 * x[0] - x[window_len - 1 - j]));
    padded.extend(x.iter().copied());
    padded.extend((0..window_len - 1).map(|j| 2.0 * x[n - 1] - x[n - 1 - j]));

    let weights = window.weights(window_len);
    let weights = &weights / weights.sum();
    let offset = window_len + (window_len - 1) / 2;
    Ok(Array1::from_iter((0..n).map(|k| {
        weights.iter().enumerate().map(|(i, w)| w * padded[offset + k - i]).sum::<f64>()
    })))
}

/// Smooth every lane of the matrix along `axis`.
pub fn corr_mat_smooth(data: ArrayView2<f64>, window_len: usize, window: SmoothingWindow, axis: Axis) -> MiicResult<Array2<f64>> {
    let mut smoothed = data.to_owned();
    for mut lane in smoothed.lanes_mut(axis) {
        let values = smooth(lane.view(), window_len, window)?;
        lane.assign(&values);
    }
    Ok(smoothed)
}

/// Zero phase Butterworth band-pass between `freqs[0]` and `freqs[1]`.
pub fn corr_mat_filter(data: ArrayView2<f64>, stats: &CorrStats, freqs: &[f64]) -> MiicResult<Array2<f64>> {
    let &[freq_min, freq_max] = freqs else {
        return Err(MiicError::invalid(format!("expected a lower and an upper frequency, got {:?}", freqs)));
    };
    if freq_min <= 0.0 {
        return Err(MiicError::Frequency(format!("lower corner must be positive, got {}", freq_min)));
    }
    map_rows(data, |row| butterworth_bandpass(row, stats.sampling_rate, freq_min, freq_max, 4))
}

/// Cut the lag axis to `[start, end]` seconds. A range reaching beyond
/// the available lags leaves the matrix untouched.
pub fn corr_mat_trim(data: ArrayView2<f64>, stats: &CorrStats, start: f64, end: f64) -> MiicResult<(Array2<f64>, CorrStats)> {
    if end <= start {
        return Err(MiicError::invalid(format!("trim end ({}) must be after start ({})", end, start)));
    }
    let tolerance = 0.5 / stats.sampling_rate;
    if start < stats.start_lag - tolerance || end > stats.end_lag() + tolerance {
        warn!(
            "Trim range [{}, {}] exceeds the lags [{}, {}], data left unchanged",
            start, end, stats.start_lag, stats.end_lag()
        );
        return Ok((data.to_owned(), stats.clone()));
    }

    let first = stats.lag_index(start).max(0) as usize;
    let last = (first + ((end - start) * stats.sampling_rate).round() as usize).min(data.ncols().saturating_sub(1));
    let trimmed = data.slice(s![.., first..=last]).to_owned();
    let mut new_stats = stats.clone();
    new_stats.start_lag = stats.start_lag + first as f64 / stats.sampling_rate;
    new_stats.npts = trimmed.ncols();
    Ok((trimmed, new_stats))
}

/// Average the rows falling into new time windows. Without `ends` every
/// window lasts the mean spacing of `starts`. Empty windows become NaN.
pub fn corr_mat_resample(
    data: ArrayView2<f64>,
    stats: &CorrStats,
    starts: &[DateTime<Utc>],
    ends: Option<&[DateTime<Utc>]>,
) -> MiicResult<(Array2<f64>, CorrStats)> {
    if let Some(ends) = ends {
        if ends.len() != starts.len() {
            return Err(MiicError::shape(&[starts.len()], &[ends.len()]));
        }
    }
    if stats.corr_start.len() != data.nrows() {
        return Err(MiicError::shape(&[stats.corr_start.len()], &[data.nrows()]));
    }
    let ends: Vec<DateTime<Utc>> = match ends {
        Some(ends) => ends.to_vec(),
        None => {
            let (Some(first), Some(last)) = (starts.first(), starts.last()) else {
                return Err(MiicError::invalid("no window starts given"));
            };
            if starts.len() < 2 {
                return Err(MiicError::invalid("window length cannot be derived from a single start"));
            }
            let increment = (timestamp(last) - timestamp(first)) / (starts.len() - 1) as f64;
            starts.iter().map(|t| *t + seconds_to_duration(increment)).collect()
        }
    };

    let mut resampled = Array2::from_elem((starts.len(), data.ncols()), f64::NAN);
    for (i, (start, end)) in starts.iter().zip(&ends).enumerate() {
        let rows: Vec<usize> = stats
            .corr_start
            .iter()
            .enumerate()
            .filter(|(_, t)| *t >= start && *t < end)
            .map(|(row, _)| row)
            .collect();
        if !rows.is_empty() {
            resampled.row_mut(i).assign(&nan_mean_of_rows(data, &rows));
        }
    }

    let mut new_stats = stats.clone();
    new_stats.corr_start = starts.to_vec();
    new_stats.corr_end = ends;
    Ok((resampled, new_stats))
}

/// Divide every row by its norm inside the lag range `[starttime, endtime]`.
/// Rows with a vanishing norm are left as they are.
pub fn corr_mat_normalize(
    data: ArrayView2<f64>,
    stats: &CorrStats,
    normtype: NormType,
    starttime: Option<f64>,
    endtime: Option<f64>,
) -> Array2<f64> {
    let npts = data.ncols();
    let first = starttime.map_or(0, |t| stats.lag_index(t).clamp(0, npts as i64) as usize);
    let last = endtime.map_or(npts, |t| (stats.lag_index(t) + 1).clamp(first as i64, npts as i64) as usize);

    let mut normalized = data.to_owned();
    for mut row in normalized.rows_mut() {
        let window = row.slice(s![first..last]);
        let values = window.iter().copied().filter(|v| !v.is_nan());
        let norm = match normtype {
            NormType::Energy => rms(window),
            NormType::Abssum => nan_mean_std(values.map(f64::abs)).0,
            NormType::Max => values.fold(f64::NAN, f64::max),
            NormType::Absmax => values.map(f64::abs).fold(f64::NAN, f64::max),
        };
        if norm != 0.0 && norm.is_finite() {
            row.mapv_inplace(|v| v / norm);
        }
    }
    normalized
}

/// Average the causal and the acausal side into a one sided matrix
/// starting at zero lag.
pub fn corr_mat_mirror(data: ArrayView2<f64>, stats: &CorrStats) -> (Array2<f64>, CorrStats) {
    let npts = data.ncols();
    let zero = stats.lag_index(0.0);
    if stats.start_lag >= 0.0 || stats.end_lag() <= 0.0 || zero <= 0 || zero as usize >= npts {
        return (data.to_owned(), stats.clone());
    }
    let zero = zero as usize;
    let right_len = npts - zero;
    let left_len = zero;
    let out_len = right_len.max(left_len + 1);

    let mut mirrored = Array2::zeros((data.nrows(), out_len));
    mirrored.slice_mut(s![.., ..right_len]).assign(&data.slice(s![.., zero..]));
    let mut left = mirrored.slice_mut(s![.., 1..=left_len]);
    left += &data.slice(s![.., ..zero;-1]);
    let overlap = right_len.min(left_len + 1);
    mirrored.slice_mut(s![.., 1..overlap]).mapv_inplace(|v| v / 2.0);

    let mut new_stats = stats.clone();
    new_stats.start_lag = 0.0;
    new_stats.npts = out_len;
    (mirrored, new_stats)
}

// Symmetric Hann window, zero at both ends
fn hanning(len: usize) -> Array1<f64> {
    SmoothingWindow::Hanning.weights(len)
}

/// Hann taper of `width` seconds at both ends of the lag axis.
pub fn corr_mat_taper(data: ArrayView2<f64>, stats: &CorrStats, width: f64) -> MiicResult<Array2<f64>> {
    if width < 0.0 {
        return Err(MiicError::invalid(format!("taper width must not be negative, got {}", width)));
    }
    let samples = (width * stats.sampling_rate).round() as usize;
    if samples == 0 {
        return Ok(data.to_owned());
    }
    let npts = data.ncols();
    if 2 * samples > npts {
        return Err(MiicError::invalid(format!("taper of {} samples per side is longer than the trace ({})", samples, npts)));
    }
    let window = hanning(2 * samples);
    let mut taper = Array1::ones(npts);
    taper.slice_mut(s![..samples]).assign(&window.slice(s![..samples]));
    taper.slice_mut(s![npts - samples..]).assign(&window.slice(s![samples..]));
    Ok(&data * &taper)
}

/// Suppress `width` seconds around zero lag. The taper falls from one to
/// zero over `slope_frac` of the half width and is zero inside.
pub fn corr_mat_taper_center(data: ArrayView2<f64>, stats: &CorrStats, width: f64, slope_frac: f64) -> MiicResult<Array2<f64>> {
    if width < 0.0 {
        return Err(MiicError::invalid(format!("taper width must not be negative, got {}", width)));
    }
    if !(0.0..=1.0).contains(&slope_frac) {
        return Err(MiicError::invalid(format!("slope fraction must be in [0, 1], got {}", slope_frac)));
    }
    let samples = (width * stats.sampling_rate).round() as usize;
    if samples == 0 {
        return Ok(data.to_owned());
    }
    let npts = data.ncols();
    if samples > npts {
        return Err(MiicError::invalid(format!("taper of {} samples is longer than the trace ({})", samples, npts)));
    }

    let zero = stats.lag_index(0.0);
    let half = samples as f64 / 2.0;
    let flat = 1.0 - slope_frac;
    let taper = Array1::from_iter((0..npts).map(|i| {
        let t = (i as f64 - zero as f64).abs() / half;
        if t >= 1.0 {
            1.0
        } else if t < flat {
            0.0
        } else {
            0.5 * (1.0 - (PI * (t - flat) / slope_frac).cos())
        }
    }));
    Ok(&data * &taper)
}

// Anti-alias low-pass below the Nyquist frequency of `new_rate`
fn anti_alias(row: ArrayView1<f64>, sampling_rate: f64, new_rate: f64, factor: f64) -> MiicResult<Array1<f64>> {
    let stop = if factor > 16.0 { 0.45 * new_rate } else { 0.5 * new_rate };
    cosine_lowpass(row, sampling_rate, 0.8 * stop, stop)
}

/// Resample the lag axis to `freq` by low-pass filtering and Fourier resampling.
pub fn corr_mat_resample_time(data: ArrayView2<f64>, stats: &CorrStats, freq: f64) -> MiicResult<(Array2<f64>, CorrStats)> {
    if freq <= 0.0 || freq > stats.sampling_rate * (1.0 + 1e-9) {
        return Err(MiicError::Frequency(format!(
            "new sampling rate {} Hz must be positive and not above {} Hz", freq, stats.sampling_rate
        )));
    }
    if (freq - stats.sampling_rate).abs() <= stats.sampling_rate * 1e-9 {
        return Ok((data.to_owned(), stats.clone()));
    }
    let factor = stats.sampling_rate / freq;
    let npts = (data.ncols() as f64 / factor).floor() as usize;
    let resampled = map_rows(data, |row| {
        let filtered = anti_alias(row, stats.sampling_rate, freq, factor)?;
        fourier_resample(filtered.view(), npts)
    })?;

    let mut new_stats = stats.clone();
    new_stats.sampling_rate = freq;
    new_stats.npts = npts;
    Ok((resampled, new_stats))
}

/// Keep every `factor`-th sample after an anti-alias low-pass.
pub fn corr_mat_decimate(data: ArrayView2<f64>, stats: &CorrStats, factor: usize) -> MiicResult<(Array2<f64>, CorrStats)> {
    if factor == 0 {
        return Err(MiicError::invalid("decimation factor must be at least one"));
    }
    if factor == 1 {
        return Ok((data.to_owned(), stats.clone()));
    }
    let new_rate = stats.sampling_rate / factor as f64;
    let npts = data.ncols() / factor;
    let decimated = map_rows(data, |row| {
        let filtered = anti_alias(row, stats.sampling_rate, new_rate, factor as f64)?;
        let step = factor as isize;
        Ok(filtered.slice(s![..npts * factor;step]).to_owned())
    })?;

    let mut new_stats = stats.clone();
    new_stats.sampling_rate = new_rate;
    new_stats.npts = npts;
    Ok((decimated, new_stats))
}

// Uncentred correlation coefficient of two traces ignoring NaN samples
pub(crate) fn similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let (mut ab, mut aa, mut bb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()).filter(|(x, y)| !x.is_nan() && !y.is_nan()) {
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    ab / (aa * bb).sqrt()
}

/// Representative trace of the matrix, e.g. as reference for stretching.
pub fn corr_mat_extract_trace(data: ArrayView2<f64>, method: ExtractMethod) -> MiicResult<Array1<f64>> {
    let all_rows: Vec<usize> = (0..data.nrows()).collect();
    match method {
        ExtractMethod::Mean => Ok(nan_mean_of_rows(data, &all_rows)),
        ExtractMethod::NormMean => {
            let mut normalized = data.to_owned();
            for mut row in normalized.rows_mut() {
                let norm = rms(row.view());
                if norm > 0.0 {
                    row.mapv_inplace(|v| v / norm);
                } else {
                    row.fill(f64::NAN);
                }
            }
            Ok(nan_mean_of_rows(normalized.view(), &all_rows))
        }
        ExtractMethod::SimilarityPercentile(percentile) => {
            if !(0.0..=100.0).contains(&percentile) {
                return Err(MiicError::invalid(format!("percentile must be in [0, 100], got {}", percentile)));
            }
            let mean = nan_mean_of_rows(data, &all_rows);
            let similarities: Vec<f64> = data.outer_iter().map(|row| similarity(row, mean.view())).collect();
            let mut sorted: Vec<f64> = similarities.iter().copied().filter(|c| !c.is_nan()).collect();
            sorted.sort_by(f64::total_cmp);
            let threshold = percentile_sorted(&sorted, percentile);
            let selected: Vec<usize> = similarities
                .iter()
                .enumerate()
                .filter(|(_, c)| **c >= threshold)
                .map(|(i, _)| i)
                .collect();
            Ok(nan_mean_of_rows(data, &selected))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone};
    use ndarray::{concatenate, Array};

    use crate::signal::rfft;
    use crate::utils::testing::gaussian_noise;

    fn stats(start_lag: f64, sampling_rate: f64, npts: usize) -> CorrStats {
        CorrStats { start_lag, sampling_rate, npts, ..Default::default() }
    }

    fn epoch(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn noise_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        gaussian_noise(rows * cols, seed).into_shape((rows, cols)).unwrap()
    }

    #[test]
    fn test_clip() {
        let original = noise_matrix(5, 5, 3);
        let (_, std) = nan_mean_std(original.iter().copied());
        let mut data = original.clone();
        corr_mat_clip(&mut data, 1.0, None).unwrap();
        assert!(data.iter().all(|v| v.abs() <= std + 1e-12));

        let mut data = original.clone();
        corr_mat_clip(&mut data, 0.5, Some(Axis(1))).unwrap();
        for (row, orig) in data.rows().into_iter().zip(original.rows()) {
            let (_, std) = nan_mean_std(orig.iter().copied());
            assert!(row.iter().all(|v| v.abs() <= 0.5 * std + 1e-12));
        }

        let mut data = original.clone();
        corr_mat_clip(&mut data, 0.5, Some(Axis(0))).unwrap();
        for (col, orig) in data.columns().into_iter().zip(original.columns()) {
            let (_, std) = nan_mean_std(orig.iter().copied());
            assert!(col.iter().all(|v| v.abs() <= 0.5 * std + 1e-12));
        }
        assert!(corr_mat_clip(&mut data, -1.0, None).is_err());
    }

    #[test]
    fn test_smooth_errors_and_passthrough() {
        let x = gaussian_noise(50, 1);
        assert!(smooth(x.view(), 60, SmoothingWindow::Hanning).is_err());
        assert_eq!(smooth(x.view(), 2, SmoothingWindow::Hanning).unwrap(), x);
        assert!(SmoothingWindow::from_str("blabla").is_err());
        assert_eq!(SmoothingWindow::from_str("bartlett").unwrap(), SmoothingWindow::Bartlett);
    }

    #[test]
    fn test_smooth_flat_is_moving_average() {
        let x = gaussian_noise(26, 2);
        let window_len = 8;
        let out = smooth(x.view(), window_len, SmoothingWindow::Flat).unwrap();
        assert_eq!(out.len(), x.len());
        assert_abs_diff_eq!(out[window_len / 2], x.slice(s![..window_len]).mean().unwrap(), epsilon = 1e-12);

        let sine = Array1::linspace(0.0, 2.0 * PI, 50).mapv(f64::sin);
        let smoothed = smooth(sine.view(), 20, SmoothingWindow::Hanning).unwrap();
        assert!(smoothed.fold(f64::MIN, |a, &b| a.max(b)) < sine.fold(f64::MIN, |a, &b| a.max(b)));

        let matrix = Array2::from_shape_fn((30, 3), |(i, _)| x[i % 26]);
        let smoothed = corr_mat_smooth(matrix.view(), 8, SmoothingWindow::Flat, Axis(0)).unwrap();
        assert_eq!(smoothed.dim(), (30, 3));
    }

    fn three_tones() -> (Array2<f64>, CorrStats) {
        let n = 512;
        let row = Array1::linspace(0.0, 4.0 * PI, n).mapv(f64::cos)
            + Array1::linspace(0.0, 400.0 * PI, n).mapv(f64::cos)
            + Array1::linspace(0.0, 200.0 * PI, n).mapv(f64::cos);
        let data = Array2::from_shape_fn((2, n), |(_, j)| row[j]);
        (data, stats(0.0, 16.0, n))
    }

    fn amplitude_at(data: ArrayView1<f64>, bin: usize) -> f64 {
        rfft(data).unwrap()[bin].norm()
    }

    #[test]
    fn test_filter() {
        let (data, stats) = three_tones();
        // 0.0625 Hz, 3.125 Hz and 6.25 Hz sit in bins 2, 100 and 200
        let filtered = corr_mat_filter(data.view(), &stats, &[2.0, 4.0]).unwrap();
        for (row, orig) in filtered.rows().into_iter().zip(data.rows()) {
            assert!(amplitude_at(row, 2) < 0.05 * amplitude_at(orig, 2));
            assert!(amplitude_at(row, 200) < 0.1 * amplitude_at(orig, 200));
            assert!(amplitude_at(row, 100) > 0.75 * amplitude_at(orig, 100));
        }

        let wide = corr_mat_filter(data.view(), &stats, &[0.001, 7.9]).unwrap();
        let ratio = amplitude_at(wide.row(0), 100) / amplitude_at(data.row(0), 100);
        assert_abs_diff_eq!(ratio, 1.0, epsilon = 0.02);

        assert!(corr_mat_filter(data.view(), &stats, &[2.0, 4.0, 3.0]).is_err());
        assert!(matches!(corr_mat_filter(data.view(), &stats, &[0.0, 8.0]), Err(MiicError::Frequency(_))));
    }

    fn half_sine() -> (Array2<f64>, CorrStats) {
        let npts = 501;
        let row = Array1::linspace(0.0, PI, npts).mapv(f64::sin);
        (Array2::from_shape_fn((2, npts), |(_, j)| row[j]), stats(-125.0, 2.0, npts))
    }

    #[test]
    fn test_trim() {
        let (data, stats) = half_sine();
        for (start, end) in [(-100.0, 37.0), (-3.0, 1.0), (-124.0, 123.0)] {
            let npts = ((end - start) * 2.0) as usize + 1;
            let (trimmed, new_stats) = corr_mat_trim(data.view(), &stats, start, end).unwrap();
            assert_eq!(new_stats.start_lag, start);
            assert_eq!(new_stats.end_lag(), end);
            assert_eq!(new_stats.npts, npts);
            assert_eq!(trimmed.dim(), (2, npts));
        }
        for (start, end) in [(-150.0, 100.0), (-100.0, 150.0), (-125.0, 125.0)] {
            let (trimmed, _) = corr_mat_trim(data.view(), &stats, start, end).unwrap();
            assert_eq!(trimmed, data);
        }
        assert!(corr_mat_trim(data.view(), &stats, 10.0, -10.0).is_err());
    }

    #[test]
    fn test_resample_windows() {
        assert!(corr_mat_resample(Array2::zeros((0, 3)).view(), &CorrStats::default(), &[epoch(0); 25], Some(&[epoch(1), epoch(2)][..])).is_err());

        let data = noise_matrix(11, 50, 5);
        let mut in_stats = stats(0.0, 1.0, 50);
        in_stats.corr_start = (0..=100).step_by(10).map(epoch).collect();
        let starts: Vec<_> = (0..=100).step_by(20).map(epoch).collect();
        let (resampled, new_stats) = corr_mat_resample(data.view(), &in_stats, &starts, None).unwrap();
        assert_eq!(resampled.nrows(), 6);
        assert_eq!(new_stats.corr_start, starts);
        assert_eq!(new_stats.corr_end[0], epoch(20));
        let expected = (&data.row(0) + &data.row(1)) / 2.0;
        for (a, b) in resampled.row(0).iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_resample_leaves_gaps_empty() {
        let data = Array2::ones((10, 20));
        let mut in_stats = stats(0.0, 1.0, 20);
        in_stats.corr_start = (0..=30).step_by(10).chain((50..=100).step_by(10)).map(epoch).collect();
        in_stats.corr_end = in_stats.corr_start.iter().map(|t| *t + Duration::seconds(10)).collect();
        let starts: Vec<_> = (0..=100).step_by(10).map(epoch).collect();
        let (resampled, new_stats) = corr_mat_resample(data.view(), &in_stats, &starts, None).unwrap();
        assert_eq!(resampled.nrows(), 11);
        assert!(resampled.row(4).iter().all(|v| v.is_nan()));
        assert!(resampled.row(5).iter().all(|v| *v == 1.0));
        assert_eq!(new_stats.corr_start, starts);
    }

    const NORM_TYPES: [NormType; 4] = [NormType::Energy, NormType::Abssum, NormType::Max, NormType::Absmax];

    #[test]
    fn test_normalize_constant_and_zero_rows() {
        let stats = CorrStats::default();
        for normtype in NORM_TYPES {
            let ones = Array2::ones((2, 20));
            assert_eq!(corr_mat_normalize(ones.view(), &stats, normtype, None, None), ones);
            let zeros = Array2::zeros((2, 20));
            assert_eq!(corr_mat_normalize(zeros.view(), &stats, normtype, None, None), zeros);
        }
        assert!(NormType::from_str("bla").is_err());
    }

    #[test]
    fn test_normalize_lag_window() {
        let stats = stats(-10.0, 1.0, 21);
        let causal = concatenate![Axis(1), Array2::ones((2, 10)), Array2::from_elem((2, 11), 5.0)];
        let acausal = concatenate![Axis(1), Array2::from_elem((2, 11), 5.0), Array2::ones((2, 10))];
        for normtype in NORM_TYPES {
            let norm = corr_mat_normalize(causal.view(), &stats, normtype, Some(0.0), None);
            assert_eq!(norm, &causal / 5.0);
            let norm = corr_mat_normalize(acausal.view(), &stats, normtype, None, Some(0.0));
            assert_eq!(norm, &acausal / 5.0);
        }
    }

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mirror_symmetric() {
        let stats = stats(-25.0, 10.0, 501);
        let data = noise_matrix(2, 501, 7);
        let (mirrored, new_stats) = corr_mat_mirror(data.view(), &stats);
        assert_eq!(new_stats.start_lag, 0.0);
        assert_eq!(new_stats.end_lag(), stats.end_lag());
        assert_eq!(new_stats.npts, 251);

        let mut expected = data.slice(s![.., 250..]).to_owned();
        let mut tail = expected.slice_mut(s![.., 1..]);
        tail += &data.slice(s![.., ..250;-1]);
        tail /= 2.0;
        assert_close(&mirrored, &expected);
    }

    #[test]
    fn test_mirror_one_sided_is_unchanged() {
        for stats in [stats(0.0, 10.0, 251), stats(-25.0, 10.0, 251)] {
            let data = noise_matrix(2, 251, 8);
            let (mirrored, new_stats) = corr_mat_mirror(data.view(), &stats);
            assert_eq!(new_stats, stats);
            assert_eq!(mirrored, data);
        }
    }

    #[test]
    fn test_mirror_asymmetric() {
        let data = noise_matrix(2, 351, 9);

        let (mirrored, new_stats) = corr_mat_mirror(data.view(), &stats(-10.0, 10.0, 351));
        assert_eq!((new_stats.start_lag, new_stats.end_lag(), new_stats.npts), (0.0, 25.0, 251));
        let mut expected = data.slice(s![.., 100..]).to_owned();
        let mut head = expected.slice_mut(s![.., 1..101]);
        head += &data.slice(s![.., ..100;-1]);
        head /= 2.0;
        assert_close(&mirrored, &expected);

        let (mirrored, new_stats) = corr_mat_mirror(data.view(), &stats(-25.0, 10.0, 351));
        assert_eq!((new_stats.start_lag, new_stats.end_lag(), new_stats.npts), (0.0, 25.0, 251));
        let mut expected = Array2::zeros((2, 251));
        expected.slice_mut(s![.., ..101]).assign(&data.slice(s![.., 250..]));
        let mut rest = expected.slice_mut(s![.., 1..]);
        rest += &data.slice(s![.., ..250;-1]);
        expected.slice_mut(s![.., 1..101]).mapv_inplace(|v| v / 2.0);
        assert_close(&mirrored, &expected);
    }

    #[test]
    fn test_taper() {
        let stats = stats(0.0, 10.0, 101);
        let data = Array2::ones((2, 101));
        let tapered = corr_mat_taper(data.view(), &stats, 5.0).unwrap();
        assert!(tapered.slice(s![.., ..49]).iter().all(|v| *v < 1.0));
        assert!(tapered.slice(s![.., 52..]).iter().all(|v| *v < 1.0));
        assert!(tapered.column(50).iter().all(|v| *v == 1.0));

        assert_eq!(corr_mat_taper(data.view(), &stats, 0.0).unwrap(), data);
        assert!(corr_mat_taper(data.view(), &stats, -5.0).is_err());
        assert!(corr_mat_taper(data.view(), &stats, 20.0).is_err());
    }

    #[test]
    fn test_taper_center() {
        let stats = stats(-5.0, 10.0, 101);
        let data = Array2::ones((2, 101));
        let tapered = corr_mat_taper_center(data.view(), &stats, 10.0, 1.0).unwrap();
        assert!(tapered.slice(s![.., 1..100]).iter().all(|v| *v < 1.0));
        assert!(tapered.column(0).iter().all(|v| *v == 1.0));
        assert!(tapered.column(100).iter().all(|v| *v == 1.0));
        assert_eq!(tapered[[0, 50]], 0.0);

        assert_eq!(corr_mat_taper_center(data.view(), &stats, 0.0, 0.05).unwrap(), data);
        assert!(corr_mat_taper_center(data.view(), &stats, -5.0, 0.05).is_err());
        assert!(corr_mat_taper_center(data.view(), &stats, 20.0, 0.05).is_err());
    }

    fn fast_sine() -> Array2<f64> {
        let row = Array::linspace(0.0, 150.0 * PI, 201).mapv(f64::sin);
        Array2::from_shape_fn((2, 201), |(_, j)| row[j])
    }

    #[test]
    fn test_resample_time() {
        let stats = stats(-10.0, 10.0, 201);
        let ones = Array2::ones((2, 201));
        let (resampled, new_stats) = corr_mat_resample_time(ones.view(), &stats, 5.0).unwrap();
        assert_eq!((new_stats.sampling_rate, new_stats.start_lag, new_stats.npts), (5.0, -10.0, 100));
        assert_eq!(resampled.ncols(), 100);

        let (resampled, new_stats) = corr_mat_resample_time(fast_sine().view(), &stats, 2.5).unwrap();
        assert!(resampled.iter().all(|v| v.abs() < 0.06));
        assert_eq!((new_stats.sampling_rate, new_stats.npts, resampled.ncols()), (2.5, 50, 50));

        assert!(corr_mat_resample_time(ones.view(), &stats, 20.0).is_err());
        let (same, same_stats) = corr_mat_resample_time(ones.view(), &stats, 10.0).unwrap();
        assert_eq!(same, ones);
        assert_eq!(same_stats, stats);
    }

    #[test]
    fn test_decimate() {
        let stats = stats(-10.0, 10.0, 201);
        let ones = Array2::ones((2, 201));
        let (decimated, new_stats) = corr_mat_decimate(ones.view(), &stats, 2).unwrap();
        assert_eq!((new_stats.sampling_rate, new_stats.start_lag, new_stats.npts), (5.0, -10.0, 100));
        assert_eq!(decimated.ncols(), 100);

        let (decimated, new_stats) = corr_mat_decimate(fast_sine().view(), &stats, 4).unwrap();
        assert!(decimated.iter().all(|v| v.abs() < 0.06));
        assert_eq!((new_stats.sampling_rate, new_stats.npts, decimated.ncols()), (2.5, 50, 50));

        assert!(corr_mat_decimate(ones.view(), &stats, 0).is_err());
        let (same, same_stats) = corr_mat_decimate(ones.view(), &stats, 1).unwrap();
        assert_eq!(same, ones);
        assert_eq!(same_stats, stats);
    }

    #[test]
    fn test_extract_trace() {
        // row i holds the constant i + 1
        let data = Array2::from_shape_fn((10, 21), |(i, _)| (i + 1) as f64);
        let mean = corr_mat_extract_trace(data.view(), ExtractMethod::Mean).unwrap();
        assert!(mean.iter().all(|v| (*v - 5.5).abs() < 1e-12));

        let norm_mean = corr_mat_extract_trace(data.view(), ExtractMethod::NormMean).unwrap();
        assert!(norm_mean.iter().all(|v| (*v - 1.0).abs() < 1e-12));

        let mut outlier = data.clone();
        outlier.row_mut(9).assign(&Array1::linspace(-1.0, 1.0, 21));
        let similar = corr_mat_extract_trace(outlier.view(), ExtractMethod::SimilarityPercentile(50.0)).unwrap();
        assert_eq!(similar.len(), 21);
        assert!(similar.iter().all(|v| *v > 0.0));
        assert!(corr_mat_extract_trace(data.view(), ExtractMethod::SimilarityPercentile(120.0)).is_err());
    }
}
