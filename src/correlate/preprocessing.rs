use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use realfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{MiicError, MiicResult};
use crate::signal::{butterworth_bandpass, cosine_sac_response, cosine_taper, irfft, next_fast_len, rfft};
use crate::trace_data::detrend;
use crate::utils::nan_mean_std;

//=====================================================================
// Noise preprocessing applied to a data matrix before correlation.
// Every row of a matrix is one trace, time runs along the columns.
//=====================================================================

/// Band-pass of a processing step, zero phase Butterworth with four
/// corners.
pub type Band = [f64; 2];

const FILTER_CORNERS: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum TdStep {
    /// Remove the least squares line.
    Detrend,
    /// Cosine taper over the fraction `p` of each trace.
    Taper { p: f64 },
    Clip { std_factor: f64 },
    Mute(MuteArgs),
    Filter { freqmin: f64, freqmax: f64 },
    /// Divide by the smoothed envelope, `window_length` in seconds.
    TdNormalisation {
        window_length: f64,
        #[serde(default)]
        filter: Option<Band>,
    },
    SignBit,
    NormalizeStd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum FdStep {
    SpectralWhitening {
        #[serde(default)]
        joint_norm: bool,
    },
    /// Cosine flanked pass band between `flimit[1]` and `flimit[2]`.
    Filter { flimit: [f64; 4] },
    SignBit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuteArgs {
    /// Band-pass applied before the envelope is taken.
    pub filter: Option<Band>,
    /// Taper length of the muted segments in seconds.
    pub taper_len: f64,
    /// Absolute threshold, takes precedence over `std_factor`.
    pub threshold: Option<f64>,
    pub std_factor: f64,
    /// Widen the muted segments by the taper so no loud sample leaks.
    pub extend_gaps: bool,
}

impl Default for MuteArgs {
    fn default() -> Self {
        Self { filter: None, taper_len: 1.0, threshold: None, std_factor: 1.0, extend_gaps: true }
    }
}

/// Length the traces are zero padded to before the FFT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ZeroPadding {
    NextFastLen,
    AvoidWrapAround,
    #[default]
    AvoidWrapFastLen,
}

/// Padded length for traces of `npts` samples when `length_to_save`
/// seconds of lag are kept.
pub fn zero_padding(npts: usize, padding: ZeroPadding, sampling_rate: f64, length_to_save: f64) -> usize {
    let lag_npts = (sampling_rate * length_to_save).ceil() as usize;
    match padding {
        ZeroPadding::NextFastLen => next_fast_len(npts),
        ZeroPadding::AvoidWrapAround => npts + lag_npts,
        ZeroPadding::AvoidWrapFastLen => next_fast_len(npts + lag_npts),
    }
}

// numpy style 'same' convolution, the output is centred on the input
fn convolve_same(data: ArrayView1<f64>, kernel: &[f64]) -> Array1<f64> {
    let (n, m) = (data.len() as i64, kernel.len() as i64);
    let shift = (m - 1) / 2;
    Array1::from_iter((0..n).map(|i| {
        let k = i + shift;
        let first = (k - m + 1).max(0);
        let last = k.min(n - 1);
        (first..=last).map(|j| data[j as usize] * kernel[(k - j) as usize]).sum::<f64>()
    }))
}

// Replace every row by `f(index, row)`, rows are processed in parallel
fn update_rows<T, F>(data: &mut Array2<T>, f: F) -> MiicResult<()>
where
    T: Clone + Send + Sync,
    F: Fn(usize, ArrayView1<T>) -> MiicResult<Array1<T>> + Sync,
{
    let view = data.view();
    let rows = (0..view.nrows())
        .into_par_iter()
        .map(|i| f(i, view.row(i)))
        .collect::<MiicResult<Vec<_>>>()?;
    for (mut target, row) in data.outer_iter_mut().zip(rows) {
        target.assign(&row);
    }
    Ok(())
}

fn filter_rows(data: &Array2<f64>, band: Band, sampling_rate: f64) -> MiicResult<Array2<f64>> {
    let mut out = data.clone();
    update_rows(&mut out, |_, row| butterworth_bandpass(row, sampling_rate, band[0], band[1], FILTER_CORNERS))?;
    Ok(out)
}

/// Clip every trace at `std_factor` times its standard deviation.
pub fn clip(data: &mut Array2<f64>, std_factor: f64) -> MiicResult<()> {
    if std_factor <= 0.0 {
        return Err(MiicError::invalid(format!("std_factor must be positive, got {}", std_factor)));
    }
    update_rows(data, |_, row| {
        let (_, std) = nan_mean_std(row.iter().copied());
        let threshold = std_factor * std;
        if !threshold.is_finite() {
            return Ok(row.to_owned());
        }
        Ok(row.mapv(|v| v.clamp(-threshold, threshold)))
    })
}

/// Set the parts of every trace whose envelope exceeds the threshold to
/// zero, with tapered edges. Traces not longer than the taper are zeroed.
pub fn mute(data: &mut Array2<f64>, args: &MuteArgs, sampling_rate: f64) -> MiicResult<()> {
    let ntap = (args.taper_len * sampling_rate) as usize;
    if ntap == 0 {
        return Err(MiicError::invalid(format!("mute taper of {} s is shorter than a sample", args.taper_len)));
    }
    if data.ncols() <= ntap {
        data.fill(0.0);
        return Ok(());
    }
    let filtered = match args.filter {
        Some(band) => filter_rows(data, band, sampling_rate)?,
        None => data.clone(),
    };

    let boxcar = vec![1.0 / ntap as f64; ntap];
    let taper: Vec<f64> = (0..ntap)
        .map(|i| (1.0 - (i as f64 / ntap as f64 * 2.0 * std::f64::consts::PI).cos()) / ntap as f64)
        .collect();
    update_rows(data, |i, row| {
        let envelope = filtered.row(i);
        let threshold = args.threshold.unwrap_or_else(|| nan_mean_std(envelope.iter().copied()).1 * args.std_factor);
        let mut mask = envelope.mapv(|v| if v.abs() > threshold { 0.0 } else { 1.0 });
        if args.extend_gaps {
            mask = convolve_same(mask.view(), &boxcar).mapv(|v| if v < 1.0 - 1e-9 { 0.0 } else { 1.0 });
        }
        Ok(&row * &convolve_same(mask.view(), &taper))
    })
}

/// Divide every trace by its envelope, smoothed forwards and backwards
/// over `window_length` seconds. The envelope is taken from the band
/// passed trace if `filter` is given.
pub fn td_normalisation(
    data: &mut Array2<f64>,
    window_length: f64,
    filter: Option<Band>,
    sampling_rate: f64,
) -> MiicResult<()> {
    let win = (window_length * sampling_rate).ceil() as usize;
    if win == 0 {
        return Err(MiicError::invalid(format!("normalisation window of {} s is empty", window_length)));
    }
    let envelope = match filter {
        Some(band) => filter_rows(data, band, sampling_rate)?,
        None => data.clone(),
    };
    let window = vec![1.0 / win as f64; win];
    update_rows(data, |i, row| {
        let power = envelope.row(i).mapv(|v| v * v);
        let forward = convolve_same(power.view(), &window);
        let reversed: Array1<f64> = forward.iter().rev().copied().collect();
        let smooth: Array1<f64> = convolve_same(reversed.view(), &window).iter().rev().copied().collect();
        let floor = smooth.fold(0.0f64, |a, &b| a.max(b)) * 1e-6;
        Ok(Zip::from(&row).and(&smooth).map_collect(|value, power| {
            let norm = (power + floor).sqrt();
            if norm > 0.0 { value / norm } else { 0.0 }
        }))
    })
}

/// One bit normalisation, samples become -1, 0 or 1.
pub fn sign_bit(data: &mut Array2<f64>) {
    data.mapv_inplace(|v| if v > 0.0 { 1.0 } else if v < 0.0 { -1.0 } else { 0.0 });
}

pub fn normalize_std(data: &mut Array2<f64>) {
    for mut row in data.outer_iter_mut() {
        let (_, std) = nan_mean_std(row.iter().copied());
        if std > 0.0 {
            row /= std;
        }
    }
}

/// Apply the time domain steps in order.
pub fn apply_td_steps(data: &mut Array2<f64>, steps: &[TdStep], sampling_rate: f64) -> MiicResult<()> {
    for step in steps {
        match step {
            TdStep::Detrend => update_rows(data, |_, row| Ok(detrend(row)))?,
            TdStep::Taper { p } => {
                let taper = cosine_taper(data.ncols(), *p)?;
                *data *= &taper;
            }
            TdStep::Clip { std_factor } => clip(data, *std_factor)?,
            TdStep::Mute(args) => mute(data, args, sampling_rate)?,
            TdStep::Filter { freqmin, freqmax } => *data = filter_rows(data, [*freqmin, *freqmax], sampling_rate)?,
            TdStep::TdNormalisation { window_length, filter } => {
                td_normalisation(data, *window_length, *filter, sampling_rate)?
            }
            TdStep::SignBit => sign_bit(data),
            TdStep::NormalizeStd => normalize_std(data),
        }
    }
    Ok(())
}

/// Normalise the amplitude spectra to one and drop the zero frequency.
/// With `joint_norm` consecutive groups of three traces share the mean
/// amplitude spectrum of the group.
pub fn spectral_whitening(spectra: &mut Array2<Complex64>, joint_norm: bool) -> MiicResult<()> {
    let mut amplitude = spectra.mapv(|c| c.norm());
    if joint_norm {
        if spectra.nrows() % 3 != 0 {
            return Err(MiicError::invalid(format!(
                "joint normalisation needs a multiple of three traces, got {}",
                spectra.nrows()
            )));
        }
        for mut group in amplitude.axis_chunks_iter_mut(Axis(0), 3) {
            let mean = group.mean_axis(Axis(0)).unwrap_or_default();
            for mut row in group.outer_iter_mut() {
                row.assign(&mean);
            }
        }
    }
    Zip::from(&mut *spectra).and(&amplitude).for_each(|c, a| {
        *c = if *a > 0.0 { *c / *a } else { Complex64::new(0.0, 0.0) };
    });
    spectra.column_mut(0).fill(Complex64::new(0.0, 0.0));
    Ok(())
}

/// Taper the spectra with a cosine flanked pass band.
pub fn fd_filter(spectra: &mut Array2<Complex64>, freqs: ArrayView1<f64>, flimit: [f64; 4]) -> MiicResult<()> {
    if flimit.windows(2).any(|pair| pair[1] < pair[0]) || flimit[0] < 0.0 {
        return Err(MiicError::Frequency(format!("corner frequencies must be increasing and positive, got {:?}", flimit)));
    }
    if freqs.len() != spectra.ncols() {
        return Err(MiicError::shape(&[spectra.ncols()], &[freqs.len()]));
    }
    let response = freqs.mapv(|f| cosine_sac_response(f, flimit));
    for mut row in spectra.outer_iter_mut() {
        Zip::from(&mut row).and(&response).for_each(|c, r| *c *= *r);
    }
    Ok(())
}

/// One bit normalisation of spectra of `npts` long traces.
pub fn fd_sign_bit(spectra: &mut Array2<Complex64>, npts: usize) -> MiicResult<()> {
    update_rows(spectra, |_, row| {
        let mut trace = irfft(row, npts)?.insert_axis(Axis(0));
        sign_bit(&mut trace);
        rfft(trace.row(0))
    })
}

/// Apply the frequency domain steps in order. `npts` is the padded length
/// of the transformed traces.
pub fn apply_fd_steps(
    spectra: &mut Array2<Complex64>,
    steps: &[FdStep],
    freqs: ArrayView1<f64>,
    npts: usize,
) -> MiicResult<()> {
    for step in steps {
        match step {
            FdStep::SpectralWhitening { joint_norm } => spectral_whitening(spectra, *joint_norm)?,
            FdStep::Filter { flimit } => fd_filter(spectra, freqs, *flimit)?,
            FdStep::SignBit => fd_sign_bit(spectra, npts)?,
        }
    }
    Ok(())
}

/// Zero pad every row to `npts` samples.
pub fn pad_rows(data: ArrayView2<f64>, npts: usize) -> Array2<f64> {
    let keep = data.ncols().min(npts);
    let mut padded = Array2::zeros((data.nrows(), npts));
    padded.slice_mut(s![.., ..keep]).assign(&data.slice(s![.., ..keep]));
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use crate::signal::rfftfreq;
    use crate::utils::testing::gaussian_noise;

    // Gaussian bell of `npts` samples with standard deviation `std`
    fn bell(npts: usize, std: f64) -> Array1<f64> {
        let center = (npts - 1) as f64 / 2.0;
        Array1::from_iter((0..npts).map(|i| (-0.5 * ((i as f64 - center) / std).powi(2)).exp()))
    }

    fn two_rows(row: &Array1<f64>) -> Array2<f64> {
        ndarray::stack![Axis(0), *row, *row]
    }

    #[test]
    fn test_convolve_same() {
        let data = array![1.0, 2.0, 3.0, 4.0];
        assert_eq!(convolve_same(data.view(), &[1.0, 1.0, 1.0]), array![3.0, 6.0, 9.0, 7.0]);
        assert_eq!(convolve_same(data.view(), &[0.5, 0.5]), array![0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_clip() {
        let row = bell(500, 180.0);
        let mut data = two_rows(&row);
        clip(&mut data, 2.0).unwrap();
        let (_, std) = nan_mean_std(row.iter().copied());
        assert_abs_diff_eq!(data.row(0).fold(0.0f64, |a, &b| a.max(b.abs())), (2.0 * std).min(1.0), epsilon = 1e-12);

        // Constant traces have no spread and are clipped to zero
        let mut ones = Array2::ones((5, 100));
        clip(&mut ones, 3.0).unwrap();
        assert!(ones.iter().all(|v| *v == 0.0));
        assert!(clip(&mut ones, 0.0).is_err());
    }

    #[test]
    fn test_mute() {
        let args = MuteArgs { taper_len: 1.0, ..Default::default() };
        let row = bell(600, 180.0);
        let mut data = two_rows(&row);
        mute(&mut data, &args, 25.0).unwrap();
        let (_, std) = nan_mean_std(row.iter().copied());
        assert!(data.row(0).iter().all(|v| *v <= std + 1e-12));
        assert_eq!(data[[0, 300]], 0.0);

        let mut short = Array2::ones((3, 20));
        mute(&mut short, &args, 25.0).unwrap();
        assert!(short.iter().all(|v| *v == 0.0));

        let zero_taper = MuteArgs { taper_len: 0.0, ..Default::default() };
        assert!(mute(&mut data, &zero_taper, 25.0).is_err());
    }

    #[test]
    fn test_td_normalisation_flattens_amplitude() {
        let npts = 2000;
        let modulation = Array1::from_iter((0..npts).map(|i| if i < npts / 2 { 1.0 } else { 20.0 }));
        let row = gaussian_noise(npts, 5) * &modulation;
        let mut data = row.insert_axis(Axis(0));
        td_normalisation(&mut data, 2.0, None, 25.0).unwrap();
        let (_, quiet) = nan_mean_std(data.slice(s![0, 200..800]).iter().copied());
        let (_, loud) = nan_mean_std(data.slice(s![0, 1200..1800]).iter().copied());
        assert!((quiet / loud - 1.0).abs() < 0.2);
        assert!(td_normalisation(&mut data, 0.0, None, 25.0).is_err());
    }

    #[test]
    fn test_sign_bit_and_std() {
        let mut data = array![[-2.5, 0.0, 3.0], [1.0, -1.0, 0.5]];
        sign_bit(&mut data);
        assert_eq!(data, array![[-1.0, 0.0, 1.0], [1.0, -1.0, 1.0]]);

        let mut data = array![[1.0, -1.0, 1.0, -1.0], [0.0, 0.0, 0.0, 0.0]];
        data *= 4.0;
        normalize_std(&mut data);
        assert_eq!(data.row(0), array![1.0, -1.0, 1.0, -1.0]);
        assert!(data.row(1).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_zero_padding() {
        assert_eq!(zero_padding(1000, ZeroPadding::NextFastLen, 10.0, 20.0), 1000);
        assert_eq!(zero_padding(1000, ZeroPadding::AvoidWrapAround, 10.0, 20.0), 1200);
        assert_eq!(zero_padding(1001, ZeroPadding::AvoidWrapFastLen, 10.0, 20.0), 1215);
        assert_eq!("avoidWrapAround".parse::<ZeroPadding>().unwrap(), ZeroPadding::AvoidWrapAround);
        assert_eq!(pad_rows(array![[1.0, 2.0]].view(), 4), array![[1.0, 2.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_spectral_whitening_and_filter() {
        let npts = 256;
        let data = ndarray::stack![Axis(0), gaussian_noise(npts, 1), gaussian_noise(npts, 2), gaussian_noise(npts, 3)];
        let rows: Vec<_> = data.outer_iter().map(|row| rfft(row).unwrap()).collect();
        let views: Vec<_> = rows.iter().map(|row| row.view()).collect();
        let mut spectra = ndarray::stack(Axis(0), &views).unwrap();

        let mut whitened = spectra.clone();
        spectral_whitening(&mut whitened, false).unwrap();
        assert_eq!(whitened[[0, 0]], Complex64::new(0.0, 0.0));
        for value in whitened.slice(s![.., 1..]).iter() {
            assert_abs_diff_eq!(value.norm(), 1.0, epsilon = 1e-12);
        }

        let mut joint = spectra.clone();
        spectral_whitening(&mut joint, true).unwrap();
        let group_sum: f64 = (0..3).map(|r| joint[[r, 10]].norm()).sum();
        assert!(group_sum > 0.0);
        assert!(spectral_whitening(&mut spectra.slice(s![..2, ..]).to_owned(), true).is_err());

        let freqs = rfftfreq(npts, 0.1);
        fd_filter(&mut spectra, freqs.view(), [0.5, 1.0, 2.0, 3.0]).unwrap();
        for (k, f) in freqs.iter().enumerate() {
            if *f < 0.5 || *f > 3.0 {
                assert_eq!(spectra[[0, k]], Complex64::new(0.0, 0.0));
            }
        }
        assert!(fd_filter(&mut spectra, freqs.view(), [2.0, 1.0, 3.0, 4.0]).is_err());
    }

    #[test]
    fn test_fd_sign_bit() {
        let npts = 128;
        let row = gaussian_noise(npts, 4);
        let mut spectra = rfft(row.view()).unwrap().insert_axis(Axis(0));
        fd_sign_bit(&mut spectra, npts).unwrap();
        let back = irfft(spectra.row(0), npts).unwrap();
        for (value, original) in back.iter().zip(row.iter()) {
            assert_abs_diff_eq!(*value, original.signum(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_steps_from_yaml() {
        let yaml = "
- function: detrend
- function: taper
  p: 0.05
- function: mute
  taper_len: 2.0
  std_factor: 3.0
- function: td_normalisation
  window_length: 5.0
  filter: [0.5, 2.0]
- function: sign_bit
";
        let steps: Vec<TdStep> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[1], TdStep::Taper { p: 0.05 });
        match &steps[2] {
            TdStep::Mute(args) => {
                assert_eq!(args.taper_len, 2.0);
                assert!(args.extend_gaps);
            }
            other => panic!("unexpected step {:?}", other),
        }

        let mut data = ndarray::stack![Axis(0), gaussian_noise(500, 8), gaussian_noise(500, 9)];
        apply_td_steps(&mut data, &steps, 25.0).unwrap();
        assert!(data.iter().all(|v| [-1.0, 0.0, 1.0].contains(v)));

        let fd: Vec<FdStep> = serde_yaml::from_str("- function: spectral_whitening\n- function: filter\n  flimit: [0.1, 0.2, 4.0, 5.0]\n").unwrap();
        assert_eq!(fd[0], FdStep::SpectralWhitening { joint_norm: false });
    }
}
