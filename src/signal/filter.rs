use std::f64::consts::PI;

use ndarray::{s, Array1, ArrayView1};

use crate::error::{MiicError, MiicResult};
use crate::signal::{irfft, next_fast_len, rfft, rfftfreq};

//=====================================================================
// Zero phase filters applied in the frequency domain. Signals are
// zero padded to at least twice their length before the transform so
// that the circular convolution does not wrap around.
//=====================================================================

/// Cosine tapered window of `npts` samples. `p` is the tapered fraction
/// of the whole window, half of it at either end.
pub fn cosine_taper(npts: usize, p: f64) -> MiicResult<Array1<f64>> {
    if !(0.0..=1.0).contains(&p) {
        return Err(MiicError::invalid(format!("taper fraction must be in [0, 1], got {}", p)));
    }
    let mut window = Array1::ones(npts);
    let frac = (npts as f64 * p / 2.0 + 0.5) as usize;
    if frac == 0 || npts == 0 {
        return Ok(window);
    }
    let frac = frac.min(npts / 2).max(1);
    if frac == 1 {
        window[0] = 0.0;
        window[npts - 1] = 0.0;
        return Ok(window);
    }
    let ramp_len = (frac - 1) as f64;
    for i in 0..frac {
        let value = 0.5 * (1.0 - (PI * i as f64 / ramp_len).cos());
        window[i] = value;
        window[npts - 1 - i] = value;
    }
    Ok(window)
}

// Apply a real valued, symmetric frequency response to a signal
fn apply_response(data: ArrayView1<f64>, sampling_rate: f64, response: impl Fn(f64) -> f64) -> MiicResult<Array1<f64>> {
    let n = data.len();
    if n == 0 {
        return Ok(Array1::zeros(0));
    }
    if sampling_rate <= 0.0 {
        return Err(MiicError::invalid(format!("sampling rate must be positive, got {}", sampling_rate)));
    }
    let nfft = next_fast_len(2 * n);
    let mut padded = Array1::zeros(nfft);
    padded.slice_mut(s![..n]).assign(&data);

    let mut spectrum = rfft(padded.view())?;
    let freqs = rfftfreq(nfft, 1.0 / sampling_rate);
    spectrum.iter_mut().zip(freqs.iter()).for_each(|(value, &f)| *value *= response(f));

    let filtered = irfft(spectrum.view(), nfft)?;
    Ok(filtered.slice(s![..n]).to_owned())
}

fn check_corner(freq: f64, sampling_rate: f64) -> MiicResult<()> {
    if freq <= 0.0 || freq > sampling_rate / 2.0 {
        return Err(MiicError::Frequency(format!(
            "corner frequency {} Hz outside (0, {}] Hz", freq, sampling_rate / 2.0
        )));
    }
    Ok(())
}

/// Gaussian band-pass centred on `freq` with a standard deviation of
/// `bandwidth_factor * freq`.
pub fn gaussian_bandpass(data: ArrayView1<f64>, sampling_rate: f64, freq: f64, bandwidth_factor: f64) -> MiicResult<Array1<f64>> {
    check_corner(freq, sampling_rate)?;
    if bandwidth_factor <= 0.0 {
        return Err(MiicError::invalid(format!("bandwidth factor must be positive, got {}", bandwidth_factor)));
    }
    let width = bandwidth_factor * freq;
    apply_response(data, sampling_rate, |f| (-0.5 * ((f - freq) / width).powi(2)).exp())
}

/// Response with a flat pass band between `flimit[1]` and `flimit[2]`
/// and cosine shaped flanks falling to zero at `flimit[0]` and `flimit[3]`.
pub fn cosine_sac_response(f: f64, flimit: [f64; 4]) -> f64 {
    let [f1, f2, f3, f4] = flimit;
    if f < f1 || f > f4 {
        0.0
    } else if f < f2 {
        0.5 * (1.0 - (PI * (f - f1) / (f2 - f1)).cos())
    } else if f <= f3 {
        1.0
    } else {
        0.5 * (1.0 + (PI * (f - f3) / (f4 - f3)).cos())
    }
}

pub fn cosine_bandpass(data: ArrayView1<f64>, sampling_rate: f64, flimit: [f64; 4]) -> MiicResult<Array1<f64>> {
    if flimit.windows(2).any(|pair| pair[1] < pair[0]) || flimit[0] < 0.0 {
        return Err(MiicError::Frequency(format!("corner frequencies must be increasing and positive, got {:?}", flimit)));
    }
    apply_response(data, sampling_rate, |f| cosine_sac_response(f, flimit))
}

/// Low-pass passing everything below `pass_edge`, nothing above `stop_edge`.
pub fn cosine_lowpass(data: ArrayView1<f64>, sampling_rate: f64, pass_edge: f64, stop_edge: f64) -> MiicResult<Array1<f64>> {
    if !(0.0 < pass_edge && pass_edge < stop_edge) {
        return Err(MiicError::Frequency(format!("invalid low-pass edges {} Hz and {} Hz", pass_edge, stop_edge)));
    }
    apply_response(data, sampling_rate, |f| {
        if f <= pass_edge {
            1.0
        } else if f >= stop_edge {
            0.0
        } else {
            0.5 * (1.0 + (PI * (f - pass_edge) / (stop_edge - pass_edge)).cos())
        }
    })
}

/// Zero phase Butterworth band-pass, the squared magnitude response of a
/// filter with `corners` poles run forwards and backwards.
pub fn butterworth_bandpass(data: ArrayView1<f64>, sampling_rate: f64, freq_min: f64, freq_max: f64, corners: i32) -> MiicResult<Array1<f64>> {
    check_corner(freq_min, sampling_rate)?;
    if freq_max <= freq_min {
        return Err(MiicError::Frequency(format!("freq_max ({}) must exceed freq_min ({})", freq_max, freq_min)));
    }
    let order = 2 * corners;
    apply_response(data, sampling_rate, |f| {
        if f == 0.0 {
            return 0.0;
        }
        let highpass = 1.0 / (1.0 + (freq_min / f).powi(order));
        let lowpass = 1.0 / (1.0 + (f / freq_max).powi(order));
        highpass * lowpass
    })
}

/// Resample to `num` samples by truncating or zero padding the spectrum.
pub fn fourier_resample(data: ArrayView1<f64>, num: usize) -> MiicResult<Array1<f64>> {
    let n = data.len();
    if n == 0 || num == 0 {
        return Ok(Array1::zeros(num));
    }
    let spectrum = rfft(data)?;
    let mut resampled = Array1::zeros(num / 2 + 1);
    let keep = resampled.len().min(spectrum.len());
    resampled.slice_mut(s![..keep]).assign(&spectrum.slice(s![..keep]));
    let out = irfft(resampled.view(), num)?;
    Ok(out * (num as f64 / n as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    fn sine(freq: f64, sampling_rate: f64, n: usize) -> Array1<f64> {
        Array1::from_iter((0..n).map(|i| (2.0 * PI * freq * i as f64 / sampling_rate).sin()))
    }

    fn rms(data: ArrayView1<f64>) -> f64 {
        (data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn test_cosine_taper_window() {
        let window = cosine_taper(101, 0.1).unwrap();
        assert_eq!(window[0], 0.0);
        assert_eq!(window[100], 0.0);
        assert_eq!(window[50], 1.0);
        assert!(window[2] < window[4]);
        assert_eq!(cosine_taper(10, 0.0).unwrap(), Array1::<f64>::ones(10));
        assert!(cosine_taper(10, 1.5).is_err());
    }

    #[test]
    fn test_gaussian_bandpass_selects_band() {
        let sr = 100.0;
        let n = 4000;
        let low = sine(1.0, sr, n);
        let high = sine(10.0, sr, n);
        let data = &low + &high;

        let filtered = gaussian_bandpass(data.view(), sr, 10.0, 0.1).unwrap();
        let residual = &filtered.slice(s![1000..3000]) - &high.slice(s![1000..3000]);
        assert!(rms(residual.view()) < 0.05);
        assert!(gaussian_bandpass(data.view(), sr, 60.0, 0.1).is_err());
    }

    #[test]
    fn test_cosine_lowpass_removes_high_frequencies() {
        let sr = 50.0;
        let n = 2000;
        let data = &sine(0.5, sr, n) + &sine(20.0, sr, n);
        let filtered = cosine_lowpass(data.view(), sr, 5.0, 10.0).unwrap();
        let residual = &filtered.slice(s![500..1500]) - &sine(0.5, sr, n).slice(s![500..1500]);
        assert!(rms(residual.view()) < 0.02);
    }

    #[test]
    fn test_butterworth_bandpass_keeps_pass_band() {
        let sr = 16.0;
        let n = 2048;
        let pass = sine(3.0, sr, n);
        let data = &(&pass + &sine(0.0625, sr, n)) + &sine(7.0, sr, n);
        let filtered = butterworth_bandpass(data.view(), sr, 2.0, 4.0, 4).unwrap();
        let residual = &filtered.slice(s![512..1536]) - &pass.slice(s![512..1536]);
        assert!(rms(residual.view()) < 0.2 * rms(pass.slice(s![512..1536])));
        assert!(matches!(butterworth_bandpass(data.view(), sr, 0.0, 4.0, 4), Err(MiicError::Frequency(_))));
    }

    #[test]
    fn test_cosine_sac_response() {
        let flimit = [1.0, 2.0, 4.0, 5.0];
        assert_eq!(cosine_sac_response(0.5, flimit), 0.0);
        assert_abs_diff_eq!(cosine_sac_response(1.5, flimit), 0.5, epsilon = 1e-12);
        assert_eq!(cosine_sac_response(3.0, flimit), 1.0);
        assert_eq!(cosine_sac_response(6.0, flimit), 0.0);
    }

    #[test]
    fn test_fourier_resample_keeps_low_frequency_sine() {
        let sr = 20.0;
        let data = sine(1.0, sr, 200);
        let resampled = fourier_resample(data.view(), 100).unwrap();
        assert_eq!(resampled.len(), 100);
        let expected = sine(1.0, sr / 2.0, 100);
        for (a, b) in resampled.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }
}
