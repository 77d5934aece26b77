use ndarray::{Array1, ArrayView1};
use realfft::num_complex::Complex64;
use realfft::RealFftPlanner;
use rustfft::FftPlanner;

use crate::error::{MiicError, MiicResult};

//=====================================================================
// Thin wrappers around realfft/rustfft working on ndarray views.
// Forward transforms are unnormalised, inverse transforms divide by
// the signal length.
//=====================================================================

/// Real to complex FFT, returns `n / 2 + 1` frequency bins.
pub fn rfft(data: ArrayView1<f64>) -> MiicResult<Array1<Complex64>> {
    if data.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let n = data.len();
    let mut input = data.to_vec();
    let fft = RealFftPlanner::<f64>::new().plan_fft_forward(n);
    let mut output = fft.make_output_vec();
    fft.process(&mut input, &mut output)
        .map_err(|e| MiicError::invalid(format!("forward FFT failed: {}", e)))?;
    Ok(Array1::from(output))
}

/// Complex to real inverse FFT for a signal of length `n`.
pub fn irfft(spectrum: ArrayView1<Complex64>, n: usize) -> MiicResult<Array1<f64>> {
    if n == 0 {
        return Ok(Array1::zeros(0));
    }
    let expected = n / 2 + 1;
    if spectrum.len() != expected {
        return Err(MiicError::shape(&[spectrum.len()], &[expected]));
    }
    let mut input = spectrum.to_vec();
    // DC and Nyquist bins of a real signal have no imaginary part
    input[0].im = 0.0;
    if n % 2 == 0 {
        input[expected - 1].im = 0.0;
    }
    let fft = RealFftPlanner::<f64>::new().plan_fft_inverse(n);
    let mut output = fft.make_output_vec();
    fft.process(&mut input, &mut output)
        .map_err(|e| MiicError::invalid(format!("inverse FFT failed: {}", e)))?;
    let scale = 1.0 / n as f64;
    Ok(Array1::from(output).mapv_into(|x| x * scale))
}

/// Frequencies of the `rfft` bins for `n` samples spaced `d` seconds apart.
pub fn rfftfreq(n: usize, d: f64) -> Array1<f64> {
    if n == 0 || d <= 0.0 {
        return Array1::zeros(0);
    }
    Array1::from_iter((0..n / 2 + 1).map(|i| i as f64 / (n as f64 * d)))
}

/// Smallest 5-smooth number (factors 2, 3 and 5 only) not below `n`.
pub fn next_fast_len(n: usize) -> usize {
    if n <= 6 {
        return n.max(1);
    }
    let mut candidate = n;
    loop {
        let mut rest = candidate;
        for factor in [2, 3, 5] {
            while rest % factor == 0 {
                rest /= factor;
            }
        }
        if rest == 1 {
            return candidate;
        }
        candidate += 1;
    }
}

/// Analytic signal `x + i H(x)` computed through the FFT.
pub fn analytic_signal(data: ArrayView1<f64>) -> Array1<Complex64> {
    let n = data.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mut planner = FftPlanner::<f64>::new();
    let mut buffer: Vec<Complex64> = data.iter().map(|&x| Complex64::new(x, 0.0)).collect();
    planner.plan_fft_forward(n).process(&mut buffer);

    // Double the positive frequencies and drop the negative ones
    let half = n / 2;
    for (i, value) in buffer.iter_mut().enumerate() {
        let weight = if i == 0 || (n % 2 == 0 && i == half) {
            1.0
        } else if i <= (n - 1) / 2 {
            2.0
        } else {
            0.0
        };
        *value *= weight;
    }

    planner.plan_fft_inverse(n).process(&mut buffer);
    let scale = 1.0 / n as f64;
    Array1::from_iter(buffer.into_iter().map(|c| c * scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::f64::consts::PI;

    #[test]
    fn test_rfft_irfft_recovers_signal() {
        let data = array![1.0, -2.0, 3.5, 0.25, 7.0, -1.0, 0.0];
        let spectrum = rfft(data.view()).unwrap();
        assert_eq!(spectrum.len(), 4);
        let back = irfft(spectrum.view(), data.len()).unwrap();
        for (a, b) in back.iter().zip(data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert!(irfft(spectrum.view(), 10).is_err());
    }

    #[test]
    fn test_rfft_of_strided_and_empty_input() {
        assert!(rfft(Array1::<f64>::zeros(0).view()).unwrap().is_empty());

        // Column of a row major matrix is a strided view
        let matrix = ndarray::Array2::from_shape_fn((8, 3), |(i, j)| (i * 3 + j) as f64);
        let column = matrix.column(1);
        let spectrum = rfft(column).unwrap();
        assert_eq!(spectrum.len(), 5);
        assert_abs_diff_eq!(spectrum[0].re, column.sum(), epsilon = 1e-12);
        assert_abs_diff_eq!(spectrum[0].im, 0.0);
    }

    #[test]
    fn test_rfftfreq() {
        let f = rfftfreq(512, 1.0 / 16.0);
        assert_eq!(f.len(), 257);
        assert_abs_diff_eq!(f[1], 0.03125);
        assert_abs_diff_eq!(f[256], 8.0);
    }

    #[test]
    fn test_next_fast_len() {
        assert_eq!(next_fast_len(1), 1);
        assert_eq!(next_fast_len(7), 8);
        assert_eq!(next_fast_len(97), 100);
        assert_eq!(next_fast_len(1000), 1000);
        assert_eq!(next_fast_len(1001), 1024);
        assert_eq!(next_fast_len(7919), 8000);
    }

    #[test]
    fn test_analytic_signal_of_cosine() {
        // The envelope of a pure cosine with an integer number of periods is flat
        let n = 256;
        let data = Array1::from_iter((0..n).map(|i| (2.0 * PI * 8.0 * i as f64 / n as f64).cos()));
        let analytic = analytic_signal(data.view());
        for (i, value) in analytic.iter().enumerate() {
            assert_abs_diff_eq!(value.norm(), 1.0, epsilon = 1e-10);
            assert_abs_diff_eq!(value.re, data[i], epsilon = 1e-10);
        }
    }
}
