mod fft;
mod filter;

pub use fft::{analytic_signal, irfft, next_fast_len, rfft, rfftfreq};
pub use filter::{
    butterworth_bandpass, cosine_bandpass, cosine_lowpass, cosine_sac_response, cosine_taper,
    fourier_resample, gaussian_bandpass,
};
