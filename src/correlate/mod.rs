mod correlator;
mod preprocessing;

pub use correlator::{calc_cross_combis, combine_stats, pxcorr, CombinationMethod, CorrelationOptions, Correlator};
pub use preprocessing::{
    apply_fd_steps, apply_td_steps, clip, fd_filter, fd_sign_bit, mute, normalize_std, pad_rows, sign_bit,
    spectral_whitening, td_normalisation, zero_padding, Band, FdStep, MuteArgs, TdStep, ZeroPadding,
};
