mod corr_bulk;
mod dv;
mod pipeline;
mod post_corr;
mod stretch;

pub use corr_bulk::{corr_channels, load_corr_bulks, save_corr_bulks, CorrBulk, CorrStats, PairGeometry};
pub use dv::{plot_dv, DvMethod, PlotStyle, ValueType, DV};
pub use pipeline::Monitor;
pub use post_corr::{
    corr_mat_clip, corr_mat_decimate, corr_mat_extract_trace, corr_mat_filter, corr_mat_mirror, corr_mat_normalize,
    corr_mat_resample, corr_mat_resample_time, corr_mat_smooth, corr_mat_taper, corr_mat_taper_center, corr_mat_trim,
    smooth, ExtractMethod, NormType, SmoothingWindow,
};
pub use stretch::{
    est_shift_from_dt_corr, estimate_reftr_shifts_from_dt_corr, multi_ref_vchange, multi_ref_vchange_and_align,
    reftr_shifts, time_stretch_estimate, time_windows_creation, velocity_change_estimate, Sides, StretchEstimate,
    StretchParams,
};
