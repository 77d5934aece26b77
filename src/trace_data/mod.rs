mod amplitudes;
mod inventory;
pub mod mseed;
mod preprocess;
pub mod sds;
mod trace;
mod waveform;

pub use amplitudes::{
    envelope, fit_rayleigh_distribution, AmplitudeResult, Envelopes, FaClient, FieldAmplitudes, RayleighFit,
};
pub use inventory::{calc_az_baz_dist, Inventory, Station};
pub use mseed::Encoding;
pub use preprocess::{
    cos_taper, detrend, discard_short_traces, gap_handler, interpolate_gaps, nan_moving_average,
    resample_or_decimate, trim_stream_delta, Preprocessor,
};
pub use sds::{read_from_filesystem, write_to_sds, FileLayout, SeedId};
pub use trace::{Stats, Stream, Trace};
pub use waveform::{FdsnClient, FsClient, RemoteClient, StoreClient};
