use thiserror::Error;

//=====================================================================
// Errors raised by the numeric and datatype layers of the crate.
// File and network facing code wraps these into `anyhow::Error`
// with context, callers can recover them with `downcast_ref`.
//=====================================================================
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MiicError {
    /// Two physical quantities whose units cannot be combined.
    #[error("incompatible units: '{left}' and '{right}'")]
    IncompatibleUnits { left: String, right: String },
    /// Element-wise operation on arrays of different shape.
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    /// Containers share a shape but not their sampling axes.
    #[error("misaligned axis: {0}")]
    MisalignedAxis(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Requested sampling rate or filter corner cannot be honoured by the data.
    #[error("frequency error: {0}")]
    Frequency(String),
    #[error("miniSEED error: {0}")]
    Mseed(String),
    #[error("no data: {0}")]
    NoData(String),
    #[error("unknown option '{value}' for {option}")]
    UnknownOption { option: &'static str, value: String },
}

pub type MiicResult<T> = std::result::Result<T, MiicError>;

impl MiicError {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        MiicError::InvalidArgument(msg.into())
    }

    pub(crate) fn shape(left: &[usize], right: &[usize]) -> Self {
        MiicError::ShapeMismatch { left: left.to_vec(), right: right.to_vec() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MiicError::IncompatibleUnits { left: "m".into(), right: "s".into() };
        assert_eq!(err.to_string(), "incompatible units: 'm' and 's'");

        let err = MiicError::shape(&[2, 3], &[3]);
        assert_eq!(err.to_string(), "shape mismatch: [2, 3] vs [3]");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = MiicError::NoData("GR.GRA1".into()).into();
        let err = err.context("while reading");
        assert_eq!(
            err.downcast_ref::<MiicError>(),
            Some(&MiicError::NoData("GR.GRA1".into()))
        );
    }
}
