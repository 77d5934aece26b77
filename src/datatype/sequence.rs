use chrono::{DateTime, Utc};
use ndarray::{Array1, Ix1};
use serde::{Deserialize, Serialize};

use crate::datatype::{ArrayContainer, Header};
use crate::error::{MiicError, MiicResult};

//=====================================================================
// Irregularly sampled time series, one time stamp per sample.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub meta: Header,
    pub times: Vec<DateTime<Utc>>,
    pub data: Array1<f64>,
}

impl Sequence {
    pub fn new(meta: Header, times: Vec<DateTime<Utc>>, data: Array1<f64>) -> MiicResult<Self> {
        if times.len() != data.len() {
            return Err(MiicError::shape(&[times.len()], &[data.len()]));
        }
        if times.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(MiicError::invalid("sequence time stamps must be non-decreasing"));
        }
        Ok(Self { meta, times, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ArrayContainer for Sequence {
    type Dim = Ix1;

    fn meta(&self) -> &Header {
        &self.meta
    }

    fn data(&self) -> &Array1<f64> {
        &self.data
    }

    fn check_aligned(&self, other: &Self) -> MiicResult<()> {
        if self.times != other.times {
            return Err(MiicError::MisalignedAxis("sequences sampled at different times".into()));
        }
        Ok(())
    }

    fn with_parts(&self, meta: Header, data: Array1<f64>) -> Self {
        Self { meta, times: self.times.clone(), data }
    }
}
