use chrono::{DateTime, Duration, Utc};
use ndarray::{Array1, Ix1};
use serde::{Deserialize, Serialize};

use crate::datatype::{ArrayContainer, Header};
use crate::error::{MiicError, MiicResult};

//=====================================================================
// Equidistantly sampled time series. Sample `i` is taken at
// `start + i * delta`.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub meta: Header,
    pub start: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub delta: Duration,
    pub data: Array1<f64>,
}

// Sampling intervals are stored as integer nanoseconds
pub(crate) mod duration_nanos {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delta: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        match delta.num_nanoseconds() {
            Some(nanos) => serializer.serialize_i64(nanos),
            None => Err(serde::ser::Error::custom("sampling interval out of range")),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::nanoseconds(i64::deserialize(deserializer)?))
    }
}

impl Series {
    pub fn new(meta: Header, start: DateTime<Utc>, delta: Duration, data: Array1<f64>) -> MiicResult<Self> {
        if delta <= Duration::zero() {
            return Err(MiicError::invalid(format!("series sampling interval must be positive, got {}", delta)));
        }
        Ok(Self { meta, start, delta, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time of the last sample, equal to `start` for an empty series.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.delta * self.len().saturating_sub(1) as i32
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        (0..self.len()).map(|i| self.start + self.delta * i as i32).collect()
    }
}

impl ArrayContainer for Series {
    type Dim = Ix1;

    fn meta(&self) -> &Header {
        &self.meta
    }

    fn data(&self) -> &Array1<f64> {
        &self.data
    }

    fn check_aligned(&self, other: &Self) -> MiicResult<()> {
        if self.start != other.start || self.delta != other.delta {
            return Err(MiicError::MisalignedAxis(format!(
                "series sampled at ({}, {}) vs ({}, {})",
                self.start, self.delta, other.start, other.delta
            )));
        }
        Ok(())
    }

    fn with_parts(&self, meta: Header, data: Array1<f64>) -> Self {
        Self { meta, start: self.start, delta: self.delta, data }
    }
}
