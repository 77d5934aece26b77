use serde::{Deserialize, Serialize};

use crate::datatype::{Arithmetic, Header};
use crate::error::MiicResult;

//=====================================================================
// A single physical value.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub meta: Header,
    pub value: f64,
}

impl Scalar {
    pub fn new(meta: Header, value: f64) -> Self {
        Self { meta, value }
    }

    /// Plain number without unit, handy as a scaling factor.
    pub fn dimensionless(value: f64) -> Self {
        Self { meta: Header::default(), value }
    }
}

impl Arithmetic for Scalar {
    fn try_add(&self, other: &Self) -> MiicResult<Self> {
        Ok(Self { meta: self.meta.checked_add(&other.meta)?, value: self.value + other.value })
    }

    fn try_sub(&self, other: &Self) -> MiicResult<Self> {
        Ok(Self { meta: self.meta.checked_sub(&other.meta)?, value: self.value - other.value })
    }

    fn try_mul(&self, other: &Self) -> MiicResult<Self> {
        Ok(Self { meta: &self.meta * &other.meta, value: self.value * other.value })
    }

    fn try_div(&self, other: &Self) -> MiicResult<Self> {
        Ok(Self { meta: &self.meta / &other.meta, value: self.value / other.value })
    }

    fn powi(&self, n: i32) -> Self {
        Self { meta: self.meta.powi(n), value: self.value.powi(n) }
    }

    fn scale(&self, factor: &Scalar) -> Self {
        Self { meta: &self.meta * &factor.meta, value: self.value * factor.value }
    }
}
