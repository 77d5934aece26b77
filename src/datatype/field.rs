use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::datatype::{ArrayContainer, Header};
use crate::error::{MiicError, MiicResult};

//=====================================================================
// N-dimensional quantity with one header per axis.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub meta: Header,
    pub axes: Vec<Header>,
    pub data: ArrayD<f64>,
}

impl Field {
    pub fn new(meta: Header, axes: Vec<Header>, data: ArrayD<f64>) -> MiicResult<Self> {
        if axes.len() != data.ndim() {
            return Err(MiicError::invalid(format!(
                "field has {} dimensions but {} axis headers",
                data.ndim(),
                axes.len()
            )));
        }
        Ok(Self { meta, axes, data })
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }
}

impl ArrayContainer for Field {
    type Dim = IxDyn;

    fn meta(&self) -> &Header {
        &self.meta
    }

    fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    fn check_aligned(&self, other: &Self) -> MiicResult<()> {
        if let Some((axis, (a, b))) = self.axes.iter().zip(&other.axes).enumerate().find(|(_, (a, b))| a != b) {
            return Err(MiicError::MisalignedAxis(format!("field axis {}: {} vs {}", axis, a, b)));
        }
        Ok(())
    }

    fn with_parts(&self, meta: Header, data: ArrayD<f64>) -> Self {
        Self { meta, axes: self.axes.clone(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::Array;

    use crate::datatype::{Arithmetic, Scalar, Unit};

    fn axes() -> Vec<Header> {
        vec![Header::dimensionless("station"), Header::dimensionless("window"), Header::new("frequency", "f", Unit::parse("Hz").unwrap())]
    }

    #[test]
    fn test_field_construction() {
        let data = Array::zeros(IxDyn(&[2, 3, 4]));
        assert!(Field::new(Header::default(), axes(), data.clone()).is_ok());
        assert!(Field::new(Header::default(), axes()[..2].to_vec(), data).is_err());
    }

    #[test]
    fn test_field_scale() {
        let data = Array::from_elem(IxDyn(&[2, 3, 4]), 2.0);
        let field = Field::new(Header::new("amplitude", "A", Unit::parse("m").unwrap()), axes(), data).unwrap();
        let factor = Scalar::new(Header::new("gain", "g", Unit::parse("s^-1").unwrap()), 3.0);
        let scaled = field.scale(&factor);
        assert!(scaled.data.iter().all(|&v| v == 6.0));
        assert_eq!(scaled.meta.unit, Unit::parse("m/s").unwrap());
        assert_eq!(scaled.axes, field.axes);
    }

    #[test]
    fn test_field_misaligned() {
        let data = Array::zeros(IxDyn(&[2, 3, 4]));
        let a = Field::new(Header::default(), axes(), data.clone()).unwrap();
        let mut other_axes = axes();
        other_axes[2] = Header::dimensionless("lag");
        let b = Field::new(Header::default(), other_axes, data).unwrap();
        assert!(matches!(a.try_add(&b), Err(MiicError::MisalignedAxis(_))));
    }
}
