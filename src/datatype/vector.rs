use ndarray::{Array1, Ix1};
use serde::{Deserialize, Serialize};

use crate::datatype::{ArrayContainer, Header};
use crate::error::MiicResult;

//=====================================================================
// One dimensional quantity without a sampling axis.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub meta: Header,
    pub data: Array1<f64>,
}

impl Vector {
    pub fn new(meta: Header, data: Array1<f64>) -> Self {
        Self { meta, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ArrayContainer for Vector {
    type Dim = Ix1;

    fn meta(&self) -> &Header {
        &self.meta
    }

    fn data(&self) -> &Array1<f64> {
        &self.data
    }

    fn check_aligned(&self, _other: &Self) -> MiicResult<()> {
        Ok(())
    }

    fn with_parts(&self, meta: Header, data: Array1<f64>) -> Self {
        Self { meta, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;

    use crate::datatype::{Arithmetic, Unit};
    use crate::error::MiicError;

    #[test]
    fn test_vector_elementwise() {
        let meta = Header::new("amplitude", "A", Unit::parse("nm/s").unwrap());
        let a = Vector::new(meta.clone(), array![1.0, 2.0, 3.0]);
        let b = Vector::new(meta, array![0.5, 0.5, 0.5]);

        assert_eq!(a.try_sub(&b).unwrap().data, array![0.5, 1.5, 2.5]);
        let product = a.try_mul(&b).unwrap();
        assert_eq!(product.data, array![0.5, 1.0, 1.5]);
        assert_eq!(product.meta.unit, Unit::parse("nm^2 s^-2").unwrap());
    }

    #[test]
    fn test_vector_shape_mismatch() {
        let a = Vector::new(Header::dimensionless("x"), array![1.0, 2.0]);
        let b = Vector::new(Header::dimensionless("x"), array![1.0, 2.0, 3.0]);
        assert_eq!(a.try_add(&b), Err(MiicError::shape(&[2], &[3])));
    }
}
