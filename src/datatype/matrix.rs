use ndarray::{Array2, Ix2};
use serde::{Deserialize, Serialize};

use crate::datatype::{ArrayContainer, Header};
use crate::error::{MiicError, MiicResult};

//=====================================================================
// Two dimensional quantity. The row and column axes carry their own
// headers, e.g. time windows along axis 0 and lag time along axis 1
// for a correlation matrix.
//=====================================================================
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub meta: Header,
    pub axis0: Header,
    pub axis1: Header,
    pub data: Array2<f64>,
}

impl Matrix {
    pub fn new(meta: Header, axis0: Header, axis1: Header, data: Array2<f64>) -> Self {
        Self { meta, axis0, axis1, data }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

impl ArrayContainer for Matrix {
    type Dim = Ix2;

    fn meta(&self) -> &Header {
        &self.meta
    }

    fn data(&self) -> &Array2<f64> {
        &self.data
    }

    fn check_aligned(&self, other: &Self) -> MiicResult<()> {
        if self.axis0 != other.axis0 || self.axis1 != other.axis1 {
            return Err(MiicError::MisalignedAxis(format!(
                "matrix axes ({}, {}) vs ({}, {})",
                self.axis0, self.axis1, other.axis0, other.axis1
            )));
        }
        Ok(())
    }

    fn with_parts(&self, meta: Header, data: Array2<f64>) -> Self {
        Self { meta, axis0: self.axis0.clone(), axis1: self.axis1.clone(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::array;

    use crate::datatype::{Arithmetic, Unit};

    fn lag() -> Header {
        Header::new("lag time", "tau", Unit::parse("s").unwrap())
    }

    #[test]
    fn test_matrix_add_with_aligned_axes() {
        let a = Matrix::new(Header::dimensionless("cc"), Header::dimensionless("window"), lag(), array![[1.0, 2.0], [3.0, 4.0]]);
        let sum = a.try_add(&a).unwrap();
        assert_eq!(sum.data, array![[2.0, 4.0], [6.0, 8.0]]);
        assert_eq!(sum.axis1, lag());
    }

    #[test]
    fn test_matrix_misaligned_axes() {
        let a = Matrix::new(Header::dimensionless("cc"), Header::dimensionless("window"), lag(), array![[1.0]]);
        let mut b = a.clone();
        b.axis1 = Header::new("frequency", "f", Unit::parse("Hz").unwrap());
        assert!(matches!(a.try_mul(&b), Err(MiicError::MisalignedAxis(_))));
    }
}
