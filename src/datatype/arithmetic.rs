use ndarray::{Array, Dimension, Zip};

use crate::datatype::{Header, Scalar};
use crate::error::{MiicError, MiicResult};

//=====================================================================
// Dimension checked arithmetic shared by all quantity containers.
//=====================================================================
pub trait Arithmetic: Sized {
    fn try_add(&self, other: &Self) -> MiicResult<Self>;
    fn try_sub(&self, other: &Self) -> MiicResult<Self>;
    fn try_mul(&self, other: &Self) -> MiicResult<Self>;
    fn try_div(&self, other: &Self) -> MiicResult<Self>;
    fn powi(&self, n: i32) -> Self;
    /// Multiply every element by a scalar quantity, units multiply too.
    fn scale(&self, factor: &Scalar) -> Self;
}

//=====================================================================
// Containers holding an ndarray of samples. Implementors only need to
// say how their sampling axes are compared and rebuilt, the element
// wise arithmetic comes from the blanket impl below.
//=====================================================================
pub trait ArrayContainer: Sized {
    type Dim: Dimension;

    fn meta(&self) -> &Header;
    fn data(&self) -> &Array<f64, Self::Dim>;
    fn check_aligned(&self, other: &Self) -> MiicResult<()>;
    fn with_parts(&self, meta: Header, data: Array<f64, Self::Dim>) -> Self;
}

pub(crate) fn zip_arrays<D: Dimension>(
    left: &Array<f64, D>,
    right: &Array<f64, D>,
    op: impl Fn(f64, f64) -> f64,
) -> MiicResult<Array<f64, D>> {
    if left.shape() != right.shape() {
        return Err(MiicError::shape(left.shape(), right.shape()));
    }
    Ok(Zip::from(left).and(right).map_collect(|&a, &b| op(a, b)))
}

impl<T: ArrayContainer> Arithmetic for T {
    fn try_add(&self, other: &Self) -> MiicResult<Self> {
        let data = zip_arrays(self.data(), other.data(), |a, b| a + b)?;
        self.check_aligned(other)?;
        let meta = self.meta().checked_add(other.meta())?;
        Ok(self.with_parts(meta, data))
    }

    fn try_sub(&self, other: &Self) -> MiicResult<Self> {
        let data = zip_arrays(self.data(), other.data(), |a, b| a - b)?;
        self.check_aligned(other)?;
        let meta = self.meta().checked_sub(other.meta())?;
        Ok(self.with_parts(meta, data))
    }

    fn try_mul(&self, other: &Self) -> MiicResult<Self> {
        let data = zip_arrays(self.data(), other.data(), |a, b| a * b)?;
        self.check_aligned(other)?;
        Ok(self.with_parts(self.meta() * other.meta(), data))
    }

    fn try_div(&self, other: &Self) -> MiicResult<Self> {
        let data = zip_arrays(self.data(), other.data(), |a, b| a / b)?;
        self.check_aligned(other)?;
        Ok(self.with_parts(self.meta() / other.meta(), data))
    }

    fn powi(&self, n: i32) -> Self {
        self.with_parts(self.meta().powi(n), self.data().mapv(|v| v.powi(n)))
    }

    fn scale(&self, factor: &Scalar) -> Self {
        self.with_parts(self.meta() * &factor.meta, self.data() * factor.value)
    }
}
