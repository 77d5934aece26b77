mod archive;
mod arithmetic;
mod field;
mod header;
mod matrix;
mod scalar;
mod sequence;
mod series;
mod unit;
mod vector;

pub use unit::{BaseDimension, Unit};
pub use header::Header;
pub use arithmetic::{Arithmetic, ArrayContainer};
pub use scalar::Scalar;
pub use vector::Vector;
pub use matrix::Matrix;
pub use series::Series;
pub use sequence::Sequence;
pub use field::Field;
pub use archive::{load, save, save_with, Compression, Record, RecordKind};
