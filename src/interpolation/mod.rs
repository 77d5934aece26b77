mod interpolation_scheme;
mod interpolation_table;

pub use interpolation_scheme::InterpolationScheme;
pub use interpolation_table::{InterpolationTable, XY};
