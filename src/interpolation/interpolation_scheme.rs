use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

//=====================================================================
// Interpolation schemes used when resampling tabulated data.
//=====================================================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterpolationScheme {
    // Value of the closest tabulated point
    Nearest,
    #[default]
    Linear,
    // Natural cubic spline through all points
    CubicSpline,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    #[test]
    fn test_scheme_names() {
        assert_eq!(InterpolationScheme::CubicSpline.to_string(), "cubic_spline");
        assert_eq!(InterpolationScheme::from_str("nearest").unwrap(), InterpolationScheme::Nearest);
        assert!(InterpolationScheme::from_str("gamow").is_err());
    }
}
