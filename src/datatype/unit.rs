use std::collections::HashMap;
use std::fmt;
use std::ops::{Div, Mul};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::error::{MiicError, MiicResult};

//=====================================================================
// Units of physical quantities.
//
// A unit is stored as the integer exponents of the seven SI base
// dimensions plus a scale factor relative to the coherent SI unit,
// i.e. "km" is length^1 with factor 1e3. Multiplication, division and
// powers always succeed, addition and subtraction require identical
// units.
//=====================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
pub enum BaseDimension {
    #[strum(serialize = "m")]
    Length,
    #[strum(serialize = "kg")]
    Mass,
    #[strum(serialize = "s")]
    Time,
    #[strum(serialize = "A")]
    Current,
    #[strum(serialize = "K")]
    Temperature,
    #[strum(serialize = "mol")]
    Amount,
    #[strum(serialize = "cd")]
    Luminosity,
}

const NUM_DIMENSIONS: usize = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    exponents: [i32; NUM_DIMENSIONS],
    factor: f64,
}

lazy_static! {
    // Symbols understood by `Unit::parse`, in coherent SI terms
    static ref SYMBOLS: HashMap<&'static str, Unit> = {
        use BaseDimension::*;
        let mut m = HashMap::new();
        m.insert("1", Unit::dimensionless());
        m.insert("count", Unit::dimensionless());
        m.insert("counts", Unit::dimensionless());
        m.insert("rad", Unit::dimensionless());
        m.insert("m", Unit::base(Length));
        m.insert("g", Unit::base(Mass).scaled(1e-3));
        m.insert("s", Unit::base(Time));
        m.insert("min", Unit::base(Time).scaled(60.0));
        m.insert("h", Unit::base(Time).scaled(3600.0));
        m.insert("A", Unit::base(Current));
        m.insert("K", Unit::base(Temperature));
        m.insert("mol", Unit::base(Amount));
        m.insert("cd", Unit::base(Luminosity));
        m.insert("Hz", Unit::from_exponents([0, 0, -1, 0, 0, 0, 0]));
        m.insert("N", Unit::from_exponents([1, 1, -2, 0, 0, 0, 0]));
        m.insert("Pa", Unit::from_exponents([-1, 1, -2, 0, 0, 0, 0]));
        m.insert("J", Unit::from_exponents([2, 1, -2, 0, 0, 0, 0]));
        m.insert("W", Unit::from_exponents([2, 1, -3, 0, 0, 0, 0]));
        m.insert("C", Unit::from_exponents([0, 0, 1, 1, 0, 0, 0]));
        m.insert("V", Unit::from_exponents([2, 1, -3, -1, 0, 0, 0]));
        m.insert("Ohm", Unit::from_exponents([2, 1, -3, -2, 0, 0, 0]));
        m
    };

    static ref PREFIXES: HashMap<char, f64> = HashMap::from([
        ('p', 1e-12),
        ('n', 1e-9),
        ('u', 1e-6),
        ('µ', 1e-6),
        ('m', 1e-3),
        ('c', 1e-2),
        ('d', 1e-1),
        ('k', 1e3),
        ('M', 1e6),
        ('G', 1e9),
    ]);
}

impl Unit {
    pub fn dimensionless() -> Self {
        Self { exponents: [0; NUM_DIMENSIONS], factor: 1.0 }
    }

    pub fn base(dimension: BaseDimension) -> Self {
        let mut exponents = [0; NUM_DIMENSIONS];
        exponents[dimension as usize] = 1;
        Self { exponents, factor: 1.0 }
    }

    fn from_exponents(exponents: [i32; NUM_DIMENSIONS]) -> Self {
        Self { exponents, factor: 1.0 }
    }

    /// Same dimension, multiplied by `factor` (e.g. metre -> kilometre).
    pub fn scaled(&self, factor: f64) -> Self {
        Self { exponents: self.exponents, factor: self.factor * factor }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn exponent(&self, dimension: BaseDimension) -> i32 {
        self.exponents[dimension as usize]
    }

    pub fn is_dimensionless(&self) -> bool {
        self.exponents.iter().all(|&e| e == 0)
    }

    /// Parse a unit string such as `"km/s"`, `"m s^-2"` or `"kg*m^2/s^2"`.
    pub fn parse(text: &str) -> MiicResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::dimensionless());
        }

        let mut unit = Self::dimensionless();
        let mut term = String::new();
        let mut sign = 1;
        for c in text.chars().chain(std::iter::once(' ')) {
            match c {
                ' ' | '*' | '·' | '/' => {
                    if !term.is_empty() {
                        unit = &unit * &Self::parse_term(&term)?.pow(sign);
                        term.clear();
                        sign = 1;
                    }
                    if c == '/' {
                        sign = -1;
                    }
                }
                _ => term.push(c),
            }
        }
        Ok(unit)
    }

    // A single factor like "km", "s^-2" or "1e3"
    fn parse_term(term: &str) -> MiicResult<Self> {
        let (symbol, exponent) = match term.split_once('^') {
            Some((symbol, exp)) => {
                let exp: i32 = exp.parse().map_err(|_| {
                    MiicError::invalid(format!("invalid exponent in unit term '{}'", term))
                })?;
                (symbol, exp)
            }
            None => (term, 1),
        };

        if let Ok(number) = symbol.parse::<f64>() {
            return Ok(Self::dimensionless().scaled(number).pow(exponent));
        }
        if let Some(unit) = SYMBOLS.get(symbol) {
            return Ok(unit.pow(exponent));
        }

        // Try a single character SI prefix in front of a known symbol
        let mut chars = symbol.chars();
        if let Some(prefix) = chars.next() {
            let rest = chars.as_str();
            if let (Some(scale), Some(unit)) = (PREFIXES.get(&prefix), SYMBOLS.get(rest)) {
                return Ok(unit.scaled(*scale).pow(exponent));
            }
        }
        Err(MiicError::invalid(format!("unknown unit symbol '{}'", symbol)))
    }

    pub fn pow(&self, n: i32) -> Self {
        let mut exponents = self.exponents;
        exponents.iter_mut().for_each(|e| *e *= n);
        Self { exponents, factor: self.factor.powi(n) }
    }

    /// True if both units measure the same physical dimension.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.exponents == other.exponents
    }

    /// Multiplier converting a value in `self` into a value in `to`.
    pub fn conversion_factor(&self, to: &Unit) -> MiicResult<f64> {
        if !self.is_compatible(to) {
            return Err(self.incompatible(to));
        }
        Ok(self.factor / to.factor)
    }

    pub fn checked_add(&self, other: &Unit) -> MiicResult<Unit> {
        if self != other {
            return Err(self.incompatible(other));
        }
        Ok(self.clone())
    }

    pub fn checked_sub(&self, other: &Unit) -> MiicResult<Unit> {
        self.checked_add(other)
    }

    fn incompatible(&self, other: &Unit) -> MiicError {
        MiicError::IncompatibleUnits { left: self.to_string(), right: other.to_string() }
    }
}

impl Default for Unit {
    fn default() -> Self {
        Self::dimensionless()
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.exponents == other.exponents
            && approx::relative_eq!(self.factor, other.factor, max_relative = 1e-12)
    }
}

impl std::str::FromStr for Unit {
    type Err = MiicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Unit::parse(s)
    }
}

impl<'a, 'b> Mul<&'b Unit> for &'a Unit {
    type Output = Unit;

    fn mul(self, rhs: &'b Unit) -> Unit {
        let mut exponents = self.exponents;
        exponents.iter_mut().zip(rhs.exponents).for_each(|(e, r)| *e += r);
        Unit { exponents, factor: self.factor * rhs.factor }
    }
}

impl Mul for Unit {
    type Output = Unit;

    fn mul(self, rhs: Unit) -> Unit {
        &self * &rhs
    }
}

impl<'a, 'b> Div<&'b Unit> for &'a Unit {
    type Output = Unit;

    fn div(self, rhs: &'b Unit) -> Unit {
        self * &rhs.pow(-1)
    }
}

impl Div for Unit {
    type Output = Unit;

    fn div(self, rhs: Unit) -> Unit {
        &self / &rhs
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !approx::relative_eq!(self.factor, 1.0, max_relative = 1e-12) {
            parts.push(format!("{:e}", self.factor));
        }
        for dimension in BaseDimension::iter() {
            match self.exponent(dimension) {
                0 => {}
                1 => parts.push(dimension.to_string()),
                e => parts.push(format!("{}^{}", dimension, e)),
            }
        }
        if parts.is_empty() {
            return write!(f, "1");
        }
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn test_parse_simple_and_prefixed() {
        assert_eq!(Unit::parse("m").unwrap(), Unit::base(BaseDimension::Length));
        let km = Unit::parse("km").unwrap();
        assert!(km.is_compatible(&Unit::base(BaseDimension::Length)));
        assert_relative_eq!(km.factor(), 1e3);
        assert_eq!(Unit::parse("kg").unwrap(), Unit::base(BaseDimension::Mass));
        assert_eq!(Unit::parse("cd").unwrap(), Unit::base(BaseDimension::Luminosity));
        assert_relative_eq!(Unit::parse("ms").unwrap().factor(), 1e-3);
    }

    #[test]
    fn test_parse_compound() {
        let velocity = Unit::parse("m/s").unwrap();
        assert_eq!(velocity.exponent(BaseDimension::Length), 1);
        assert_eq!(velocity.exponent(BaseDimension::Time), -1);

        let energy = Unit::parse("kg*m^2/s^2").unwrap();
        assert_eq!(energy, Unit::parse("J").unwrap());

        let acceleration = Unit::parse("m s^-2").unwrap();
        assert_eq!(acceleration, Unit::parse("m/s^2").unwrap());

        assert!(Unit::parse("counts").unwrap().is_dimensionless());
        assert!(Unit::parse("").unwrap().is_dimensionless());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Unit::parse("furlong"), Err(MiicError::InvalidArgument(_))));
        assert!(matches!(Unit::parse("m^x"), Err(MiicError::InvalidArgument(_))));
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["m", "m^2 kg s^-2", "1e3 m", "1", "m s^-1", "1e-9 m s^-1"] {
            let unit = Unit::parse(text).unwrap();
            assert_eq!(unit.to_string(), text);
        }
        // base dimensions are printed in SI order, length first
        assert_eq!(Unit::parse("kg m^2 s^-2").unwrap().to_string(), "m^2 kg s^-2");
        assert_eq!(Unit::parse("J").unwrap().to_string(), "m^2 kg s^-2");
        assert_eq!(Unit::parse("nm/s").unwrap().to_string(), "1e-9 m s^-1");
    }

    #[test]
    fn test_square_of_unit() {
        let m = Unit::parse("m").unwrap();
        let squared = &m * &m;
        assert_eq!(squared, m.pow(2));
        assert_eq!(squared.exponent(BaseDimension::Length), 2);
        assert_eq!(squared.to_string(), "m^2");
    }

    #[test]
    fn test_division_and_power() {
        let v = Unit::parse("V").unwrap();
        let a = Unit::parse("A").unwrap();
        assert_eq!(&v / &a, Unit::parse("Ohm").unwrap());
        assert_eq!(Unit::parse("Hz").unwrap(), Unit::parse("s").unwrap().pow(-1));
        assert!((&v / &v).is_dimensionless());
    }

    #[test]
    fn test_addition_requires_matching_units() {
        let m = Unit::parse("m").unwrap();
        let s = Unit::parse("s").unwrap();
        let km = Unit::parse("km").unwrap();

        assert_eq!(m.checked_add(&m).unwrap(), m);
        assert!(matches!(m.checked_add(&s), Err(MiicError::IncompatibleUnits { .. })));
        assert!(m.checked_sub(&km).is_err());
        assert!(m.is_compatible(&km));
        assert_relative_eq!(km.conversion_factor(&m).unwrap(), 1e3);
        assert!(km.conversion_factor(&s).is_err());
    }
}
