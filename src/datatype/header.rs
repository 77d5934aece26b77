use std::ops::{Div, Mul};

use serde::{Deserialize, Serialize};

use crate::datatype::Unit;
use crate::error::MiicResult;

//=====================================================================
// Metadata attached to every quantity container. A header carries
// the name and symbol of the quantity, its physical unit, and a free
// text description.
//
// Arithmetic on headers follows the unit algebra, names and symbols
// are combined so that derived quantities stay self describing.
//=====================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub symbol: String,
    pub unit: Unit,
    #[serde(default)]
    pub description: String,
}

impl Header {
    pub fn new<S: Into<String>>(name: S, symbol: S, unit: Unit) -> Self {
        Self { name: name.into(), symbol: symbol.into(), unit, description: String::new() }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Header for a quantity without a physical dimension, e.g. a correlation coefficient.
    pub fn dimensionless<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        Self { symbol: name.clone(), name, unit: Unit::dimensionless(), description: String::new() }
    }

    pub fn powi(&self, n: i32) -> Header {
        Header {
            name: format!("({})^{}", self.name, n),
            symbol: format!("({})^{}", self.symbol, n),
            unit: self.unit.pow(n),
            description: String::new(),
        }
    }

    pub fn checked_add(&self, other: &Header) -> MiicResult<Header> {
        let unit = self.unit.checked_add(&other.unit)?;
        Ok(self.combine_additive(other, "+", unit))
    }

    pub fn checked_sub(&self, other: &Header) -> MiicResult<Header> {
        let unit = self.unit.checked_sub(&other.unit)?;
        Ok(self.combine_additive(other, "-", unit))
    }

    // Adding a quantity to itself keeps its identity, anything else
    // gets a combined name.
    fn combine_additive(&self, other: &Header, op: &str, unit: Unit) -> Header {
        if self.name == other.name && self.symbol == other.symbol {
            let description =
                if self.description == other.description { self.description.clone() } else { String::new() };
            return Header { name: self.name.clone(), symbol: self.symbol.clone(), unit, description };
        }
        Header {
            name: combine_labels(&self.name, op, &other.name),
            symbol: combine_labels(&self.symbol, op, &other.symbol),
            unit,
            description: String::new(),
        }
    }
}

fn combine_labels(left: &str, op: &str, right: &str) -> String {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{} {} {}", left, op, right),
    }
}

impl<'a, 'b> Mul<&'b Header> for &'a Header {
    type Output = Header;

    fn mul(self, rhs: &'b Header) -> Header {
        Header {
            name: combine_labels(&self.name, "*", &rhs.name),
            symbol: combine_labels(&self.symbol, "*", &rhs.symbol),
            unit: &self.unit * &rhs.unit,
            description: String::new(),
        }
    }
}

impl<'a, 'b> Div<&'b Header> for &'a Header {
    type Output = Header;

    fn div(self, rhs: &'b Header) -> Header {
        Header {
            name: combine_labels(&self.name, "/", &rhs.name),
            symbol: combine_labels(&self.symbol, "/", &rhs.symbol),
            unit: &self.unit / &rhs.unit,
            description: String::new(),
        }
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) [{}]", self.name, self.symbol, self.unit)
    }
}
