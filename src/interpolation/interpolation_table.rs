use crate::error::{MiicError, MiicResult};
use crate::interpolation::InterpolationScheme;

// X/Y pair for interpolation
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct XY {
    pub x: f64,
    pub y: f64,
}

//=====================================================================
// Tabulated function with strictly increasing abscissae. Spline
// tables precompute the second derivatives at every knot.
//=====================================================================
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationTable {
    pub data: Vec<XY>,
    pub interpolation_scheme: InterpolationScheme,
    second_derivatives: Vec<f64>,
}

impl InterpolationTable {
    pub fn from_x_and_y(x: &[f64], y: &[f64], interpolation_scheme: InterpolationScheme) -> MiicResult<Self> {
        if x.len() != y.len() {
            return Err(MiicError::shape(&[x.len()], &[y.len()]));
        }
        if x.is_empty() {
            return Err(MiicError::invalid("interpolation table needs at least one point"));
        }
        if x.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(MiicError::invalid("interpolation abscissae must be strictly increasing"));
        }

        let data: Vec<XY> = x.iter().zip(y).map(|(&x, &y)| XY { x, y }).collect();
        let second_derivatives = match interpolation_scheme {
            InterpolationScheme::CubicSpline => natural_spline_second_derivatives(&data),
            _ => Vec::new(),
        };
        Ok(Self { data, interpolation_scheme, second_derivatives })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // Index of the segment [x_i, x_i+1] used for `x_val`, clamped to the
    // first and last segment outside the table
    fn segment(&self, x_val: f64) -> usize {
        let last_segment = self.data.len().saturating_sub(2);
        match self.data.binary_search_by(|xy| xy.x.total_cmp(&x_val)) {
            Ok(idx) => idx.min(last_segment),
            Err(0) => 0,
            Err(idx) => (idx - 1).min(last_segment),
        }
    }

    /// Interpolate inside the tabulated range, error outside of it.
    pub fn interpolate(&self, x_val: f64) -> MiicResult<f64> {
        let first = self.data[0].x;
        let last = self.data[self.data.len() - 1].x;
        if !(first..=last).contains(&x_val) {
            return Err(MiicError::invalid(format!(
                "x={} outside of interpolation range [{}, {}]", x_val, first, last
            )));
        }
        Ok(self.evaluate(x_val))
    }

    /// Evaluate anywhere, outside the table the end segments are extended.
    pub fn evaluate(&self, x_val: f64) -> f64 {
        if self.data.len() == 1 {
            return self.data[0].y;
        }
        let idx = self.segment(x_val);
        let start = self.data[idx];
        let end = self.data[idx + 1];
        let h = end.x - start.x;

        match self.interpolation_scheme {
            InterpolationScheme::Nearest => {
                if (x_val - start.x).abs() <= (end.x - x_val).abs() { start.y } else { end.y }
            }
            InterpolationScheme::Linear => start.y + (end.y - start.y) * (x_val - start.x) / h,
            InterpolationScheme::CubicSpline => {
                let a = (end.x - x_val) / h;
                let b = (x_val - start.x) / h;
                let m0 = self.second_derivatives[idx];
                let m1 = self.second_derivatives[idx + 1];
                a * start.y + b * end.y + ((a.powi(3) - a) * m0 + (b.powi(3) - b) * m1) * h * h / 6.0
            }
        }
    }
}

// Solve the tridiagonal system of a natural spline (zero curvature at
// both ends) with the Thomas algorithm
fn natural_spline_second_derivatives(data: &[XY]) -> Vec<f64> {
    let n = data.len();
    let mut m = vec![0.0; n];
    if n < 3 {
        return m;
    }
    let mut c_prime = vec![0.0; n];
    let mut d_prime = vec![0.0; n];
    for i in 1..n - 1 {
        let h0 = data[i].x - data[i - 1].x;
        let h1 = data[i + 1].x - data[i].x;
        let lower = h0;
        let diag = 2.0 * (h0 + h1);
        let upper = h1;
        let rhs = 6.0 * ((data[i + 1].y - data[i].y) / h1 - (data[i].y - data[i - 1].y) / h0);

        let denom = diag - lower * c_prime[i - 1];
        c_prime[i] = upper / denom;
        d_prime[i] = (rhs - lower * d_prime[i - 1]) / denom;
    }
    for i in (1..n - 1).rev() {
        m[i] = d_prime[i] - c_prime[i] * m[i + 1];
    }
    m
}
