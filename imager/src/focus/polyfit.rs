//! Least squares polynomial fitting
//!
//! Positions are centered and scaled to [-1, 1] before fitting so focuser
//! positions in the tens of thousands do not blow up the normal equations.

/// A fitted polynomial in normalized coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    /// Coefficients from the constant term up
    coefficients: Vec<f64>,
    center: f64,
    scale: f64,
}

impl Polynomial {
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.center) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, coefficient| acc * u + coefficient)
    }
}

impl std::fmt::Display for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self
            .coefficients
            .iter()
            .enumerate()
            .map(|(power, c)| match power {
                0 => format!("{:.6}", c),
                1 => format!("{:.6}*u", c),
                _ => format!("{:.6}*u^{}", c, power),
            })
            .collect();
        write!(
            f,
            "{} where u = (x - {}) / {}",
            terms.join(" + "),
            self.center,
            self.scale
        )
    }
}

/// Fit a polynomial of `degree` through the points.
///
/// Returns None when there are fewer points than coefficients or the system
/// is singular.
pub fn polynomial_fit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Polynomial> {
    let n = xs.len().min(ys.len());
    let terms = degree + 1;
    if n < terms {
        return None;
    }
    let center = xs[..n].iter().sum::<f64>() / n as f64;
    let scale = xs[..n]
        .iter()
        .map(|x| (x - center).abs())
        .fold(0.0, f64::max);
    let scale = if scale > 0.0 { scale } else { 1.0 };

    // Normal equations as an augmented matrix
    let mut matrix = vec![vec![0.0; terms + 1]; terms];
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let u = (x - center) / scale;
        let powers: Vec<f64> = (0..2 * terms).map(|p| u.powi(p as i32)).collect();
        for (row, line) in matrix.iter_mut().enumerate() {
            for (column, cell) in line.iter_mut().take(terms).enumerate() {
                *cell += powers[row + column];
            }
            line[terms] += y * powers[row];
        }
    }

    for column in 0..terms {
        let pivot = (column..terms).max_by(|&a, &b| {
            matrix[a][column]
                .abs()
                .total_cmp(&matrix[b][column].abs())
        })?;
        if matrix[pivot][column].abs() < 1e-12 {
            return None;
        }
        matrix.swap(column, pivot);
        for row in 0..terms {
            if row == column {
                continue;
            }
            let factor = matrix[row][column] / matrix[column][column];
            if factor == 0.0 {
                continue;
            }
            for k in column..=terms {
                matrix[row][k] -= factor * matrix[column][k];
            }
        }
    }

    let coefficients = (0..terms)
        .map(|i| matrix[i][terms] / matrix[i][i])
        .collect();
    Some(Polynomial {
        coefficients,
        center,
        scale,
    })
}

/// Position of the smallest value of `polynomial` within [low, high].
///
/// A coarse scan brackets the global minimum, golden section search then
/// narrows it to `tolerance`.
pub fn polynomial_min_x(polynomial: &Polynomial, low: f64, high: f64, tolerance: f64) -> f64 {
    const SCAN: usize = 1000;
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    if high - low <= tolerance {
        return (low + high) / 2.0;
    }
    let step = (high - low) / SCAN as f64;
    let best = (0..=SCAN)
        .min_by(|&a, &b| {
            polynomial
                .eval(low + a as f64 * step)
                .total_cmp(&polynomial.eval(low + b as f64 * step))
        })
        .unwrap_or(0);

    let mut a = (low + (best as f64 - 1.0) * step).max(low);
    let mut b = (low + (best as f64 + 1.0) * step).min(high);
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    while b - a > tolerance {
        let x1 = b - ratio * (b - a);
        let x2 = a + ratio * (b - a);
        if polynomial.eval(x1) < polynomial.eval(x2) {
            b = x2;
        } else {
            a = x1;
        }
    }
    (a + b) / 2.0
}
