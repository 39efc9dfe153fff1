use argmin::core::{Error as ArgminError, Jacobian, Operator};
use ndarray::{array, Array1, Array2};
use serde::Serialize;

use crate::measurement::MeasurementRow;
use crate::minimisation::{solve_bounded, Convergence, SolverOptions};
use crate::standards::IsotopeStandards;
use crate::Result;

/// Initial guess for (15R, 18R), 18R is that of atmospheric N2O
pub const BULK_INITIAL_GUESS: [f64; 2] = [0.003_676_5, 0.002_094_030_360];

/// Bulk ratios consistent with both measured 45R and 46R
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BulkRatios {
    pub r15_bulk: f64,
    pub r17: f64,
    pub r18: f64,
    pub convergence: Convergence,
}

/// Residuals of the bulk mass balance in the unknowns (15R, 18R)
///
/// $$
///     {}^{45}R = 2\,{}^{15}R + {}^{17}R, \qquad
///     {}^{46}R = {}^{18}R + 2\,{}^{15}R\,{}^{17}R + {}^{15}R^2
/// $$
/// with 17R expressed through 18R on the mass-dependent fractionation line.
struct BulkEquations {
    r45: f64,
    r46: f64,
    cap17o: f64,
    standards: IsotopeStandards,
}

impl BulkEquations {
    fn r17(&self, r18: f64) -> f64 {
        self.standards.r17_from_r18(r18, self.cap17o)
    }

    /// d(17R)/d(18R)
    fn r17_slope(&self, r18: f64) -> f64 {
        self.standards.o17_beta * self.r17(r18) / r18
    }
}

impl Operator for BulkEquations {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, ArgminError> {
        let (r15, r18) = (p[0], p[1]);
        let r17 = self.r17(r18);
        Ok(array![
            2. * r15 + r17 - self.r45,
            r18 + 2. * r15 * r17 + r15.powi(2) - self.r46,
        ])
    }
}

impl Jacobian for BulkEquations {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(&self, p: &Self::Param) -> ::std::result::Result<Self::Jacobian, ArgminError> {
        let (r15, r18) = (p[0], p[1]);
        let r17 = self.r17(r18);
        let slope = self.r17_slope(r18);
        Ok(array![
            [2., slope],
            [2. * r17 + 2. * r15, 1. + 2. * r15 * slope],
        ])
    }
}

/// Solve for the bulk 15R and 18R of one measurement and derive 17R from 18R
///
/// # Errors
/// Fails if the solver options are invalid or the residuals cannot be evaluated at
/// [`BULK_INITIAL_GUESS`].
pub fn resolve_row(
    row: &MeasurementRow,
    standards: &IsotopeStandards,
    options: &SolverOptions,
) -> Result<BulkRatios> {
    let equations = BulkEquations {
        r45: row.r45,
        r46: row.r46,
        cap17o: row.cap17o(),
        standards: *standards,
    };
    let solution = solve_bounded(equations, BULK_INITIAL_GUESS, options)?;
    let [r15_bulk, r18] = solution.param;

    Ok(BulkRatios {
        r15_bulk,
        r17: standards.r17_from_r18(r18, row.cap17o()),
        r18,
        convergence: solution.convergence,
    })
}

/// Resolve self-consistent 15R, 17R and 18R for every row from 45R and 46R alone
///
/// Output rows are in input order.
///
/// # Errors
/// Fails on the first row which cannot be solved, see [`resolve_row`].
pub fn resolve_17r(
    rows: &[MeasurementRow],
    standards: &IsotopeStandards,
    options: &SolverOptions,
) -> Result<Vec<BulkRatios>> {
    rows.iter()
        .map(|row| resolve_row(row, standards, options))
        .collect()
}
