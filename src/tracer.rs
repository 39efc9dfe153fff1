use argmin::core::{Error as ArgminError, Jacobian, Operator};
use log::warn;
use ndarray::{array, Array1, Array2};
use serde::Serialize;

use crate::error::Error;
use crate::isotopomer::{IsotopomerConfig, IsotopomerSolution};
use crate::minimisation::{solve_bounded, BoundedSolution};
use crate::scrambling::ScramblingCoefficients;
use crate::standards::IsotopeStandards;
use crate::Result;

/// Initial guess of the second attempt when a tracer row cannot be solved from the usual one
const FALLBACK_INITIAL_GUESS: [f64; 2] = [0.0, 0.0];

/// A sample from a 15N-labelling experiment.
///
/// The 17O content is known from the unlabelled start of the incubation and the label only adds
/// 15N, so `ab_t0` and `r46_excess` split 46R into its initial and added parts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TracerRow {
    pub r31: f64,
    pub r45: f64,
    pub r46: f64,
    /// Mass-independent 17O anomaly in per mille
    pub cap17o: f64,
    pub coefficients: ScramblingCoefficients,
    /// d17O vs VSMOW at the start of the incubation, per mille
    pub d17o: f64,
    /// The 15R-alpha times 15R-beta term at the start of the incubation
    pub ab_t0: f64,
    /// 46R added by the label
    pub r46_excess: f64,
}

impl TracerRow {
    fn is_complete(&self) -> bool {
        [
            self.r31,
            self.r45,
            self.r46,
            self.cap17o,
            self.d17o,
            self.ab_t0,
            self.r46_excess,
        ]
        .iter()
        .all(|value| value.is_finite())
    }
}

/// The 46R, 45R and 31R equations of a labelled sample with known 17R
struct TracerEquations {
    row: TracerRow,
    r17: f64,
    r18: f64,
}

impl TracerEquations {
    fn new(row: &TracerRow, standards: &IsotopeStandards) -> Self {
        let r17 = (row.d17o / 1000. + 1.) * standards.r17_vsmow;
        Self {
            row: *row,
            r17,
            r18: standards.r18_from_r17(r17, row.cap17o),
        }
    }
}

impl Operator for TracerEquations {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, ArgminError> {
        let (a, b) = (p[0], p[1]);
        let row = &self.row;
        let (gamma, kappa) = (row.coefficients.gamma(), row.coefficients.kappa());
        let added = row.ab_t0 + row.r46_excess;
        Ok(array![
            (a + b) * self.r17 + self.r18 + added - row.r46,
            a + b + self.r17 - row.r45,
            (1. - gamma) * a
                + kappa * b
                + added
                + (self.r17 - row.r31) * (1. + gamma * a + (1. - kappa) * b),
        ])
    }
}

impl Jacobian for TracerEquations {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(&self, _p: &Self::Param) -> ::std::result::Result<Self::Jacobian, ArgminError> {
        let (gamma, kappa) = (self.row.coefficients.gamma(), self.row.coefficients.kappa());
        let offset = self.r17 - self.row.r31;
        Ok(array![
            [self.r17, self.r17],
            [1., 1.],
            [(1. - gamma) + offset * gamma, kappa + offset * (1. - kappa)],
        ])
    }
}

/// Solve a tracer row for its isotopomer ratios.
///
/// A row whose residuals cannot be evaluated at the configured initial guess is retried once
/// from zero.
///
/// # Errors
/// - [`Error::InvalidBounds`] if the bounds in `config` are invalid
/// - [`Error::IncompleteRow`] if a row contains non-finite inputs
/// - any solver error of the retry
pub fn solve_tracer_row(
    index: usize,
    row: &TracerRow,
    standards: &IsotopeStandards,
    config: &IsotopomerConfig,
) -> Result<IsotopomerSolution> {
    config.solver.validate()?;
    if !row.is_complete() {
        return Err(Error::IncompleteRow { index });
    }

    let solve = |initial_guess| -> Result<BoundedSolution> {
        solve_bounded(TracerEquations::new(row, standards), initial_guess, &config.solver)
    };
    let solution = match solve(config.initial_guess) {
        Ok(solution) => solution,
        Err(e) => {
            warn!("row {index}: {e}, initial guess set to {FALLBACK_INITIAL_GUESS:?}");
            solve(FALLBACK_INITIAL_GUESS)?
        }
    };

    let [r15_alpha, r15_beta] = solution.param;
    let r17 = row.r45 - r15_alpha - r15_beta;
    Ok(IsotopomerSolution {
        r15_alpha,
        r15_beta,
        r17,
        r18: standards.r18_from_r17(r17, row.cap17o),
        convergence: solution.convergence,
    })
}

/// Recover the isotopomer ratios of every tracer row, in row order
///
/// # Errors
/// Fails on the first row [`solve_tracer_row`] fails on.
pub fn solve_tracers(
    rows: &[TracerRow],
    standards: &IsotopeStandards,
    config: &IsotopomerConfig,
) -> Result<Vec<IsotopomerSolution>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| solve_tracer_row(index, row, standards, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use argmin::core::{Jacobian, Operator};
    use ndarray::array;

    use super::{solve_tracers, TracerEquations, TracerRow};
    use crate::error::Error;
    use crate::isotopomer::IsotopomerConfig;
    use crate::minimisation::finite_difference_jacobian;
    use crate::scrambling::ScramblingCoefficients;
    use crate::standards::IsotopeStandards;

    /// A labelled sample with 15R-alpha `a` and 15R-beta `b` after incubation
    fn labelled(standards: &IsotopeStandards, a: f64, b: f64) -> TracerRow {
        let coefficients = ScramblingCoefficients::new(0.17, 0.08).unwrap();
        let (gamma, kappa) = (coefficients.gamma(), coefficients.kappa());
        let d17o = 22.;
        let r17 = (d17o / 1000. + 1.) * standards.r17_vsmow;
        let r18 = standards.r18_from_r17(r17, 0.0);
        let ab_t0 = 0.003_73 * 0.003_66;
        let r46_excess = a * b - ab_t0;

        TracerRow {
            r31: ((1. - gamma) * a + kappa * b + a * b) / (1. + gamma * a + (1. - kappa) * b) + r17,
            r45: a + b + r17,
            r46: (a + b) * r17 + r18 + a * b,
            cap17o: 0.0,
            coefficients,
            d17o,
            ab_t0,
            r46_excess,
        }
    }

    #[test]
    fn labelled_ratios_are_recovered() {
        let standards = IsotopeStandards::default();
        let rows = [
            labelled(&standards, 0.0045, 0.0039),
            labelled(&standards, 0.012, 0.0052),
            labelled(&standards, 0.0038, 0.0037),
        ];

        let solutions = solve_tracers(&rows, &standards, &IsotopomerConfig::default()).unwrap();

        let truths = [(0.0045, 0.0039), (0.012, 0.0052), (0.0038, 0.0037)];
        for ((row, solution), (a, b)) in rows.iter().zip(solutions).zip(truths) {
            approx::assert_relative_eq!(solution.r15_alpha, a, max_relative = 1e-8);
            approx::assert_relative_eq!(solution.r15_beta, b, max_relative = 1e-8);
            approx::assert_relative_eq!(
                solution.r15_alpha + solution.r15_beta + solution.r17,
                row.r45,
                max_relative = 1e-12
            );
            approx::assert_relative_eq!(
                solution.r17,
                (22. / 1000. + 1.) * standards.r17_vsmow,
                max_relative = 1e-6
            );
        }
        let first = &rows[0];
        let equations = TracerEquations::new(first, &standards);
        let residuals = equations.apply(&array![0.0045, 0.0039]).unwrap();
        assert!(residuals.iter().all(|r| r.abs() < 1e-15));
    }

    #[test]
    fn rows_unsolvable_from_the_configured_guess_restart_from_zero() {
        let standards = IsotopeStandards::default();
        let rows = [
            labelled(&standards, 0.0045, 0.0039),
            labelled(&standards, 0.012, 0.0052),
        ];
        let config = IsotopomerConfig {
            initial_guess: [f64::NAN, f64::NAN],
            ..IsotopomerConfig::default()
        };

        let solutions = solve_tracers(&rows, &standards, &config).unwrap();

        for (solution, (a, b)) in solutions.iter().zip([(0.0045, 0.0039), (0.012, 0.0052)]) {
            assert!(solution.convergence.is_converged());
            approx::assert_relative_eq!(solution.r15_alpha, a, max_relative = 1e-8);
            approx::assert_relative_eq!(solution.r15_beta, b, max_relative = 1e-8);
        }
    }

    #[test]
    fn incomplete_rows_are_rejected() {
        let standards = IsotopeStandards::default();
        let mut row = labelled(&standards, 0.0045, 0.0039);
        row.ab_t0 = f64::NAN;

        let result = solve_tracers(&[row], &standards, &IsotopomerConfig::default());
        assert!(matches!(result, Err(Error::IncompleteRow { index: 0 })));
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let standards = IsotopeStandards::default();
        let equations = TracerEquations::new(&labelled(&standards, 0.0045, 0.0039), &standards);
        let param = array![0.0041, 0.0036];

        let numerical = finite_difference_jacobian(&equations, &param, 1e-6);
        let analytic = equations.jacobian(&param).unwrap();
        for (comp, num) in analytic.into_iter().zip(numerical) {
            approx::assert_relative_eq!(comp, num, max_relative = 1e-6);
        }
    }
}
