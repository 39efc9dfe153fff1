use argmin::core::{Error as ArgminError, Jacobian, Operator};
use chrono::NaiveDate;
use log::warn;
use ndarray::{array, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::delta::IsotopomerDeltas;
use crate::error::Error;
use crate::measurement::MeasurementRow;
use crate::minimisation::{solve_bounded, Convergence, DegradedReason, SolverOptions};
use crate::scrambling::ScramblingCoefficients;
use crate::standards::IsotopeStandards;
use crate::Result;

/// Near natural abundance starting point for (15R-alpha, 15R-beta)
pub const ISOTOPOMER_INITIAL_GUESS: [f64; 2] = [0.0037, 0.0037];

/// Settings of the per-sample isotopomer solve
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsotopomerConfig {
    pub initial_guess: [f64; 2],
    pub solver: SolverOptions,
}

impl Default for IsotopomerConfig {
    fn default() -> Self {
        Self {
            initial_guess: ISOTOPOMER_INITIAL_GUESS,
            solver: SolverOptions::default(),
        }
    }
}

/// Position-specific ratios of one sample.
///
/// Only the two 15N ratios are fitted. 17R closes the 45R mass balance and 18R follows from 17R.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IsotopomerSolution {
    pub r15_alpha: f64,
    pub r15_beta: f64,
    pub r17: f64,
    pub r18: f64,
    pub convergence: Convergence,
}

impl IsotopomerSolution {
    const fn non_finite() -> Self {
        Self {
            r15_alpha: f64::NAN,
            r15_beta: f64::NAN,
            r17: f64::NAN,
            r18: f64::NAN,
            convergence: Convergence::Degraded {
                iterations: 0,
                reason: DegradedReason::NonFinite,
            },
        }
    }
}

/// Scrambling coefficients to correct a batch of samples with
#[derive(Clone, Copy, Debug)]
pub enum CoefficientSource<'a> {
    /// One pair for every row, typically the mean of a scrambling calibration
    Uniform(ScramblingCoefficients),
    /// A pair per row, in row order
    PerRow(&'a [ScramblingCoefficients]),
}

impl CoefficientSource<'_> {
    fn check_len(&self, rows: usize) -> Result<()> {
        match self {
            Self::PerRow(coefficients) if coefficients.len() != rows => Err(Error::CoefficientCount {
                coefficients: coefficients.len(),
                rows,
            }),
            _ => Ok(()),
        }
    }

    fn for_row(&self, index: usize) -> ScramblingCoefficients {
        match self {
            Self::Uniform(coefficients) => *coefficients,
            Self::PerRow(coefficients) => coefficients[index],
        }
    }
}

/// The 46R and 31R equations of a sample in the unknowns (15R-alpha, 15R-beta)
///
/// With `c = 45R - a - b` standing in for 17R,
/// $$
///     (a + b) c + {}^{18}R(c) + a b - {}^{46}R = 0, \qquad
///     (1 - \gamma) a + \kappa b + a b + (c - {}^{31}R)(1 + \gamma a + (1 - \kappa) b) = 0
/// $$
#[derive(Clone, Copy)]
struct IsotopomerEquations {
    r31: f64,
    r45: f64,
    r46: f64,
    cap17o: f64,
    gamma: f64,
    kappa: f64,
    standards: IsotopeStandards,
}

impl IsotopomerEquations {
    fn new(
        row: &MeasurementRow,
        coefficients: ScramblingCoefficients,
        standards: &IsotopeStandards,
    ) -> Self {
        Self {
            r31: row.r31,
            r45: row.r45,
            r46: row.r46,
            cap17o: row.cap17o(),
            gamma: coefficients.gamma(),
            kappa: coefficients.kappa(),
            standards: *standards,
        }
    }

    fn denominator(&self, a: f64, b: f64) -> f64 {
        1. + self.gamma * a + (1. - self.kappa) * b
    }

    /// d(18R)/d(17R) on the mass-dependent line
    fn r18_slope(&self, r17: f64) -> f64 {
        let scaled = self.standards.r17_vsmow * (self.cap17o / 1000. + 1.);
        let exponent = self.standards.o17_beta.recip();
        self.standards.r18_vsmow * exponent * (r17 / scaled).powf(exponent - 1.) / scaled
    }
}

impl Operator for IsotopomerEquations {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, ArgminError> {
        let (a, b) = (p[0], p[1]);
        let r17 = self.r45 - a - b;
        let r18 = self.standards.r18_from_r17(r17, self.cap17o);
        Ok(array![
            (a + b) * r17 + r18 + a * b - self.r46,
            (1. - self.gamma) * a
                + self.kappa * b
                + a * b
                + (r17 - self.r31) * self.denominator(a, b),
        ])
    }
}

impl Jacobian for IsotopomerEquations {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(&self, p: &Self::Param) -> ::std::result::Result<Self::Jacobian, ArgminError> {
        let (a, b) = (p[0], p[1]);
        let r17 = self.r45 - a - b;
        let slope = self.r18_slope(r17);
        let denominator = self.denominator(a, b);
        let offset = r17 - self.r31;
        Ok(array![
            [r17 - (a + b) - slope + b, r17 - (a + b) - slope + a],
            [
                (1. - self.gamma) + b - denominator + offset * self.gamma,
                self.kappa + a - denominator + offset * (1. - self.kappa),
            ],
        ])
    }
}

/// Equal 15N positions that leave 17R at its VSMOW value, so `c` stays positive for depleted
/// samples where the configured guess overshoots 45R
fn feasible_guess(row: &MeasurementRow, standards: &IsotopeStandards) -> [f64; 2] {
    let r15 = (row.r45 - standards.r17_vsmow) / 2.;
    [r15, r15]
}

/// Solve one sample row for its isotopomer ratios
///
/// When the residuals are not finite at the configured guess the solve is retried from a guess
/// with positive 17R. A row that cannot be evaluated from either is returned with non-finite
/// ratios and tagged [`DegradedReason::NonFinite`].
///
/// # Errors
/// Fails if the solver options are invalid or the solver itself errors.
pub fn solve_isotopomer_row(
    row: &MeasurementRow,
    coefficients: ScramblingCoefficients,
    standards: &IsotopeStandards,
    config: &IsotopomerConfig,
) -> Result<IsotopomerSolution> {
    let equations = IsotopomerEquations::new(row, coefficients, standards);
    let solution = match solve_bounded(equations, config.initial_guess, &config.solver) {
        Err(Error::NonFiniteResiduals { initial_guess }) => {
            let retry = feasible_guess(row, standards);
            warn!("sample residuals are not finite at {initial_guess:?}, retrying from {retry:?}");
            match solve_bounded(equations, retry, &config.solver) {
                Err(Error::NonFiniteResiduals { .. }) => {
                    warn!("sample on {} cannot be evaluated", row.run_date);
                    return Ok(IsotopomerSolution::non_finite());
                }
                result => result?,
            }
        }
        result => result?,
    };
    let [r15_alpha, r15_beta] = solution.param;

    let r17 = row.r45 - r15_alpha - r15_beta;
    Ok(IsotopomerSolution {
        r15_alpha,
        r15_beta,
        r17,
        r18: standards.r18_from_r17(r17, row.cap17o()),
        convergence: solution.convergence,
    })
}

/// Recover 15R-alpha, 15R-beta, 17R and 18R for every sample row, in row order.
///
/// # Errors
/// - [`Error::CoefficientCount`] if per-row coefficients do not match the number of rows
/// - [`Error::IncompleteRow`] if a row is missing one of its measured ratios
/// - any error of [`solve_isotopomer_row`]
pub fn solve_isotopomers(
    rows: &[MeasurementRow],
    coefficients: CoefficientSource<'_>,
    standards: &IsotopeStandards,
    config: &IsotopomerConfig,
) -> Result<Vec<IsotopomerSolution>> {
    coefficients.check_len(rows.len())?;
    config.solver.validate()?;

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            if !row.is_complete() {
                return Err(Error::IncompleteRow { index });
            }
            solve_isotopomer_row(row, coefficients.for_row(index), standards, config)
        })
        .collect()
}

/// One row of the corrected sample table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleResult {
    pub run_date: NaiveDate,
    pub sample_id: Option<String>,
    pub ratios: IsotopomerSolution,
    pub deltas: IsotopomerDeltas,
}

/// Solve every sample and express the result in delta notation.
///
/// # Errors
/// See [`solve_isotopomers`].
pub fn correct_samples(
    rows: &[MeasurementRow],
    coefficients: CoefficientSource<'_>,
    standards: &IsotopeStandards,
    config: &IsotopomerConfig,
) -> Result<Vec<SampleResult>> {
    let solutions = solve_isotopomers(rows, coefficients, standards, config)?;
    Ok(rows
        .iter()
        .zip(solutions)
        .map(|(row, ratios)| SampleResult {
            run_date: row.run_date,
            sample_id: row.sample_id.clone(),
            ratios,
            deltas: IsotopomerDeltas::from_ratios(&ratios, standards),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use argmin::core::{Jacobian, Operator};
    use chrono::NaiveDate;
    use ndarray::array;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use proptest::prelude::*;
    use rand_isaac::Isaac64Rng;

    use super::{
        correct_samples, solve_isotopomers, CoefficientSource, IsotopomerConfig,
        IsotopomerEquations,
    };
    use crate::error::Error;
    use crate::measurement::MeasurementRow;
    use crate::minimisation::{finite_difference_jacobian, Convergence, DegradedReason};
    use crate::scrambling::ScramblingCoefficients;
    use crate::standards::IsotopeStandards;

    /// Measured ratios of a sample with known composition under the given scrambling
    fn forward_sample(
        standards: &IsotopeStandards,
        [a, b, r18]: [f64; 3],
        cap17o: f64,
        coefficients: ScramblingCoefficients,
    ) -> MeasurementRow {
        let (gamma, kappa) = (coefficients.gamma(), coefficients.kappa());
        let r17 = standards.r17_from_r18(r18, cap17o);
        let r31 = ((1. - gamma) * a + kappa * b + a * b) / (1. + gamma * a + (1. - kappa) * b) + r17;
        MeasurementRow::new(
            NaiveDate::from_ymd_opt(2021, 7, 12).unwrap(),
            r31,
            a + b + r17,
            (a + b) * r17 + r18 + a * b,
        )
        .with_cap17o(cap17o)
    }

    fn coefficients() -> ScramblingCoefficients {
        ScramblingCoefficients::new(0.17, 0.08).unwrap()
    }

    #[test]
    fn known_isotopomer_ratios_are_recovered() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let standards = IsotopeStandards::default();

        let truths = (0..10)
            .map(|_| {
                [
                    standards.r15_air * rng.gen_range(0.99..1.04),
                    standards.r15_air * rng.gen_range(0.97..1.01),
                    standards.r18_vsmow * rng.gen_range(1.02..1.06),
                ]
            })
            .collect::<Vec<_>>();
        let rows = truths
            .iter()
            .map(|truth| forward_sample(&standards, *truth, 0.0, coefficients()))
            .collect::<Vec<_>>();

        let solutions = solve_isotopomers(
            &rows,
            CoefficientSource::Uniform(coefficients()),
            &standards,
            &IsotopomerConfig::default(),
        )
        .unwrap();

        for (truth, solution) in truths.iter().zip(solutions) {
            assert!(solution.convergence.is_converged());
            approx::assert_relative_eq!(solution.r15_alpha, truth[0], max_relative = 1e-8);
            approx::assert_relative_eq!(solution.r15_beta, truth[1], max_relative = 1e-8);
            approx::assert_relative_eq!(solution.r18, truth[2], max_relative = 1e-8);
        }
    }

    #[test]
    fn depleted_samples_do_not_abort_the_batch() {
        let standards = IsotopeStandards::default();
        let normal = [0.003_73, 0.003_66, 0.002_09];
        let depleted = [
            standards.r15_from_delta(-80.),
            standards.r15_from_delta(-80.),
            1.044 * standards.r18_vsmow,
        ];
        let mut rows = [normal, depleted, normal]
            .iter()
            .map(|truth| forward_sample(&standards, *truth, 0.0, coefficients()))
            .collect::<Vec<_>>();
        // 45R below 2 * 0.0037 puts the default guess at negative 17R
        assert!(rows[1].r45 < 0.0074);
        let mut unphysical = rows[0].clone();
        unphysical.r45 = -1.0;
        rows.push(unphysical);

        let solutions = solve_isotopomers(
            &rows,
            CoefficientSource::Uniform(coefficients()),
            &standards,
            &IsotopomerConfig::default(),
        )
        .unwrap();

        assert_eq!(solutions.len(), 4);
        assert!(solutions[..3].iter().all(|s| s.convergence.is_converged()));
        approx::assert_relative_eq!(solutions[1].r15_alpha, depleted[0], max_relative = 1e-6);
        approx::assert_relative_eq!(solutions[1].r15_beta, depleted[1], max_relative = 1e-6);
        approx::assert_relative_eq!(solutions[1].r18, depleted[2], max_relative = 1e-6);
        approx::assert_relative_eq!(solutions[2].r15_alpha, normal[0], max_relative = 1e-8);

        assert!(solutions[3].r15_alpha.is_nan());
        assert_eq!(
            solutions[3].convergence,
            Convergence::Degraded {
                iterations: 0,
                reason: DegradedReason::NonFinite
            }
        );
    }

    #[test]
    fn per_row_coefficients_must_match_the_rows() {
        let standards = IsotopeStandards::default();
        let rows = vec![
            forward_sample(&standards, [0.003_73, 0.003_66, 0.002_09], 0.0, coefficients());
            3
        ];
        let per_row = vec![coefficients(); 2];

        let result = solve_isotopomers(
            &rows,
            CoefficientSource::PerRow(&per_row),
            &standards,
            &IsotopomerConfig::default(),
        );
        assert!(matches!(
            result,
            Err(Error::CoefficientCount {
                coefficients: 2,
                rows: 3
            })
        ));
    }

    #[test]
    fn incomplete_rows_are_rejected_with_their_index() {
        let standards = IsotopeStandards::default();
        let complete = forward_sample(&standards, [0.003_73, 0.003_66, 0.002_09], 0.0, coefficients());
        let mut incomplete = complete.clone();
        incomplete.r46 = f64::NAN;

        let result = solve_isotopomers(
            &[complete, incomplete],
            CoefficientSource::Uniform(coefficients()),
            &standards,
            &IsotopomerConfig::default(),
        );
        assert!(matches!(result, Err(Error::IncompleteRow { index: 1 })));
    }

    #[test]
    fn sample_table_passes_identifiers_through() {
        let standards = IsotopeStandards::default();
        let row = forward_sample(
            &standards,
            [
                standards.r15_from_delta(15.7),
                standards.r15_from_delta(-3.3),
                1.0445 * standards.r18_vsmow,
            ],
            0.0,
            coefficients(),
        )
        .with_sample_id("CTD-12 40m");

        let results = correct_samples(
            &[row],
            CoefficientSource::Uniform(coefficients()),
            &standards,
            &IsotopomerConfig::default(),
        )
        .unwrap();

        assert_eq!(results[0].sample_id.as_deref(), Some("CTD-12 40m"));
        assert_eq!(
            results[0].run_date,
            NaiveDate::from_ymd_opt(2021, 7, 12).unwrap()
        );
        approx::assert_relative_eq!(results[0].deltas.site_preference, 19.0, max_relative = 1e-6);
        approx::assert_relative_eq!(results[0].deltas.d18o, 44.5, max_relative = 1e-6);
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let standards = IsotopeStandards::default();
        let row = forward_sample(&standards, [0.003_73, 0.003_66, 0.002_09], 0.7, coefficients());
        let equations = IsotopomerEquations::new(&row, coefficients(), &standards);
        let param = array![0.003_71, 0.003_67];

        let numerical = finite_difference_jacobian(&equations, &param, 1e-6);
        let analytic = equations.jacobian(&param).unwrap();
        for (comp, num) in analytic.into_iter().zip(numerical) {
            approx::assert_relative_eq!(comp, num, max_relative = 1e-5);
        }
        assert_eq!(equations.apply(&param).unwrap().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn mass_balance_holds_for_every_solution(
            d15na in -20.0..60.0f64,
            d15nb in -40.0..20.0f64,
            d18o in 20.0..80.0f64,
            cap17o in -1.0..2.0f64,
            gamma in 0.1..0.2f64,
            kappa in 0.05..0.12f64,
        ) {
            let standards = IsotopeStandards::default();
            let coefficients = ScramblingCoefficients::new(gamma, kappa).unwrap();
            let row = forward_sample(
                &standards,
                [
                    standards.r15_from_delta(d15na),
                    standards.r15_from_delta(d15nb),
                    (d18o / 1000. + 1.) * standards.r18_vsmow,
                ],
                cap17o,
                coefficients,
            );

            let solution = solve_isotopomers(
                std::slice::from_ref(&row),
                CoefficientSource::Uniform(coefficients),
                &standards,
                &IsotopomerConfig::default(),
            ).unwrap()[0];

            prop_assert_eq!(solution.r17, row.r45 - solution.r15_alpha - solution.r15_beta);
            prop_assert!((solution.r15_alpha / standards.r15_from_delta(d15na) - 1.).abs() < 1e-8);
        }
    }
}
