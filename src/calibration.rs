use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bulk::resolve_row;
use crate::error::Warning;
use crate::isotopomer::{correct_samples, CoefficientSource, IsotopomerConfig, SampleResult};
use crate::math::{mean, sample_std};
use crate::measurement::MeasurementRow;
use crate::minimisation::SolverOptions;
use crate::pairing::{pair_references, ReferenceObservation};
use crate::reference::{ReferenceDeltas, ReferenceTable};
use crate::scrambling::{solve_scrambling, PairCalibration, ScramblingCoefficients, ScramblingConfig};
use crate::standards::{IsotopeStandards, StandardsOverrides};
use crate::Result;

/// Everything a calibration run can be configured with.
///
/// Every section is optional, an empty document describes a run with literature standards, the
/// built-in reference gases and the iterative scrambling method.
///
/// ```toml
/// [standards]
/// r15_air = 0.0036765
///
/// [scrambling]
/// ref_names = ["ATM", "S2", "B6"]
/// method = "algebraic"
/// join = "first_match"
///
/// [[references]]
/// ref_tag = "ATM"
/// d15na = 15.7
/// d15nb = -3.3
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub standards: StandardsOverrides,
    /// Solver settings of the 45R/46R bulk resolution of reference rows
    pub bulk: SolverOptions,
    pub scrambling: ScramblingConfig,
    pub isotopomer: IsotopomerConfig,
    /// Per-dataset isotope constants, replacing the built-in reference table when given
    pub references: Vec<ReferenceDeltas>,
}

impl Config {
    /// # Errors
    /// Returns [`crate::error::Error::Config`] if the document is not a valid configuration.
    pub fn from_toml(document: &str) -> Result<Self> {
        Ok(toml::from_str(document)?)
    }

    /// # Errors
    /// Fails if the file cannot be read or does not hold a valid configuration.
    pub fn from_path(path: &Path) -> Result<Self> {
        let document = fs::read_to_string(path)?;
        Self::from_toml(&document)
    }

    pub fn standards(&self) -> IsotopeStandards {
        IsotopeStandards::from(self.standards)
    }

    pub fn reference_table(&self, standards: &IsotopeStandards) -> ReferenceTable {
        if self.references.is_empty() {
            ReferenceTable::builtin()
        } else {
            ReferenceTable::from_deltas(&self.references, standards)
        }
    }
}

/// Spread of the scrambling coefficients across every pair and row
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Summary {
    /// Number of rows with finite coefficients entering the statistics
    pub rows: usize,
    /// Number of rows flagged as degraded, including those excluded from the statistics
    pub degraded: usize,
    pub gamma_mean: f64,
    pub gamma_std: f64,
    pub kappa_mean: f64,
    pub kappa_std: f64,
}

impl Summary {
    fn from_pairs(pairs: &[PairCalibration]) -> Self {
        let (gammas, kappas): (Vec<f64>, Vec<f64>) = pairs
            .iter()
            .flat_map(|pair| pair.solutions.iter())
            .filter(|solution| solution.gamma.is_finite() && solution.kappa.is_finite())
            .map(|solution| (solution.gamma, solution.kappa))
            .unzip();

        Self {
            rows: gammas.len(),
            degraded: pairs.iter().map(PairCalibration::degraded).sum(),
            gamma_mean: mean(&gammas),
            gamma_std: sample_std(&gammas),
            kappa_mean: mean(&kappas),
            kappa_std: sample_std(&kappas),
        }
    }

    /// The mean coefficients, ready to correct samples with
    ///
    /// # Errors
    /// Returns [`crate::error::Error::InvalidCoefficients`] when no row produced coefficients.
    pub fn coefficients(&self) -> Result<ScramblingCoefficients> {
        ScramblingCoefficients::new(self.gamma_mean, self.kappa_mean)
    }
}

/// Outcome of the scrambling calibration
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScramblingReport {
    /// Per pair solutions in pairing order
    pub pairs: Vec<PairCalibration>,
    /// Every recoverable condition met while pairing and solving
    pub warnings: Vec<Warning>,
    pub summary: Summary,
}

impl ScramblingReport {
    pub fn pair(&self, key: &str) -> Option<&PairCalibration> {
        self.pairs.iter().find(|pair| pair.key == key)
    }
}

/// Derive the scrambling coefficients from the reference rows of `rows`.
///
/// Reference rows are resolved into bulk ratios, paired by date and solved pair by pair.
/// Rows without a reference tag and incomplete reference rows are ignored.
///
/// # Errors
/// Fails if a solver is misconfigured or a row cannot be evaluated at its initial guess.
pub fn calibrate(rows: &[MeasurementRow], config: &Config) -> Result<ScramblingReport> {
    let standards = config.standards();
    let table = config.reference_table(&standards);

    let mut observations = vec![];
    for row in rows.iter().filter(|row| row.reference().is_some()) {
        if !row.is_complete() {
            continue;
        }
        let bulk = resolve_row(row, &standards, &config.bulk)?;
        if bulk.convergence.is_degraded() {
            warn!(
                "bulk ratios of {:?} on {} are degraded: {:?}",
                row.reference(),
                row.run_date,
                bulk.convergence
            );
        }
        observations.extend(ReferenceObservation::from_row(row, &bulk));
    }
    info!("resolved bulk ratios of {} reference rows", observations.len());

    let pairings = pair_references(
        &observations,
        config.scrambling.ref_names.as_deref(),
        &table,
        config.scrambling.join,
    );
    let mut warnings = pairings.warnings.clone();
    if pairings.is_empty() {
        warn!("no two reference materials share a run date");
    } else {
        info!("calibrating on {} reference pairs", pairings.len());
    }

    let mut pairs = vec![];
    for pair in pairings.iter() {
        let calibration = solve_scrambling(pair, &config.scrambling, &standards)?;
        let summary = Summary::from_pairs(std::slice::from_ref(&calibration));
        info!(
            "{}: gamma = {:.6} ± {:.6}, kappa = {:.6} ± {:.6} over {} rows",
            calibration.key,
            summary.gamma_mean,
            summary.gamma_std,
            summary.kappa_mean,
            summary.kappa_std,
            summary.rows
        );
        if summary.degraded > 0 {
            warn!(
                "{}: {} of {} rows did not converge cleanly",
                calibration.key,
                summary.degraded,
                calibration.solutions.len()
            );
        }
        warnings.extend(calibration.warnings.iter().cloned());
        pairs.push(calibration);
    }

    let summary = Summary::from_pairs(&pairs);
    Ok(ScramblingReport {
        pairs,
        warnings,
        summary,
    })
}

/// Scrambling calibration and the corrected sample table of one run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Calibration {
    pub scrambling: ScramblingReport,
    pub samples: Vec<SampleResult>,
    /// Sample rows left out of the correction
    pub warnings: Vec<Warning>,
}

/// Calibrate on the reference rows of `rows`, then correct the remaining complete rows with the
/// mean coefficients.
///
/// # Errors
/// Fails if [`calibrate`] fails or no reference pair produced coefficients.
pub fn run(rows: &[MeasurementRow], config: &Config) -> Result<Calibration> {
    let scrambling = calibrate(rows, config)?;
    let coefficients = scrambling.summary.coefficients()?;

    let mut warnings = vec![];
    let mut sample_rows = vec![];
    for (index, row) in rows.iter().enumerate() {
        if row.reference().is_some() {
            continue;
        }
        if row.is_complete() {
            sample_rows.push(row.clone());
        } else {
            let warning = Warning::IncompleteSample { index };
            warn!("{warning}");
            warnings.push(warning);
        }
    }
    let samples = correct_samples(
        &sample_rows,
        CoefficientSource::Uniform(coefficients),
        &config.standards(),
        &config.isotopomer,
    )?;
    info!("corrected {} sample rows", samples.len());

    Ok(Calibration {
        scrambling,
        samples,
        warnings,
    })
}
