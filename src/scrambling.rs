use argmin::core::{Error as ArgminError, Jacobian, Operator};
use log::{debug, warn};
use ndarray::{array, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Warning};
use crate::math::sample_variance;
use crate::minimisation::{solve_bounded, Convergence, DegradedReason, SolverOptions};
use crate::pairing::{AlignedRow, JoinMode, ReferencePair, ReferenceSide};
use crate::reference::ReferenceMaterial;
use crate::standards::IsotopeStandards;
use crate::Result;

/// Starting point of the iterative solve, typical of a Delta V IRMS ion source
pub const SCRAMBLING_INITIAL_GUESS: [f64; 2] = [0.17, 0.08];
/// Site preference separation in per mille below which the algebraic method is unreliable
pub const SP_SEPARATION_THRESHOLD: f64 = 50.;

/// How gamma and kappa are obtained from an aligned row
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Bounded least squares on the two 31R equations
    #[default]
    Iterative,
    /// Closed form solution of the two 31R equations
    Algebraic,
}

/// Validated pair of ion source scrambling coefficients
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScramblingCoefficients {
    gamma: f64,
    kappa: f64,
}

impl ScramblingCoefficients {
    /// # Errors
    /// Returns [`Error::InvalidCoefficients`] if either coefficient is not finite.
    pub fn new(gamma: f64, kappa: f64) -> Result<Self> {
        if gamma.is_finite() && kappa.is_finite() {
            Ok(Self { gamma, kappa })
        } else {
            Err(Error::InvalidCoefficients { gamma, kappa })
        }
    }

    pub const fn gamma(&self) -> f64 {
        self.gamma
    }

    pub const fn kappa(&self) -> f64 {
        self.kappa
    }
}

impl TryFrom<[f64; 2]> for ScramblingCoefficients {
    type Error = Error;

    fn try_from([gamma, kappa]: [f64; 2]) -> Result<Self> {
        Self::new(gamma, kappa)
    }
}

/// Scrambling coefficients of one aligned row with the 31R self-consistency errors
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScramblingSolution {
    pub gamma: f64,
    pub kappa: f64,
    /// Per mille deviation of calculated from measured 31R for the first reference
    pub error1: f64,
    /// Per mille deviation of calculated from measured 31R for the second reference
    pub error2: f64,
    pub convergence: Convergence,
}

impl ScramblingSolution {
    /// The coefficients as input for the isotopomer solver
    ///
    /// # Errors
    /// Returns [`Error::InvalidCoefficients`] for non-finite solutions.
    pub fn coefficients(&self) -> Result<ScramblingCoefficients> {
        ScramblingCoefficients::new(self.gamma, self.kappa)
    }
}

/// Settings of the scrambling calibration
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScramblingConfig {
    /// Reference materials to pair, inferred from the measurement tags when unset
    pub ref_names: Option<Vec<String>>,
    pub method: Method,
    pub initial_guess: [f64; 2],
    /// Weight each reference equation by the relative inverse variance of its 31R
    pub weights: bool,
    pub join: JoinMode,
    pub solver: SolverOptions,
}

impl Default for ScramblingConfig {
    fn default() -> Self {
        Self {
            ref_names: None,
            method: Method::default(),
            initial_guess: SCRAMBLING_INITIAL_GUESS,
            weights: false,
            join: JoinMode::default(),
            solver: SolverOptions::default(),
        }
    }
}

/// Known and measured terms of one side of the 31R equation
#[derive(Clone, Copy, Debug)]
struct SideTerms {
    /// Known 15R-alpha
    a: f64,
    /// Known 15R-beta
    b: f64,
    /// Measured 31R
    x: f64,
    r17: f64,
}

impl SideTerms {
    const fn new(material: &ReferenceMaterial, side: &ReferenceSide) -> Self {
        Self {
            a: material.r15_alpha,
            b: material.r15_beta,
            x: side.r31,
            r17: side.r17,
        }
    }

    /// Mass 30 normalisation `1 + γa + (1 - κ)b`
    fn denominator(&self, gamma: f64, kappa: f64) -> f64 {
        (1. - kappa).mul_add(self.b, gamma.mul_add(self.a, 1.))
    }

    /// Mass 31 signal relative to mass 30 excluding the 17O contribution
    fn numerator(&self, gamma: f64, kappa: f64) -> f64 {
        (1. - gamma) * self.a + kappa * self.b + self.a * self.b
    }

    fn residual(&self, gamma: f64, kappa: f64) -> f64 {
        (self.r17 - self.x).mul_add(self.denominator(gamma, kappa), self.numerator(gamma, kappa))
    }

    /// `1 + 31R - 17R`, common factor of both partial derivatives
    fn scale(&self) -> f64 {
        1. + self.x - self.r17
    }

    fn calculated_r31(&self, gamma: f64, kappa: f64) -> f64 {
        let denominator = self.denominator(gamma, kappa);
        self.r17.mul_add(denominator, self.numerator(gamma, kappa)) / denominator
    }

    /// Gamma solving this side's equation for a given kappa
    fn gamma_given_kappa(&self, kappa: f64) -> f64 {
        let (a, b) = (self.a, self.b);
        (a + kappa * b + a * b - (self.x - self.r17) * (1. + (1. - kappa) * b)) / (a * self.scale())
    }

    /// Intercept of [`Self::gamma_given_kappa`] viewed as a line in kappa
    fn gamma_intercept(&self) -> f64 {
        (self.a - self.x + self.r17) * (1. + self.b) / (self.a * self.scale())
    }
}

/// The pair of 31R equations in the unknowns (gamma, kappa)
///
/// $$
///     (1 - \gamma) a_i + \kappa b_i + a_i b_i + ({}^{17}R_i - x_i)(1 + \gamma a_i + (1 - \kappa) b_i) = 0
/// $$
/// scaled by the weight of each reference.
struct ScramblingEquations {
    sides: [SideTerms; 2],
    weights: [f64; 2],
}

impl Operator for ScramblingEquations {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, ArgminError> {
        Ok(self
            .sides
            .iter()
            .zip(self.weights)
            .map(|(side, weight)| weight * side.residual(p[0], p[1]))
            .collect())
    }
}

impl Jacobian for ScramblingEquations {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    // Both equations are linear in gamma and kappa
    fn jacobian(&self, _p: &Self::Param) -> ::std::result::Result<Self::Jacobian, ArgminError> {
        let [first, second] = self.sides;
        let [w1, w2] = self.weights;
        Ok(array![
            [-w1 * first.a * first.scale(), w1 * first.b * first.scale()],
            [-w2 * second.a * second.scale(), w2 * second.b * second.scale()],
        ])
    }
}

/// Relative inverse-variance weights of two reference 31R columns
///
/// Returns `[var2 / (var1 + var2), var1 / (var1 + var2)]`, so the noisier reference contributes
/// less to the fit. Falls back to equal weights if either variance is zero or not finite.
pub fn compute_weights(first: &[f64], second: &[f64]) -> [f64; 2] {
    let (var1, var2) = (sample_variance(first), sample_variance(second));
    let usable = |var: f64| var.is_finite() && var > 0.;
    if usable(var1) && usable(var2) {
        let total = var1 + var2;
        [var2 / total, var1 / total]
    } else {
        [1., 1.]
    }
}

/// Per mille deviation of the 31R calculated from `coefficients` and the measured 31R of each side
pub fn check_31r_error(
    coefficients: [f64; 2],
    row: &AlignedRow,
    first: &ReferenceMaterial,
    second: &ReferenceMaterial,
) -> (f64, f64) {
    let [gamma, kappa] = coefficients;
    let error = |terms: SideTerms| (terms.calculated_r31(gamma, kappa) / terms.x - 1.) * 1000.;
    (
        error(SideTerms::new(first, &row.first)),
        error(SideTerms::new(second, &row.second)),
    )
}

/// Warns when the two references are too alike in site preference for the algebraic method
pub fn check_separation(
    first: &ReferenceMaterial,
    second: &ReferenceMaterial,
    standards: &IsotopeStandards,
) -> Option<Warning> {
    let separation =
        (first.site_preference(standards) - second.site_preference(standards)).abs();
    (separation < SP_SEPARATION_THRESHOLD).then(|| Warning::PoorlySeparatedReferences {
        first: first.name.clone(),
        second: second.name.clone(),
        separation,
        threshold: SP_SEPARATION_THRESHOLD,
    })
}

fn solve_iterative(
    sides: [SideTerms; 2],
    weights: [f64; 2],
    config: &ScramblingConfig,
) -> Result<([f64; 2], Convergence)> {
    let solution = solve_bounded(
        ScramblingEquations { sides, weights },
        config.initial_guess,
        &config.solver,
    )?;
    Ok((solution.param, solution.convergence))
}

fn solve_algebraic(sides: [SideTerms; 2], options: &SolverOptions) -> ([f64; 2], Convergence) {
    let [first, second] = sides;
    let kappa = (first.gamma_intercept() - second.gamma_intercept())
        / (second.b / second.a - first.b / first.a);
    let gamma = first.gamma_given_kappa(kappa);
    debug!(
        "algebraic gamma disagreement between references: {:e}",
        gamma - second.gamma_given_kappa(kappa)
    );

    let param = [gamma, kappa];
    if !(gamma.is_finite() && kappa.is_finite()) {
        let convergence = Convergence::Degraded {
            iterations: 0,
            reason: DegradedReason::NonFinite,
        };
        return (param, convergence);
    }
    if options.contains(param) {
        (param, Convergence::Converged { iterations: 0 })
    } else {
        let convergence = Convergence::Degraded {
            iterations: 0,
            reason: DegradedReason::OutsideBounds,
        };
        (options.project(param), convergence)
    }
}

/// Scrambling solutions for every row of a reference pair
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairCalibration {
    pub key: String,
    /// Weights applied to the first and second reference equation
    pub weights: [f64; 2],
    pub solutions: Vec<ScramblingSolution>,
    pub warnings: Vec<Warning>,
}

impl PairCalibration {
    pub fn degraded(&self) -> usize {
        self.solutions
            .iter()
            .filter(|solution| solution.convergence.is_degraded())
            .count()
    }
}

/// Solve gamma and kappa for each aligned row of `pair`, in row order.
///
/// # Errors
/// Fails if the solver options in `config` are invalid or a row's residuals are not finite at
/// the initial guess.
pub fn solve_scrambling(
    pair: &ReferencePair,
    config: &ScramblingConfig,
    standards: &IsotopeStandards,
) -> Result<PairCalibration> {
    config.solver.validate()?;

    let mut warnings = vec![];
    if config.method == Method::Algebraic {
        if let Some(warning) = check_separation(&pair.first, &pair.second, standards) {
            warn!("{warning}");
            warnings.push(warning);
        }
    }

    let weights = if config.weights {
        let [first, second] = pair.observed_r31();
        compute_weights(&first, &second)
    } else {
        [1., 1.]
    };
    debug!("{} equation weights: {weights:?}", pair.key());

    let solutions = pair
        .rows
        .iter()
        .map(|row| -> Result<ScramblingSolution> {
            let sides = [
                SideTerms::new(&pair.first, &row.first),
                SideTerms::new(&pair.second, &row.second),
            ];
            let (param, convergence) = match config.method {
                Method::Iterative => solve_iterative(sides, weights, config)?,
                Method::Algebraic => solve_algebraic(sides, &config.solver),
            };
            let (error1, error2) = check_31r_error(param, row, &pair.first, &pair.second);
            Ok(ScramblingSolution {
                gamma: param[0],
                kappa: param[1],
                error1,
                error2,
                convergence,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PairCalibration {
        key: pair.key(),
        weights,
        solutions,
        warnings,
    })
}
