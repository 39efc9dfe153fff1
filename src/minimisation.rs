use std::fmt;

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{
    Error as ArgminError, Executor, IterState, Jacobian, Operator, Problem, Solver, State,
    TerminationReason, TerminationStatus, KV,
};
use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Iteration state shared by every two-parameter system in the crate
type LeastSquaresState = IterState<Array1<f64>, (), Array2<f64>, (), f64>;

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;

/// Bounds, tolerances and iteration budget for a bounded least-squares solve
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    pub lower_bounds: [f64; 2],
    pub upper_bounds: [f64; 2],
    /// Relative reduction in cost below which the solve is considered converged
    pub ftol: f64,
    /// Relative step length below which the solve is considered converged
    pub xtol: f64,
    pub max_iterations: u64,
    /// Log every iteration through the argmin slog observer
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            lower_bounds: [0.0, 0.0],
            upper_bounds: [1.0, 1.0],
            ftol: 1e-15,
            xtol: 1e-15,
            max_iterations: 2000,
            verbose: false,
        }
    }
}

impl SolverOptions {
    /// Checks the bounds describe a non-empty box
    ///
    /// # Errors
    /// Returns [`Error::InvalidBounds`] if a bound is not finite or a lower bound exceeds its upper
    /// bound.
    pub fn validate(&self) -> Result<()> {
        let valid = self
            .lower_bounds
            .iter()
            .zip(self.upper_bounds.iter())
            .all(|(lower, upper)| lower.is_finite() && upper.is_finite() && lower <= upper);
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidBounds {
                lower: self.lower_bounds,
                upper: self.upper_bounds,
            })
        }
    }

    pub(crate) fn project(&self, param: [f64; 2]) -> [f64; 2] {
        [
            param[0].clamp(self.lower_bounds[0], self.upper_bounds[0]),
            param[1].clamp(self.lower_bounds[1], self.upper_bounds[1]),
        ]
    }

    pub(crate) fn contains(&self, param: [f64; 2]) -> bool {
        param
            .iter()
            .zip(self.lower_bounds.iter().zip(self.upper_bounds.iter()))
            .all(|(p, (lower, upper))| (lower..=upper).contains(&p))
    }
}

/// Why a row result should not be trusted as a converged solution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DegradedReason {
    /// The iteration budget ran out before a tolerance was met, the best iterate is returned
    IterationLimit,
    /// A closed-form solution fell outside the bounds and was clamped into them
    OutsideBounds,
    /// The solution contains non-finite values
    NonFinite,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationLimit => write!(f, "iteration limit reached"),
            Self::OutsideBounds => write!(f, "solution outside bounds"),
            Self::NonFinite => write!(f, "non-finite solution"),
        }
    }
}

/// Convergence status attached to every per-row result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Convergence {
    Converged {
        iterations: u64,
    },
    Degraded {
        iterations: u64,
        reason: DegradedReason,
    },
}

impl Convergence {
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub const fn is_degraded(&self) -> bool {
        !self.is_converged()
    }

    pub const fn iterations(&self) -> u64 {
        match self {
            Self::Converged { iterations } | Self::Degraded { iterations, .. } => *iterations,
        }
    }
}

/// Best parameters found by [`solve_bounded`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundedSolution {
    pub param: [f64; 2],
    /// Half the squared norm of the residual vector at `param`
    pub cost: f64,
    pub convergence: Convergence,
}

/// Minimise the squared norm of the residuals of `problem` within the box in `options`.
///
/// The initial guess is projected into the box before the first iteration. Running out of
/// iterations is not an error, the best iterate is returned tagged as degraded.
///
/// # Errors
/// - [`Error::InvalidBounds`] if `options` describe an empty box
/// - [`Error::NonFiniteResiduals`] if the residuals cannot be evaluated at the initial guess
/// - [`Error::Solver`] if the residual or Jacobian evaluation fails
pub fn solve_bounded<O>(
    problem: O,
    initial_guess: [f64; 2],
    options: &SolverOptions,
) -> Result<BoundedSolution>
where
    O: Operator<Param = Array1<f64>, Output = Array1<f64>>
        + Jacobian<Param = Array1<f64>, Jacobian = Array2<f64>>,
{
    options.validate()?;
    let start = Array1::from(options.project(initial_guess).to_vec());
    let fallback = start.clone();

    let initial_cost = half_squared_norm(&problem.apply(&start)?);
    if !initial_cost.is_finite() {
        return Err(Error::NonFiniteResiduals { initial_guess });
    }

    let solver = ProjectedLevenbergMarquardt::new(options);

    let mut executor = Executor::new(problem, solver).configure(|state: LeastSquaresState| {
        state.param(start).max_iters(options.max_iterations)
    });
    if options.verbose {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }
    let res = executor.run()?;

    let state = res.state();
    let iterations = state.get_iter();
    let (param, cost) = match state.get_best_param() {
        Some(best) => (best.clone(), state.get_best_cost()),
        None => (
            state.get_param().cloned().unwrap_or(fallback),
            state.get_cost(),
        ),
    };

    let param = [param[0], param[1]];
    let convergence = if !(param[0].is_finite() && param[1].is_finite() && cost.is_finite()) {
        Convergence::Degraded {
            iterations,
            reason: DegradedReason::NonFinite,
        }
    } else if matches!(
        state.get_termination_reason(),
        Some(TerminationReason::SolverConverged)
    ) {
        Convergence::Converged { iterations }
    } else {
        Convergence::Degraded {
            iterations,
            reason: DegradedReason::IterationLimit,
        }
    };

    Ok(BoundedSolution {
        param,
        cost,
        convergence,
    })
}

/// Levenberg-Marquardt iteration with trial points projected onto a box.
///
/// Each iteration solves the Marquardt-scaled damped normal equations
/// $$
///     \left(J^T J + \mu \operatorname{diag}(J^T J)\right) \delta = -J^T r
/// $$
/// projects `x + δ` onto the box and accepts the trial point only if the cost does not increase.
/// Rejected trials increase the damping `μ`, shortening the next step.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ProjectedLevenbergMarquardt {
    lower: [f64; 2],
    upper: [f64; 2],
    ftol: f64,
    xtol: f64,
    damping: f64,
    converged: bool,
}

impl ProjectedLevenbergMarquardt {
    fn new(options: &SolverOptions) -> Self {
        Self {
            lower: options.lower_bounds,
            upper: options.upper_bounds,
            ftol: options.ftol,
            xtol: options.xtol,
            damping: INITIAL_DAMPING,
            converged: false,
        }
    }

    fn project(&self, param: &Array1<f64>) -> Array1<f64> {
        param
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(p, (lower, upper))| p.clamp(*lower, *upper))
            .collect()
    }

    /// Solve the damped normal equations, `None` if the system is singular
    fn damped_step(&self, jacobian: &Array2<f64>, residuals: &Array1<f64>) -> Option<Array1<f64>> {
        let jacobian_t = jacobian.t();
        let gradient = jacobian_t.dot(residuals);
        let mut normal = jacobian_t.dot(jacobian);

        let largest = normal.diag().iter().fold(0f64, |a, b| a.max(*b));
        let floor = (largest * f64::EPSILON).max(f64::MIN_POSITIVE);
        for ii in 0..normal.nrows() {
            let diagonal = normal[[ii, ii]];
            normal[[ii, ii]] = diagonal + self.damping * diagonal.max(floor);
        }

        let step = normal.solve(&gradient.mapv(|g| -g)).ok()?;
        step.iter().all(|s| s.is_finite()).then_some(step)
    }
}

impl<O> Solver<O, LeastSquaresState> for ProjectedLevenbergMarquardt
where
    O: Operator<Param = Array1<f64>, Output = Array1<f64>>
        + Jacobian<Param = Array1<f64>, Jacobian = Array2<f64>>,
{
    const NAME: &'static str = "Projected Levenberg-Marquardt";

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        mut state: LeastSquaresState,
    ) -> ::std::result::Result<(LeastSquaresState, Option<KV>), ArgminError> {
        let param = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("parameter vector was not initialised"))?;
        let residuals = problem.apply(&param)?;
        let cost = half_squared_norm(&residuals);
        let jacobian = problem.jacobian(&param)?;
        let tolerance = self.xtol * (self.xtol + l2_norm(&param));

        let Some(step) = self.damped_step(&jacobian, &residuals) else {
            self.damping *= 10.;
            return Ok((state.param(param).cost(cost), None));
        };

        let trial = self.project(&(&param + &step));
        let step_length = l2_norm(&(&trial - &param));
        let trial_cost = half_squared_norm(&problem.apply(&trial)?);

        if trial_cost.is_finite() && trial_cost <= cost {
            self.damping = (self.damping / 3.).max(MIN_DAMPING);
            self.converged = trial_cost <= 0.
                || cost - trial_cost <= self.ftol * cost
                || step_length <= tolerance;
            Ok((state.param(trial).cost(trial_cost), None))
        } else {
            self.damping *= 2.;
            self.converged = step_length <= tolerance;
            Ok((state.param(param).cost(cost), None))
        }
    }

    fn terminate(&mut self, _state: &LeastSquaresState) -> TerminationStatus {
        if self.converged {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        } else {
            TerminationStatus::NotTerminated
        }
    }
}

fn half_squared_norm(residuals: &Array1<f64>) -> f64 {
    0.5 * residuals.dot(residuals)
}

fn l2_norm(vector: &Array1<f64>) -> f64 {
    vector.dot(vector).sqrt()
}

/// Central finite difference approximation to the Jacobian of `problem` at `param`
#[cfg(test)]
pub(crate) fn finite_difference_jacobian<O>(problem: &O, param: &Array1<f64>, delta_rel: f64) -> Array2<f64>
where
    O: Operator<Param = Array1<f64>, Output = Array1<f64>>,
{
    let num_outputs = problem.apply(param).unwrap().len();
    let mut jacobian = Array2::zeros((num_outputs, param.len()));
    for jj in 0..param.len() {
        let delta = param[jj] * delta_rel;
        let mut plus = param.clone();
        plus[jj] += delta;
        let mut minus = param.clone();
        minus[jj] -= delta;
        let column = (problem.apply(&plus).unwrap() - problem.apply(&minus).unwrap()) / (2. * delta);
        jacobian.column_mut(jj).assign(&column);
    }
    jacobian
}
