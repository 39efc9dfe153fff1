use serde::Serialize;
use thiserror::Error;

/// Errors which abort a solve or a configuration load.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid scrambling coefficients: gamma = {gamma}, kappa = {kappa}")]
    InvalidCoefficients { gamma: f64, kappa: f64 },
    #[error("lower bounds {lower:?} are not below upper bounds {upper:?}")]
    InvalidBounds { lower: [f64; 2], upper: [f64; 2] },
    #[error("{coefficients} scrambling coefficient pairs supplied for {rows} sample rows")]
    CoefficientCount { coefficients: usize, rows: usize },
    #[error("sample row {index} is missing one of 31R, 45R or 46R")]
    IncompleteRow { index: usize },
    #[error("residuals are not finite at the initial guess {initial_guess:?}")]
    NonFiniteResiduals { initial_guess: [f64; 2] },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Solver(#[from] argmin::core::Error),
}

/// Conditions which are recovered from locally, logged and reported alongside the results.
#[derive(Clone, Debug, PartialEq, Error, Serialize)]
pub enum Warning {
    #[error("reference material {name} has no known isotope constants and was excluded")]
    UnknownReference { name: String },
    #[error("no matching dates for reference materials {first} & {second}")]
    NoCommonDates { first: String, second: String },
    #[error(
        "site preference of {first} and {second} differs by {separation:.2} per mil; \
         the algebraic method is unreliable below {threshold} per mil, consider the iterative method"
    )]
    PoorlySeparatedReferences {
        first: String,
        second: String,
        separation: f64,
        threshold: f64,
    },
    #[error("input row {index} is missing one of 31R, 45R or 46R and was not corrected")]
    IncompleteSample { index: usize },
}
