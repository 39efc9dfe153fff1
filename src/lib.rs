#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

// Links the BLAS backend used by ndarray-linalg
extern crate blas_src;

pub mod bulk;
pub mod calibration;
pub mod concentration;
pub mod delta;
pub mod error;
pub mod isotopomer;
pub mod math;
pub mod measurement;
pub mod minimisation;
pub mod pairing;
pub mod reference;
pub mod scrambling;
pub mod standards;
pub mod tracer;

pub use calibration::{calibrate, run, Config};
pub use error::{Error, Warning};
pub use measurement::MeasurementRow;
pub use standards::IsotopeStandards;

pub type Result<T> = ::std::result::Result<T, Error>;
