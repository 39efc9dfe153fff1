use serde::{Deserialize, Serialize};

use crate::isotopomer::IsotopomerSolution;

/// Density of seawater in kg/L
pub const SEAWATER_DENSITY: f64 = 1.026;

/// Linear conversion of mass 44 peak area (V s) to nmol of N2O
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct PeakAreaConversion {
    /// nmol per V s
    pub slope: f64,
    #[serde(default)]
    pub intercept: f64,
}

impl PeakAreaConversion {
    pub const fn new(slope: f64) -> Self {
        Self {
            slope,
            intercept: 0.,
        }
    }

    /// nmol of N2O for a mass 44 peak area
    pub fn nmol(&self, peak_area_44: f64) -> f64 {
        peak_area_44.mul_add(self.slope, self.intercept)
    }

    /// N2O concentration in nmol/L of a seawater sample of `sample_weight` grams
    pub fn concentration(&self, peak_area_44: f64, sample_weight: f64) -> f64 {
        let volume = sample_weight / SEAWATER_DENSITY / 1000.;
        self.nmol(peak_area_44) / volume
    }
}

/// Concentrations in nmol/L of the main N2O isotopocules
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IsotopoculeConcentrations {
    pub n2o_44: f64,
    pub n2o_45_alpha: f64,
    pub n2o_45_beta: f64,
    pub n2o_17o: f64,
    pub n2o_46: f64,
}

impl IsotopoculeConcentrations {
    /// Scale the ratios of a sample, all relative to 44N2O, by its 44N2O concentration
    pub fn new(n2o_44: f64, ratios: &IsotopomerSolution) -> Self {
        Self {
            n2o_44,
            n2o_45_alpha: ratios.r15_alpha * n2o_44,
            n2o_45_beta: ratios.r15_beta * n2o_44,
            n2o_17o: ratios.r17 * n2o_44,
            n2o_46: ratios.r18 * n2o_44,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IsotopoculeConcentrations, PeakAreaConversion};
    use crate::isotopomer::IsotopomerSolution;
    use crate::minimisation::Convergence;

    #[test]
    fn peak_area_is_converted_to_a_seawater_concentration() {
        let conversion = PeakAreaConversion::new(0.48);
        approx::assert_relative_eq!(conversion.nmol(10.), 4.8, max_relative = 1e-12);
        // 153 g of seawater is 0.149123 L
        approx::assert_relative_eq!(
            conversion.concentration(10., 153.),
            4.8 / (153. / 1.026 / 1000.),
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(
            conversion.concentration(10., 153.),
            32.188_235_294_117_65,
            max_relative = 1e-9
        );
    }

    #[test]
    fn intercept_offsets_the_amount() {
        let conversion = PeakAreaConversion {
            slope: 0.48,
            intercept: -0.2,
        };
        approx::assert_relative_eq!(conversion.nmol(10.), 4.6, max_relative = 1e-12);
    }

    #[test]
    fn isotopocule_concentrations_scale_with_the_ratios() {
        let ratios = IsotopomerSolution {
            r15_alpha: 0.003_73,
            r15_beta: 0.003_66,
            r17: 0.000_39,
            r18: 0.002_09,
            convergence: Convergence::Converged { iterations: 5 },
        };
        let concentrations = IsotopoculeConcentrations::new(12.5, &ratios);
        approx::assert_relative_eq!(concentrations.n2o_44, 12.5);
        approx::assert_relative_eq!(concentrations.n2o_45_alpha, 0.046_625, max_relative = 1e-12);
        approx::assert_relative_eq!(concentrations.n2o_46, 0.026_125, max_relative = 1e-12);
    }
}
