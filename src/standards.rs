use serde::{Deserialize, Serialize};

/// Exponent of the mass-dependent 17O/18O relation
pub const DEFAULT_O17_BETA: f64 = 0.516;
/// 15N/14N of atmospheric N2 [De Bièvre et al., 1996]
pub const DEFAULT_R15_AIR: f64 = 0.003_676_5;
/// 17O/16O of VSMOW [Li et al., 1988]
pub const DEFAULT_R17_VSMOW: f64 = 0.000_379_9;
/// 18O/16O of VSMOW [Baertschi, 1976]
pub const DEFAULT_R18_VSMOW: f64 = 0.002_005_2;

/// Optional per-experiment overrides of the isotope standards.
///
/// Unset fields fall back to the literature values when the overrides are turned into an
/// [`IsotopeStandards`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StandardsOverrides {
    pub o17_beta: Option<f64>,
    pub r15_air: Option<f64>,
    pub r17_vsmow: Option<f64>,
    pub r18_vsmow: Option<f64>,
}

/// Reference isotope ratios and the oxygen fractionation exponent.
///
/// Constructed once per run and shared read-only with every solver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IsotopeStandards {
    pub o17_beta: f64,
    pub r15_air: f64,
    pub r17_vsmow: f64,
    pub r18_vsmow: f64,
}

impl Default for IsotopeStandards {
    fn default() -> Self {
        Self {
            o17_beta: DEFAULT_O17_BETA,
            r15_air: DEFAULT_R15_AIR,
            r17_vsmow: DEFAULT_R17_VSMOW,
            r18_vsmow: DEFAULT_R18_VSMOW,
        }
    }
}

impl From<StandardsOverrides> for IsotopeStandards {
    fn from(overrides: StandardsOverrides) -> Self {
        let defaults = Self::default();
        Self {
            o17_beta: overrides.o17_beta.unwrap_or(defaults.o17_beta),
            r15_air: overrides.r15_air.unwrap_or(defaults.r15_air),
            r17_vsmow: overrides.r17_vsmow.unwrap_or(defaults.r17_vsmow),
            r18_vsmow: overrides.r18_vsmow.unwrap_or(defaults.r18_vsmow),
        }
    }
}

impl IsotopeStandards {
    /// Convert a per mille 15N value relative to AIR into a 15N/14N ratio
    pub fn r15_from_delta(&self, delta: f64) -> f64 {
        (delta / 1000. + 1.) * self.r15_air
    }

    /// 17R on the mass-dependent line through `r18`, shifted by the anomaly `cap17o` (per mille)
    pub fn r17_from_r18(&self, r18: f64, cap17o: f64) -> f64 {
        self.r17_vsmow * (r18 / self.r18_vsmow).powf(self.o17_beta) * (cap17o / 1000. + 1.)
    }

    /// Inverse of [`Self::r17_from_r18`].
    ///
    /// Returns `NaN` for negative `r17`, which the bounded solvers treat as an infeasible trial.
    pub fn r18_from_r17(&self, r17: f64, cap17o: f64) -> f64 {
        self.r18_vsmow * ((r17 / self.r17_vsmow) / (cap17o / 1000. + 1.)).powf(self.o17_beta.recip())
    }
}
