use serde::Serialize;

use crate::bulk::BulkRatios;
use crate::isotopomer::IsotopomerSolution;
use crate::standards::IsotopeStandards;

/// Per mille deviation of `ratio` from the standard ratio `reference`
pub fn delta(ratio: f64, reference: f64) -> f64 {
    1000. * (ratio / reference - 1.)
}

/// Isotopocule delta values in per mille, nitrogen against AIR and oxygen against VSMOW
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct IsotopomerDeltas {
    pub d15n_alpha: f64,
    pub d15n_beta: f64,
    /// 15N site preference, `d15n_alpha - d15n_beta`
    pub site_preference: f64,
    pub d15n_bulk: f64,
    pub d17o: f64,
    pub d18o: f64,
}

impl IsotopomerDeltas {
    pub fn from_ratios(solution: &IsotopomerSolution, standards: &IsotopeStandards) -> Self {
        let d15n_alpha = delta(solution.r15_alpha, standards.r15_air);
        let d15n_beta = delta(solution.r15_beta, standards.r15_air);
        Self {
            d15n_alpha,
            d15n_beta,
            site_preference: d15n_alpha - d15n_beta,
            d15n_bulk: (d15n_alpha + d15n_beta) / 2.,
            d17o: delta(solution.r17, standards.r17_vsmow),
            d18o: delta(solution.r18, standards.r18_vsmow),
        }
    }
}

/// Delta values of the bulk ratios resolved from 45R and 46R
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BulkDeltas {
    pub d15n_bulk: f64,
    pub d17o: f64,
    pub d18o: f64,
}

impl BulkDeltas {
    pub fn from_ratios(bulk: &BulkRatios, standards: &IsotopeStandards) -> Self {
        Self {
            d15n_bulk: delta(bulk.r15_bulk, standards.r15_air),
            d17o: delta(bulk.r17, standards.r17_vsmow),
            d18o: delta(bulk.r18, standards.r18_vsmow),
        }
    }
}
