use chrono::NaiveDate;
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bulk::BulkRatios;
use crate::error::Warning;
use crate::measurement::MeasurementRow;
use crate::reference::{ReferenceMaterial, ReferenceTable};

/// How same-day duplicate measurements of a reference material are joined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Every combination of the two sides' measurements on a date is emitted
    #[default]
    AllMatches,
    /// Only the first measurement of each side on a date is used
    FirstMatch,
}

/// Measured and resolved ratios of one side of an aligned row
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ReferenceSide {
    pub r31: f64,
    pub r45: f64,
    pub r46: f64,
    pub r15_bulk: f64,
    pub r17: f64,
}

impl ReferenceSide {
    fn is_complete(&self) -> bool {
        [self.r31, self.r45, self.r46, self.r15_bulk, self.r17]
            .iter()
            .all(|value| value.is_finite())
    }
}

/// A tagged reference measurement with its resolved bulk ratios
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReferenceObservation {
    pub run_date: NaiveDate,
    pub ref_tag: String,
    pub side: ReferenceSide,
}

impl ReferenceObservation {
    /// `None` for rows without a reference tag
    pub fn from_row(row: &MeasurementRow, bulk: &BulkRatios) -> Option<Self> {
        let ref_tag = row.reference()?;
        Some(Self {
            run_date: row.run_date,
            ref_tag: ref_tag.to_owned(),
            side: ReferenceSide {
                r31: row.r31,
                r45: row.r45,
                r46: row.r46,
                r15_bulk: bulk.r15_bulk,
                r17: bulk.r17,
            },
        })
    }
}

/// Measurements of two reference materials made on the same date
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AlignedRow {
    pub run_date: NaiveDate,
    pub first: ReferenceSide,
    pub second: ReferenceSide,
    /// Position of each side among the observations of its material, repeated by same-day
    /// duplicates under [`JoinMode::AllMatches`]
    pub observations: [usize; 2],
}

/// The date-joined measurements of an unordered pair of reference materials
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReferencePair {
    pub first: ReferenceMaterial,
    pub second: ReferenceMaterial,
    pub rows: Vec<AlignedRow>,
}

impl ReferencePair {
    pub fn key(&self) -> String {
        format!("{}-{}", self.first.name, self.second.name)
    }

    pub fn first_r31(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.first.r31).collect()
    }

    pub fn second_r31(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.second.r31).collect()
    }

    /// Measured 31R of every distinct observation entering the pair, per material
    pub fn observed_r31(&self) -> [Vec<f64>; 2] {
        [
            self.rows
                .iter()
                .unique_by(|row| row.observations[0])
                .map(|row| row.first.r31)
                .collect(),
            self.rows
                .iter()
                .unique_by(|row| row.observations[1])
                .map(|row| row.second.r31)
                .collect(),
        ]
    }
}

/// Non-empty reference pairs in combination order, with the conditions met while pairing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pairings {
    pub pairs: Vec<ReferencePair>,
    pub warnings: Vec<Warning>,
}

impl Pairings {
    pub fn get(&self, key: &str) -> Option<&ReferencePair> {
        self.pairs.iter().find(|pair| pair.key() == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.pairs.iter().map(ReferencePair::key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferencePair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Reference names in order of first appearance
fn infer_names(observations: &[ReferenceObservation]) -> Vec<String> {
    observations
        .iter()
        .map(|observation| observation.ref_tag.trim())
        .filter(|tag| !tag.is_empty())
        .unique()
        .map(str::to_owned)
        .collect()
}

fn select<'a>(
    observations: &'a [ReferenceObservation],
    name: &str,
) -> Vec<&'a ReferenceObservation> {
    observations
        .iter()
        .filter(|observation| {
            observation.ref_tag.trim() == name && observation.side.is_complete()
        })
        .collect()
}

/// Inner join on date, in the order of the first side
fn join(
    first: &[&ReferenceObservation],
    second: &[&ReferenceObservation],
    mode: JoinMode,
) -> Vec<AlignedRow> {
    let mut rows = vec![];
    let mut seen: Vec<NaiveDate> = vec![];
    for (ii, lhs) in first.iter().enumerate() {
        if mode == JoinMode::FirstMatch {
            if seen.contains(&lhs.run_date) {
                continue;
            }
            seen.push(lhs.run_date);
        }
        let matches = second
            .iter()
            .enumerate()
            .filter(|(_, rhs)| rhs.run_date == lhs.run_date);
        let matches: Vec<_> = match mode {
            JoinMode::AllMatches => matches.collect(),
            JoinMode::FirstMatch => matches.take(1).collect(),
        };
        rows.extend(matches.into_iter().map(|(jj, rhs)| AlignedRow {
            run_date: lhs.run_date,
            first: lhs.side,
            second: rhs.side,
            observations: [ii, jj],
        }));
    }
    rows
}

/// Pair every two reference materials and align their measurements by date.
///
/// `ref_names` fixes the materials and their order, otherwise they are inferred from the tags of
/// `observations`. Names missing from `table` and pairs with no common date are reported in the
/// returned warnings and skipped.
pub fn pair_references(
    observations: &[ReferenceObservation],
    ref_names: Option<&[String]>,
    table: &ReferenceTable,
    mode: JoinMode,
) -> Pairings {
    let mut warnings = vec![];

    let names = ref_names.map_or_else(
        || infer_names(observations),
        |names| {
            names
                .iter()
                .map(|name| name.trim().to_owned())
                .unique()
                .collect()
        },
    );

    let materials = names
        .iter()
        .filter_map(|name| {
            let material = table.get(name);
            if material.is_none() {
                let warning = Warning::UnknownReference { name: name.clone() };
                warn!("{warning}");
                warnings.push(warning);
            }
            material
        })
        .collect::<Vec<_>>();

    let mut pairs = vec![];
    for combination in materials.iter().combinations(2) {
        let (first, second) = (*combination[0], *combination[1]);
        let rows = join(
            &select(observations, &first.name),
            &select(observations, &second.name),
            mode,
        );

        if rows.is_empty() {
            let warning = Warning::NoCommonDates {
                first: first.name.clone(),
                second: second.name.clone(),
            };
            warn!("{warning}");
            warnings.push(warning);
            continue;
        }

        info!(
            "paired {} & {} on {} aligned rows",
            first.name,
            second.name,
            rows.len()
        );
        pairs.push(ReferencePair {
            first: first.clone(),
            second: second.clone(),
            rows,
        });
    }

    Pairings { pairs, warnings }
}
