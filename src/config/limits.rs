use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use thiserror::Error;

use crate::shared_types::{ClientId, Purpose};

// -----------------------------------------------------------------------------
// ----- PurposeLimit ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurposeLimit {
    pub min_id: ClientId,
    pub max_id: ClientId,
    pub max_concurrent: usize,
}

impl PurposeLimit {
    pub const fn new(min_id: ClientId, max_id: ClientId, max_concurrent: usize) -> Self {
        Self {
            min_id,
            max_id,
            max_concurrent,
        }
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.ids().contains(&id)
    }

    pub fn ids(&self) -> RangeInclusive<ClientId> {
        self.min_id..=self.max_id
    }

    pub fn capacity(&self) -> usize {
        (self.max_id - self.min_id) as usize + 1
    }

    fn overlaps(&self, other: &PurposeLimit) -> bool {
        self.min_id <= other.max_id && other.min_id <= self.max_id
    }
}

// -----------------------------------------------------------------------------
// ----- LimitsTable -----------------------------------------------------------

/// Purpose -> id range + concurrency cap. Construction guarantees every
/// `Purpose` has exactly one entry and that ranges are disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsTable {
    by_purpose: BTreeMap<Purpose, PurposeLimit>,
}

// -----------------------------------------------------------------------------
// ----- LimitsTable: Static ---------------------------------------------------

impl LimitsTable {
    pub fn new(entries: impl IntoIterator<Item = (Purpose, PurposeLimit)>) -> Result<Self, LimitsError> {
        let mut by_purpose = BTreeMap::new();
        for (purpose, limit) in entries {
            if by_purpose.insert(purpose, limit).is_some() {
                return Err(LimitsError::DuplicateLimit { purpose });
            }
        }

        let table = Self { by_purpose };
        table.validate()?;
        Ok(table)
    }

    pub(crate) fn from_file_entries(raw: HashMap<String, LimitsFileEntry>) -> Result<Self, LimitsError> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, entry) in raw {
            let purpose = key
                .parse::<Purpose>()
                .map_err(|_| LimitsError::UnknownPurpose { name: key.clone() })?;
            let [min_id, max_id] = entry.id_range;
            entries.push((purpose, PurposeLimit::new(min_id, max_id, entry.max_concurrent)));
        }
        Self::new(entries)
    }
}

impl Default for LimitsTable {
    fn default() -> Self {
        let by_purpose = BTreeMap::from([
            (Purpose::Api, PurposeLimit::new(1, 10, 5)),
            (Purpose::Backfill, PurposeLimit::new(11, 20, 3)),
            (Purpose::Interactive, PurposeLimit::new(21, 30, 2)),
            (Purpose::Test, PurposeLimit::new(31, 40, 2)),
            (Purpose::Reserved, PurposeLimit::new(41, 50, 1)),
        ]);
        Self { by_purpose }
    }
}

// -----------------------------------------------------------------------------
// ----- LimitsTable: Public ---------------------------------------------------

impl LimitsTable {
    pub fn get(&self, purpose: Purpose) -> PurposeLimit {
        // Every variant is present once validate() has passed.
        self.by_purpose[&purpose]
    }

    pub fn purpose_of(&self, id: ClientId) -> Option<Purpose> {
        self.by_purpose
            .iter()
            .find(|(_, limit)| limit.contains(id))
            .map(|(purpose, _)| *purpose)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Purpose, PurposeLimit)> + '_ {
        self.by_purpose.iter().map(|(p, l)| (*p, *l))
    }
}

// -----------------------------------------------------------------------------
// ----- LimitsTable: Private --------------------------------------------------

impl LimitsTable {
    fn validate(&self) -> Result<(), LimitsError> {
        for purpose in Purpose::ALL {
            let Some(limit) = self.by_purpose.get(&purpose) else {
                return Err(LimitsError::MissingLimit { purpose });
            };

            if limit.min_id == 0 || limit.min_id > limit.max_id {
                return Err(LimitsError::InvalidRange {
                    purpose,
                    min: limit.min_id,
                    max: limit.max_id,
                });
            }

            if limit.max_concurrent == 0 {
                return Err(LimitsError::ZeroCap { purpose });
            }
        }

        let entries: Vec<_> = self.iter().collect();
        for (i, (a, la)) in entries.iter().enumerate() {
            for (b, lb) in &entries[i + 1..] {
                if la.overlaps(lb) {
                    return Err(LimitsError::OverlappingRanges { a: *a, b: *b });
                }
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LimitsFileEntry {
    id_range: [ClientId; 2],
    max_concurrent: usize,
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("no [limits.{purpose}] entry; every purpose needs an id range and cap")]
    MissingLimit { purpose: Purpose },

    #[error("duplicate limits entry for purpose '{purpose}'")]
    DuplicateLimit { purpose: Purpose },

    #[error("unknown purpose '{name}' in [limits]")]
    UnknownPurpose { name: String },

    #[error("invalid id range [{min}, {max}] for purpose '{purpose}'")]
    InvalidRange {
        purpose: Purpose,
        min: ClientId,
        max: ClientId,
    },

    #[error("max_concurrent must be at least 1 for purpose '{purpose}'")]
    ZeroCap { purpose: Purpose },

    #[error("id ranges of '{a}' and '{b}' overlap")]
    OverlappingRanges { a: Purpose, b: Purpose },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
