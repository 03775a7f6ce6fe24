use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// -----------------------------------------------------------------------------
// ----- Purpose ---------------------------------------------------------------

/// Why a gateway session is requested. Every variant owns a disjoint client-id
/// range and a concurrency cap in the limits table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Api,
    Backfill,
    Interactive,
    Test,
    Reserved,
}

// -----------------------------------------------------------------------------
// ----- Purpose: Static -------------------------------------------------------

impl Purpose {
    pub const ALL: [Purpose; 5] = [
        Purpose::Api,
        Purpose::Backfill,
        Purpose::Interactive,
        Purpose::Test,
        Purpose::Reserved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Api => "api",
            Purpose::Backfill => "backfill",
            Purpose::Interactive => "interactive",
            Purpose::Test => "test",
            Purpose::Reserved => "reserved",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Purpose::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPurpose(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown purpose '{0}'")]
pub struct UnknownPurpose(pub String);

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("API".parse::<Purpose>().unwrap(), Purpose::Api);
        assert_eq!(" backfill ".parse::<Purpose>().unwrap(), Purpose::Backfill);
        assert!("cli".parse::<Purpose>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&Purpose::Interactive).unwrap();
        assert_eq!(json, "\"interactive\"");
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
