//! When cached metadata may be answered from, and what to do when it may not.

use crate::error::{MdsError, Result};
use chrono::{NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

/// How a lookup treats cached metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshOption {
    /// Reload only when nothing is loaded or the data is past its next update.
    #[default]
    Needed,
    /// Always reload before answering.
    Force,
    /// Never reload. Fail with [MdsError::StaleData] when a reload would be needed.
    Error,
}

impl From<bool> for RefreshOption {
    fn from(force: bool) -> Self {
        if force {
            RefreshOption::Force
        } else {
            RefreshOption::Needed
        }
    }
}

impl FromStr for RefreshOption {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "needed" | "false" => Ok(RefreshOption::Needed),
            "force" | "true" => Ok(RefreshOption::Force),
            "error" => Ok(RefreshOption::Error),
            _ => Err(MdsError::InvalidParameter(format!(
                "Unknown refresh option {s}."
            ))),
        }
    }
}

impl fmt::Display for RefreshOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshOption::Needed => write!(f, "needed"),
            RefreshOption::Force => write!(f, "force"),
            RefreshOption::Error => write!(f, "error"),
        }
    }
}

/// The state of the cached metadata relative to a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Absent,
    /// Loaded, but `nextUpdate` has been reached.
    Stale(NaiveDate),
    Fresh,
}

impl Freshness {
    /// Data is stale from the first day of its `nextUpdate` onwards.
    pub fn at(next_update: Option<NaiveDate>, today: NaiveDate) -> Self {
        match next_update {
            None => Freshness::Absent,
            Some(next) if next <= today => Freshness::Stale(next),
            Some(_) => Freshness::Fresh,
        }
    }

    pub fn now(next_update: Option<NaiveDate>) -> Self {
        Self::at(next_update, Utc::now().date_naive())
    }

    pub fn is_fresh(self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// What a lookup must do before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    Answer,
    Reload,
}

impl RefreshOption {
    /// Decide whether to reload, given the freshness of what is cached.
    pub fn decide(self, freshness: Freshness) -> Result<RefreshAction> {
        match (self, freshness) {
            (RefreshOption::Force, _) => Ok(RefreshAction::Reload),
            (_, Freshness::Fresh) => Ok(RefreshAction::Answer),
            (RefreshOption::Needed, _) => Ok(RefreshAction::Reload),
            (RefreshOption::Error, Freshness::Stale(next)) => Err(MdsError::StaleData {
                next_update: Some(next),
            }),
            (RefreshOption::Error, Freshness::Absent) => {
                Err(MdsError::StaleData { next_update: None })
            }
        }
    }
}
