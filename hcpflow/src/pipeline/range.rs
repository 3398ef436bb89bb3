//! Stage range selectors (`start:stop` by stage name).

use crate::errors::ConfigurationError;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// A slice of the stage sequence selected by name, both ends inclusive.
///
/// `"FreeSurfer:"` runs from FreeSurfer to the end, `":PostFreeSurfer"`
/// from the start through PostFreeSurfer, and a bare `"FMRIVolume"` from
/// FMRIVolume to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRange {
    start: Option<String>,
    stop: Option<String>,
}

impl StageRange {
    /// Selects every stage.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Parses a selector; empty sides are open.
    #[must_use]
    pub fn parse(selector: &str) -> Self {
        let side = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        match selector.split_once(':') {
            Some((start, stop)) => Self {
                start: side(start),
                stop: side(stop),
            },
            None => Self {
                start: side(selector),
                stop: None,
            },
        }
    }

    /// Resolves the selector against an ordered list of stage names.
    pub fn apply(&self, names: &[&str]) -> Result<Range<usize>, ConfigurationError> {
        let index_of = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| ConfigurationError::UnknownStage {
                    name: name.to_string(),
                    available: names.iter().map(|n| (*n).to_string()).collect(),
                })
        };

        let start = self.start.as_deref().map(index_of).transpose()?.unwrap_or(0);
        let end = match self.stop.as_deref() {
            Some(stop) => index_of(stop)? + 1,
            None => names.len(),
        };

        if start >= end {
            return Err(ConfigurationError::EmptyStageRange {
                selector: self.to_string(),
            });
        }
        Ok(start..end)
    }
}

impl FromStr for StageRange {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for StageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.start.as_deref().unwrap_or_default(),
            self.stop.as_deref().unwrap_or_default()
        )
    }
}
