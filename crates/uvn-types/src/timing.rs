//! Liveness and discovery timing profiles.

use crate::error::{InputError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named parameter sets for the agent's liveness and discovery timers.
///
/// `Fast` trades bus traffic for quicker peer-loss detection; useful on
/// small test networks, wasteful on a real overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingProfile {
    #[default]
    Default,
    Fast,
}

/// Concrete timer values for a profile, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSettings {
    pub liveliness_lease: u32,
    pub hello_period: u32,
    pub retransmit_delay: u32,
    pub status_min_period: u32,
    pub status_max_period: u32,
}

impl TimingProfile {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "default" => Ok(TimingProfile::Default),
            "fast" => Ok(TimingProfile::Fast),
            other => Err(InputError::UnknownTimingProfile(other.to_string())),
        }
    }

    pub fn settings(&self) -> TimingSettings {
        match self {
            TimingProfile::Default => TimingSettings {
                liveliness_lease: 120,
                hello_period: 60,
                retransmit_delay: 5,
                status_min_period: 10,
                status_max_period: 30,
            },
            TimingProfile::Fast => TimingSettings {
                liveliness_lease: 20,
                hello_period: 5,
                retransmit_delay: 1,
                status_min_period: 2,
                status_max_period: 5,
            },
        }
    }
}

impl fmt::Display for TimingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingProfile::Default => f.write_str("default"),
            TimingProfile::Fast => f.write_str("fast"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parsing() {
        assert_eq!(TimingProfile::parse("default").unwrap(), TimingProfile::Default);
        assert_eq!(TimingProfile::parse("FAST").unwrap(), TimingProfile::Fast);
        assert!(TimingProfile::parse("turbo").is_err());
    }

    #[test]
    fn test_fast_is_faster() {
        let default = TimingProfile::Default.settings();
        let fast = TimingProfile::Fast.settings();
        assert!(fast.liveliness_lease < default.liveliness_lease);
        assert!(fast.hello_period < default.hello_period);
    }
}
