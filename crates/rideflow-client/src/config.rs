//! Runtime configuration and deployment profiles.

use std::{fmt, str::FromStr, time::Duration};

use rideflow_core::CoordinatorConfig;

use crate::error::ConfigError;

/// How often each trip task runs coordinator timers.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Deployment profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Profile {
    /// Local backend, verbose logs
    #[default]
    Development,
    /// Pre-release backend
    Staging,
    /// Production backend, quiet logs
    Production,
}

impl Profile {
    /// All profiles.
    pub const ALL: [Self; 3] = [Self::Development, Self::Staging, Self::Production];

    /// Lowercase profile name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    /// Real-time endpoint for the profile's backend.
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Development => "http://localhost:3000",
            Self::Staging => "https://staging-api.rideflow.dev",
            Self::Production => "https://api.rideflow.dev",
        }
    }

    /// Default log filter directive.
    pub const fn log_level(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Staging => "info",
            Self::Production => "warn",
        }
    }

    /// Runtime configuration for the profile.
    pub fn config(self) -> ClientConfig {
        let mut config = ClientConfig { profile: self, ..ClientConfig::default() };
        match self {
            Self::Development => {
                // Surface stuck gaps quickly while iterating.
                config.coordinator.sequencer.gap_wait = Duration::from_secs(2);
                config.coordinator.channel.backoff_cap = Duration::from_secs(5);
            },
            Self::Staging => {},
            Self::Production => {
                config.command_capacity = 256;
                config.event_capacity = 256;
                config.link_capacity = 256;
            },
        }
        config
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownProfile(s.to_string()))
    }
}

/// Trip runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Profile this configuration was derived from
    pub profile: Profile,
    /// Coordinator timings and thresholds
    pub coordinator: CoordinatorConfig,
    /// Timer resolution of each trip task
    pub tick_interval: Duration,
    /// Bound of each trip's command queue
    pub command_capacity: usize,
    /// Buffered notifications per subscriber before it lags
    pub event_capacity: usize,
    /// Bound of each link's frame queues
    pub link_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            coordinator: CoordinatorConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_capacity: 64,
            event_capacity: 64,
            link_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse_case_insensitively() {
        assert_eq!("staging".parse::<Profile>().unwrap(), Profile::Staging);
        assert_eq!("PRODUCTION".parse::<Profile>().unwrap(), Profile::Production);
        assert_eq!(
            "qa".parse::<Profile>().unwrap_err(),
            ConfigError::UnknownProfile("qa".to_string())
        );
    }

    #[test]
    fn display_round_trips() {
        for profile in Profile::ALL {
            assert_eq!(profile.to_string().parse::<Profile>().unwrap(), profile);
        }
    }

    #[test]
    fn development_shortens_gap_wait() {
        let dev = Profile::Development.config();
        let prod = Profile::Production.config();

        assert_eq!(dev.profile, Profile::Development);
        assert!(dev.coordinator.sequencer.gap_wait < prod.coordinator.sequencer.gap_wait);
        assert_eq!(prod.coordinator.sequencer.gap_wait, Duration::from_secs(10));
    }
}
