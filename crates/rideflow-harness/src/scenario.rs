//! Scripted participant behaviour for simulated trips.
//!
//! A [`Scenario`] says when the dispatcher finds a driver, how quickly the
//! driver works through the ride, who cancels and when, and which network
//! faults hit whom. Times are measured from the start of the run.

use std::{fmt, str::FromStr, time::Duration};

use crate::network::NodeId;

/// Named scenario presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Matched, driven, and completed
    Complete,
    /// Passenger cancels while the driver is on the way
    PassengerCancels,
    /// Driver cancels after arriving
    DriverCancels,
    /// Nobody accepts; the search times out
    NoDriver,
    /// Complete ride with the passenger cut off mid-trip
    Partition,
}

impl ScenarioKind {
    /// Every preset.
    pub const ALL: [ScenarioKind; 5] = [
        ScenarioKind::Complete,
        ScenarioKind::PassengerCancels,
        ScenarioKind::DriverCancels,
        ScenarioKind::NoDriver,
        ScenarioKind::Partition,
    ];

    /// Name used on the command line.
    pub const fn as_str(self) -> &'static str {
        match self {
            ScenarioKind::Complete => "complete",
            ScenarioKind::PassengerCancels => "passenger-cancels",
            ScenarioKind::DriverCancels => "driver-cancels",
            ScenarioKind::NoDriver => "no-driver",
            ScenarioKind::Partition => "partition",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|kind| kind.as_str().eq_ignore_ascii_case(s)).ok_or_else(|| {
            let known: Vec<_> = Self::ALL.iter().map(|k| k.as_str()).collect();
            format!("unknown scenario {s:?}, expected one of {}", known.join(", "))
        })
    }
}

/// A participant losing connectivity for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Who is cut off
    pub node: NodeId,
    /// When the cut starts
    pub from: Duration,
    /// When connectivity returns
    pub until: Duration,
}

/// Script for one simulated trip.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Preset this script started from
    pub kind: ScenarioKind,
    /// When a driver accepts. `None` means nobody does.
    pub accept_after: Option<Duration>,
    /// Delay between the match and the driver setting off
    pub depart_after: Duration,
    /// Delay between the driver's confirmation gestures
    pub driver_pace: Duration,
    /// When the passenger cancels, if at all
    pub passenger_cancel_at: Option<Duration>,
    /// When the driver cancels, if at all
    pub driver_cancel_at: Option<Duration>,
    /// Passenger and driver exchange a message once matched
    pub chat: bool,
    /// Connectivity loss, if any
    pub partition: Option<Partition>,
}

impl Scenario {
    /// Script for a preset.
    pub fn new(kind: ScenarioKind) -> Self {
        let ride = Self {
            kind,
            accept_after: Some(Duration::from_secs(2)),
            depart_after: Duration::from_secs(1),
            driver_pace: Duration::from_secs(2),
            passenger_cancel_at: None,
            driver_cancel_at: None,
            chat: true,
            partition: None,
        };

        match kind {
            ScenarioKind::Complete => ride,
            ScenarioKind::PassengerCancels => Self { passenger_cancel_at: Some(Duration::from_secs(4)), ..ride },
            ScenarioKind::DriverCancels => Self { driver_cancel_at: Some(Duration::from_secs(7)), ..ride },
            ScenarioKind::NoDriver => Self { accept_after: None, chat: false, ..ride },
            ScenarioKind::Partition => Self {
                partition: Some(Partition {
                    node: NodeId::Passenger,
                    from: Duration::from_secs(3),
                    until: Duration::from_secs(12),
                }),
                ..ride
            },
        }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new(ScenarioKind::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.to_string().parse::<ScenarioKind>(), Ok(kind));
        }
        assert_eq!("No-Driver".parse::<ScenarioKind>(), Ok(ScenarioKind::NoDriver));
        assert!("teleport".parse::<ScenarioKind>().unwrap_err().contains("complete"));
    }

    #[test]
    fn no_driver_never_accepts() {
        let scenario = Scenario::new(ScenarioKind::NoDriver);
        assert!(scenario.accept_after.is_none());
        assert!(scenario.passenger_cancel_at.is_none());
    }
}
