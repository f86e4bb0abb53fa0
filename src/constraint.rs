//! Environmental preconditions for dispatch.
//!
//! A unit's [`Constraints`] are checked against the current [`Environment`]
//! before every dispatch attempt. All requirements in a set must hold.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Battery percentage at or below which the battery counts as low while
/// not charging.
pub const LOW_BATTERY_PERCENT: u8 = 15;

/// Network requirement of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network needed.
    #[default]
    NotRequired,
    /// Any working connection.
    Connected,
    /// A connection that is not metered (e.g. Wi-Fi).
    Unmetered,
    /// A metered connection (e.g. cellular).
    Metered,
    /// Any connection that is not roaming.
    NotRoaming,
}

/// Set of requirements gating a unit. The default requires nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub network: NetworkType,
    #[serde(default)]
    pub requires_charging: bool,
    #[serde(default)]
    pub requires_battery_not_low: bool,
    #[serde(default)]
    pub requires_device_idle: bool,
    #[serde(default)]
    pub requires_storage_not_low: bool,
}

impl Constraints {
    /// Whether this set places any requirement at all.
    pub fn is_empty(&self) -> bool {
        *self == Constraints::default()
    }
}

/// Current network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Disconnected,
    Connected { metered: bool, roaming: bool },
}

/// Snapshot of the constraint-relevant signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub network: Network,
    pub charging: bool,
    /// 0..=100
    pub battery_percent: u8,
    pub device_idle: bool,
    pub storage_low: bool,
}

impl Environment {
    pub fn battery_low(&self) -> bool {
        !self.charging && self.battery_percent <= LOW_BATTERY_PERCENT
    }
}

impl Default for Environment {
    /// A plugged-in machine on an unmetered link.
    fn default() -> Self {
        Self {
            network: Network::Connected {
                metered: false,
                roaming: false,
            },
            charging: true,
            battery_percent: 100,
            device_idle: false,
            storage_low: false,
        }
    }
}

/// Whether every requirement in `constraints` holds in `env`.
pub fn satisfied(constraints: &Constraints, env: &Environment) -> bool {
    network_satisfied(constraints.network, env.network)
        && (!constraints.requires_charging || env.charging)
        && (!constraints.requires_battery_not_low || !env.battery_low())
        && (!constraints.requires_device_idle || env.device_idle)
        && (!constraints.requires_storage_not_low || !env.storage_low)
}

fn network_satisfied(required: NetworkType, network: Network) -> bool {
    match (required, network) {
        (NetworkType::NotRequired, _) => true,
        (_, Network::Disconnected) => false,
        (NetworkType::Connected, Network::Connected { .. }) => true,
        (NetworkType::Unmetered, Network::Connected { metered, .. }) => !metered,
        (NetworkType::Metered, Network::Connected { metered, .. }) => metered,
        (NetworkType::NotRoaming, Network::Connected { roaming, .. }) => !roaming,
    }
}

/// Supplies the current environment on demand.
pub trait EnvironmentProvider: Send + Sync {
    fn current(&self) -> Environment;
}

/// Provider holding a settable environment. Callers that change it should
/// tell the scheduler via `Scheduler::environment_changed`.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    env: RwLock<Environment>,
}

impl StaticEnvironment {
    pub fn new(env: Environment) -> Self {
        Self {
            env: RwLock::new(env),
        }
    }

    pub fn set(&self, env: Environment) {
        *self.env.write() = env;
    }

    pub fn update(&self, f: impl FnOnce(&mut Environment)) {
        f(&mut self.env.write());
    }
}

impl EnvironmentProvider for StaticEnvironment {
    fn current(&self) -> Environment {
        *self.env.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metered() -> Environment {
        Environment {
            network: Network::Connected {
                metered: true,
                roaming: false,
            },
            ..Environment::default()
        }
    }

    #[test]
    fn empty_constraints_always_hold() {
        let offline = Environment {
            network: Network::Disconnected,
            charging: false,
            battery_percent: 1,
            device_idle: false,
            storage_low: true,
        };
        assert!(satisfied(&Constraints::default(), &offline));
        assert!(Constraints::default().is_empty());
    }

    #[test]
    fn network_requirements() {
        let unmetered = Constraints {
            network: NetworkType::Unmetered,
            ..Default::default()
        };
        assert!(satisfied(&unmetered, &Environment::default()));
        assert!(!satisfied(&unmetered, &metered()));

        let metered_only = Constraints {
            network: NetworkType::Metered,
            ..Default::default()
        };
        assert!(satisfied(&metered_only, &metered()));
        assert!(!satisfied(&metered_only, &Environment::default()));

        let any = Constraints {
            network: NetworkType::Connected,
            ..Default::default()
        };
        let offline = Environment {
            network: Network::Disconnected,
            ..Environment::default()
        };
        assert!(!satisfied(&any, &offline));

        let roaming = Environment {
            network: Network::Connected {
                metered: true,
                roaming: true,
            },
            ..Environment::default()
        };
        let not_roaming = Constraints {
            network: NetworkType::NotRoaming,
            ..Default::default()
        };
        assert!(!satisfied(&not_roaming, &roaming));
        assert!(satisfied(&not_roaming, &metered()));
    }

    #[test]
    fn all_requirements_must_hold() {
        let c = Constraints {
            network: NetworkType::Unmetered,
            requires_charging: true,
            ..Default::default()
        };
        let unplugged = Environment {
            charging: false,
            ..Environment::default()
        };
        assert!(satisfied(&c, &Environment::default()));
        assert!(!satisfied(&c, &unplugged));
        assert!(!satisfied(&c, &metered()));
    }

    #[test]
    fn battery_is_only_low_when_unplugged() {
        let c = Constraints {
            requires_battery_not_low: true,
            ..Default::default()
        };
        let low_plugged = Environment {
            battery_percent: 5,
            ..Environment::default()
        };
        let low_unplugged = Environment {
            charging: false,
            ..low_plugged
        };
        assert!(satisfied(&c, &low_plugged));
        assert!(!satisfied(&c, &low_unplugged));
    }

    #[test]
    fn idle_and_storage() {
        let c = Constraints {
            requires_device_idle: true,
            requires_storage_not_low: true,
            ..Default::default()
        };
        let idle = Environment {
            device_idle: true,
            ..Environment::default()
        };
        assert!(satisfied(&c, &idle));
        assert!(!satisfied(&c, &Environment::default()));
        assert!(!satisfied(
            &c,
            &Environment {
                storage_low: true,
                ..idle
            }
        ));
    }

    #[test]
    fn static_environment_updates() {
        let provider = StaticEnvironment::default();
        assert!(provider.current().charging);
        provider.update(|env| env.charging = false);
        assert!(!provider.current().charging);
    }
}
