use crate::config::{ElephantSpec, FlowSpec, MiceSpec, Profile};
use crate::environment::NetworkEnvironment;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Traffic generated by one simulated client. Scaled by the client count per sweep point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub name: String,
    pub mice_enabled: bool,
    pub mice_size_range: (u64, u64),
    pub mice_duration_range: (f64, f64),
    /// Flows per second per client.
    pub mice_rate: f64,
    pub mice_concurrent: u32,
    pub elephant_enabled: bool,
    pub elephant_concurrent: u32,
    pub elephant_bandwidth: Option<String>,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            mice_enabled: true,
            mice_size_range: (1024, 51_200),
            mice_duration_range: (0.1, 1.0),
            mice_rate: 10.0,
            mice_concurrent: 5,
            elephant_enabled: false,
            elephant_concurrent: 1,
            elephant_bandwidth: None,
        }
    }
}

/// A client-count sweep: one full test per entry in `client_counts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    /// Per-point test duration in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: f64,
    pub client_counts: Vec<u32>,
    pub client_profile: ClientProfile,
    /// Quiesce time between points, in seconds.
    #[serde(rename = "inter_test_delay")]
    pub inter_test_delay_secs: f64,
    /// Inline conditions applied around every point.
    pub environment: Option<NetworkEnvironment>,
    /// Named preset, resolved by the caller into `environment`.
    pub environment_preset: Option<String>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            name: "Multi-Client Test".to_string(),
            description: String::new(),
            duration_secs: 60.0,
            client_counts: vec![10],
            client_profile: ClientProfile::default(),
            inter_test_delay_secs: 5.0,
            environment: None,
            environment_preset: None,
        }
    }
}

impl Scenario {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_counts.is_empty() {
            return Err(ConfigError::NoClientCounts);
        }
        if self.client_counts.contains(&0) {
            return Err(ConfigError::ZeroClients);
        }
        if Duration::try_from_secs_f64(self.inter_test_delay_secs).is_err() {
            return Err(ConfigError::InvalidNumber {
                field: "inter_test_delay",
                value: self.inter_test_delay_secs,
            });
        }
        self.profile_for(1).validate()?;
        // the busiest point has the shortest arrival gap
        match self.client_counts.iter().max() {
            Some(&most) if most > 1 => self.profile_for(most).validate(),
            _ => Ok(()),
        }
    }

    pub fn inter_test_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.inter_test_delay_secs).unwrap_or_default()
    }

    /// Build the test profile for `clients` simulated clients.
    pub fn profile_for(&self, clients: u32) -> Profile {
        let client = &self.client_profile;
        Profile {
            name: format!("{} ({} clients)", self.name, clients),
            description: self.description.clone(),
            flows: FlowSpec {
                duration_secs: self.duration_secs,
                mice: MiceSpec {
                    enabled: client.mice_enabled,
                    size_range: client.mice_size_range,
                    duration_range: client.mice_duration_range,
                    concurrent: client.mice_concurrent.saturating_mul(clients),
                    rate: client.mice_rate * f64::from(clients),
                },
                elephant: ElephantSpec {
                    enabled: client.elephant_enabled,
                    concurrent: client.elephant_concurrent.saturating_mul(clients),
                    bandwidth: client.elephant_bandwidth.clone(),
                },
            },
        }
    }
}
