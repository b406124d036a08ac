use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Named test profile as loaded from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub flows: FlowSpec,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "Unnamed".to_string(),
            description: String::new(),
            flows: FlowSpec::default(),
        }
    }
}

impl Profile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flows.validate()
    }
}

/// Shape of the load generated during one run. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSpec {
    /// Wall-clock budget in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: f64,
    #[serde(rename = "mice_flows")]
    pub mice: MiceSpec,
    #[serde(rename = "elephant_flows")]
    pub elephant: ElephantSpec,
}

impl Default for FlowSpec {
    fn default() -> Self {
        Self {
            duration_secs: 60.0,
            mice: MiceSpec::default(),
            elephant: ElephantSpec::default(),
        }
    }
}

impl FlowSpec {
    /// Run length. Zero when `duration_secs` does not fit a [`Duration`]; `validate` rejects that.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_secs).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.duration_secs.is_finite() || self.duration_secs <= 0.0 {
            return Err(ConfigError::NonPositiveDuration(self.duration_secs));
        }
        if Duration::try_from_secs_f64(self.duration_secs).is_err() {
            return Err(ConfigError::DurationOutOfRange {
                field: "duration",
                value: self.duration_secs,
            });
        }
        if self.mice.enabled {
            self.mice.validate()?;
        }
        if self.elephant.enabled {
            self.elephant.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiceSpec {
    pub enabled: bool,
    /// Inclusive `[min, max]` transfer size in bytes.
    pub size_range: (u64, u64),
    /// Inclusive `[min, max]` flow duration in seconds.
    pub duration_range: (f64, f64),
    /// Upper bound on in-flight mice flows.
    pub concurrent: u32,
    /// Target arrival rate in flows per second.
    pub rate: f64,
}

impl Default for MiceSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            size_range: (1024, 102_400),
            duration_range: (0.1, 1.0),
            concurrent: 50,
            rate: 100.0,
        }
    }
}

impl MiceSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = self.size_range;
        if min < 1 || min > max {
            return Err(ConfigError::InvalidRange {
                field: "mice_flows.size_range",
                min: min as f64,
                max: max as f64,
            });
        }
        let (min, max) = self.duration_range;
        if !min.is_finite() || !max.is_finite() || min <= 0.0 || min > max {
            return Err(ConfigError::InvalidRange {
                field: "mice_flows.duration_range",
                min,
                max,
            });
        }
        if Duration::try_from_secs_f64(max).is_err() {
            return Err(ConfigError::DurationOutOfRange {
                field: "mice_flows.duration_range",
                value: max,
            });
        }
        // an arrival gap that rounds to zero (or overflows) cannot be paced
        if !self.rate.is_finite() || self.rate < 0.0 || (self.rate > 0.0 && self.interval().is_none())
        {
            return Err(ConfigError::InvalidNumber {
                field: "mice_flows.rate",
                value: self.rate,
            });
        }
        Ok(())
    }

    /// Gap between consecutive arrivals, `None` when no arrivals are paced.
    pub fn interval(&self) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.rate)
            .ok()
            .filter(|gap| !gap.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElephantSpec {
    pub enabled: bool,
    /// Number of elephant flows kept running throughout the test.
    pub concurrent: u32,
    /// Optional rate cap; empty means unlimited.
    pub bandwidth: Option<String>,
}

impl Default for ElephantSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrent: 5,
            bandwidth: None,
        }
    }
}

impl ElephantSpec {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bw) = self.bandwidth() {
            parse_rate(bw)?;
        }
        Ok(())
    }

    /// Bandwidth cap with empty strings treated as "unlimited".
    pub fn bandwidth(&self) -> Option<&str> {
        self.bandwidth
            .as_deref()
            .map(str::trim)
            .filter(|bw| !bw.is_empty())
    }
}

/// Parse a rate string such as `"100M"`, `"2.5g"`, `"25mbit"` or `"10Mbit/s"` into bits per second.
pub fn parse_rate(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidBandwidth(input.to_string());
    let lowered = input.trim().to_ascii_lowercase();
    let mut body = lowered.trim_end_matches("/s");
    for suffix in ["bits", "bit", "bps"] {
        if let Some(stripped) = body.strip_suffix(suffix) {
            body = stripped;
            break;
        }
    }

    let (number, multiplier) = match body.chars().last() {
        Some('k') => (&body[..body.len() - 1], 1e3),
        Some('m') => (&body[..body.len() - 1], 1e6),
        Some('g') => (&body[..body.len() - 1], 1e9),
        Some('t') => (&body[..body.len() - 1], 1e12),
        Some(_) => (body, 1.0),
        None => return Err(invalid()),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let bits = value * multiplier;
    if !bits.is_finite() || bits < 1.0 {
        return Err(invalid());
    }
    Ok(bits.round() as u64)
}
