use serde::{Deserialize, Serialize};

/// Network conditions a conditioning backend is asked to impose on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEnvironment {
    pub name: String,
    pub description: String,
    /// Interface override; the controller's own interface is used when empty.
    pub interface: Option<String>,
    pub latency: LatencyConfig,
    pub packet_loss: PacketLossConfig,
    pub corruption: CorruptionConfig,
    pub duplication: DuplicationConfig,
    pub reordering: ReorderingConfig,
    pub bandwidth: BandwidthConfig,
    /// Restrict conditioning to these peers (dummynet only).
    pub target_ips: Vec<String>,
}

impl Default for NetworkEnvironment {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: String::new(),
            interface: None,
            latency: LatencyConfig::default(),
            packet_loss: PacketLossConfig::default(),
            corruption: CorruptionConfig::default(),
            duplication: DuplicationConfig::default(),
            reordering: ReorderingConfig::default(),
            bandwidth: BandwidthConfig::default(),
            target_ips: Vec::new(),
        }
    }
}

impl NetworkEnvironment {
    /// True when no condition would change link behaviour.
    pub fn is_neutral(&self) -> bool {
        self.latency.delay_ms <= 0.0
            && !self.packet_loss.is_active()
            && self.corruption.corrupt_pct <= 0.0
            && self.duplication.duplicate_pct <= 0.0
            && self.reordering.reorder_pct <= 0.0
            && self.bandwidth.rate().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub delay_ms: f64,
    pub jitter_ms: f64,
    pub correlation_pct: f64,
    /// netem delay distribution: normal, pareto, paretonormal.
    pub distribution: String,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0.0,
            jitter_ms: 0.0,
            correlation_pct: 0.0,
            distribution: "normal".to_string(),
        }
    }
}

/// Random loss, or Gilbert-Elliott burst loss when `p13 > 0` and `loss_pct == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossConfig {
    pub loss_pct: f64,
    pub correlation_pct: f64,
    pub p13: f64,
    pub p31: f64,
    pub p32: f64,
    pub p14: f64,
}

impl Default for PacketLossConfig {
    fn default() -> Self {
        Self {
            loss_pct: 0.0,
            correlation_pct: 0.0,
            p13: 0.0,
            p31: 100.0,
            p32: 0.0,
            p14: 0.0,
        }
    }
}

impl PacketLossConfig {
    pub fn is_active(&self) -> bool {
        self.loss_pct > 0.0 || self.p13 > 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorruptionConfig {
    pub corrupt_pct: f64,
    pub correlation_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicationConfig {
    pub duplicate_pct: f64,
    pub correlation_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderingConfig {
    pub reorder_pct: f64,
    pub correlation_pct: f64,
    pub gap: u32,
}

impl Default for ReorderingConfig {
    fn default() -> Self {
        Self {
            reorder_pct: 0.0,
            correlation_pct: 0.0,
            gap: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// tc-style rate, e.g. "25mbit". Empty means unlimited.
    pub rate: String,
    pub burst: String,
    /// Queue limit in packets.
    pub limit: u32,
}

impl BandwidthConfig {
    pub fn rate(&self) -> Option<&str> {
        let rate = self.rate.trim();
        (!rate.is_empty()).then_some(rate)
    }
}

/// Snapshot reported by a controller's `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub controller: String,
    pub interface: Option<String>,
    pub active: bool,
    /// Raw backend listing, one entry per line.
    pub details: Vec<String>,
}
