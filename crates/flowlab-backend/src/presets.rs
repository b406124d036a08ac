use flowlab_abstract::{BandwidthConfig, LatencyConfig, NetworkEnvironment, PacketLossConfig};

pub const PRESET_NAMES: [&str; 7] = [
    "4g-mobile",
    "3g-mobile",
    "satellite",
    "lossy-wifi",
    "congested",
    "datacenter",
    "edge-case-burst-loss",
];

fn latency(delay_ms: f64, jitter_ms: f64, correlation_pct: f64) -> LatencyConfig {
    LatencyConfig {
        delay_ms,
        jitter_ms,
        correlation_pct,
        ..Default::default()
    }
}

fn loss(loss_pct: f64, correlation_pct: f64) -> PacketLossConfig {
    PacketLossConfig {
        loss_pct,
        correlation_pct,
        ..Default::default()
    }
}

fn rate(rate: &str) -> BandwidthConfig {
    BandwidthConfig {
        rate: rate.to_string(),
        ..Default::default()
    }
}

fn environment(name: &str, description: &str) -> NetworkEnvironment {
    NetworkEnvironment {
        name: name.to_string(),
        description: description.to_string(),
        ..Default::default()
    }
}

/// Built-in environment by key, case-insensitive.
pub fn preset(name: &str) -> Option<NetworkEnvironment> {
    let env = match name.trim().to_ascii_lowercase().as_str() {
        "4g-mobile" => NetworkEnvironment {
            latency: latency(50.0, 20.0, 25.0),
            packet_loss: loss(0.5, 0.0),
            bandwidth: rate("25mbit"),
            ..environment("4G Mobile", "Typical 4G/LTE mobile network conditions")
        },
        "3g-mobile" => NetworkEnvironment {
            latency: latency(150.0, 50.0, 30.0),
            packet_loss: loss(2.0, 0.0),
            bandwidth: rate("2mbit"),
            ..environment("3G Mobile", "3G mobile network with higher latency")
        },
        "satellite" => NetworkEnvironment {
            latency: latency(600.0, 50.0, 0.0),
            packet_loss: loss(0.5, 0.0),
            bandwidth: rate("10mbit"),
            ..environment("Satellite", "High-latency satellite internet connection")
        },
        "lossy-wifi" => NetworkEnvironment {
            latency: latency(10.0, 20.0, 0.0),
            packet_loss: loss(5.0, 25.0),
            ..environment("Lossy WiFi", "Congested or weak WiFi signal with packet loss")
        },
        "congested" => NetworkEnvironment {
            latency: latency(100.0, 80.0, 50.0),
            packet_loss: loss(3.0, 0.0),
            bandwidth: rate("5mbit"),
            ..environment("Congested Network", "Heavily congested network with high jitter")
        },
        "datacenter" => NetworkEnvironment {
            latency: latency(0.5, 0.1, 0.0),
            packet_loss: loss(0.01, 0.0),
            ..environment("Datacenter", "Low-latency datacenter connection")
        },
        "edge-case-burst-loss" => NetworkEnvironment {
            latency: latency(30.0, 10.0, 0.0),
            // Gilbert-Elliott
            packet_loss: PacketLossConfig {
                p13: 5.0,
                p31: 80.0,
                p32: 50.0,
                ..Default::default()
            },
            ..environment("Burst Packet Loss", "Network with bursty packet loss patterns")
        },
        _ => return None,
    };
    Some(env)
}

/// `(key, description)` for every built-in environment.
pub fn list_presets() -> Vec<(&'static str, String)> {
    PRESET_NAMES
        .iter()
        .filter_map(|&key| preset(key).map(|env| (key, env.description)))
        .collect()
}
