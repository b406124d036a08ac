pub mod config;
pub mod environment;
pub mod error;
pub mod flow;
pub mod interface;
pub mod scenario;
pub mod signal;

pub use config::{ElephantSpec, FlowSpec, MiceSpec, Profile, parse_rate};
pub use environment::{
    BandwidthConfig, CorruptionConfig, DuplicationConfig, EnvironmentStatus, LatencyConfig,
    NetworkEnvironment, PacketLossConfig, ReorderingConfig,
};
pub use error::{AggregationError, ConfigError, EnvironmentError};
pub use flow::{FailureKind, Flow, FlowFailure, FlowId, FlowKind, FlowResult};
pub use interface::{FlowRunner, NetworkEnvironmentController};
pub use scenario::{ClientProfile, Scenario};
pub use signal::{AbortHandle, AbortSignal, abort_pair};
