pub mod command;
pub mod detect;
pub mod dummynet;
pub mod iperf;
pub mod netem;
pub mod noop;
pub mod presets;
pub mod server;

pub use detect::{Backend, default_interface, detect_controller, select_backend};
pub use dummynet::DummynetController;
pub use iperf::{DEFAULT_TIMEOUT_MARGIN, Iperf3Runner, classify_error, parse_iperf3_output};
pub use netem::NetemController;
pub use noop::NoopController;
pub use presets::{PRESET_NAMES, list_presets, preset};
pub use server::{ServerPool, ServerPoolStats};
