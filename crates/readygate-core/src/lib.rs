pub mod config;
pub mod error;
pub mod types;

pub use config::{
    parse_duration, Backoff, CheckEntry, CheckKind, CheckSpec, CheckSpecBuilder, GateConfig,
    GatePlan, MaxAttempts,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
