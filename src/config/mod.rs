//! Configuration for the applier server: logging plus the enumerated
//! replication targets.

mod load;
mod schema;

pub use load::{ConfigError, apply_env_overrides, load};
pub use schema::{Config, LoggingConfig, TargetConfig};
