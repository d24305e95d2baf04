use thiserror::Error;

use crate::config::ConfigError;
use crate::server::ServerError;

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; callers that care about the
/// specific failure match on the inner enums.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}
