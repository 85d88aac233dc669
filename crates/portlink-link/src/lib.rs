//! Link instances: one bound listener, its accept loop, and the relay
//! machinery for every connection proxied through it.

use thiserror::Error;

mod instance;
mod relay;

pub use instance::LinkInstance;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid link configuration: {0}")]
    Config(#[from] portlink_config::ConfigError),

    #[error("load balancing: {0}")]
    Balance(#[from] portlink_balance::BalanceError),

    #[error("certificate provisioning: {0}")]
    Cert(#[from] portlink_cert::CertError),

    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
