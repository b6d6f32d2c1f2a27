pub mod broker;
pub mod config;
pub mod connection;
pub mod fanout;
pub mod handlers;
pub mod metrics;
pub mod pending;
pub mod server;

pub use broker::{AwaitOutcome, BrokerConfig, CommandBroker, DispatchOutcome};
pub use config::{load_config, ConfigError, ServerConfig};
pub use server::{build_router, start, AppState, ServerHandle};
