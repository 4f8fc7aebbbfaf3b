pub mod config;
pub mod dispatcher;
pub mod event_bridge;
pub mod handlers;
pub mod metrics;
pub mod observer;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{load_config, BrokerConfig, ConfigError};
pub use dispatcher::{Dispatch, RunDispatcher};
pub use registry::{RegistryError, WorkerRegistry};
pub use relay::ResultRelay;
pub use server::{start, BrokerHandle};
pub use shutdown::ShutdownCoordinator;
