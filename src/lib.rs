// Relay - run shell command sequences on many hosts over SSH
//
// Each host gets one connection (optionally through a jump host), its
// commands run in order, and at most `limit` hosts are in flight at once.

pub mod config;
pub mod executor;
pub mod output;
pub mod request;

pub use config::{EngineConfig, RuntimeDefaults};
pub use executor::{
    execute_batch, execute_on_host, BatchDispatcher, BatchRequest, BatchResult, CommandResult,
    CommandSource, ConnectionSpec, Connector, Credentials, HostExecutionResult, RemoteSession,
    SequentialCommandRunner, SessionOptions, SshConnector, TunnelHost,
};
pub use output::{ExecError, ProgressEvent, ProgressKind, ProgressSink, RequestError};
pub use request::RawRequest;

/// Version of the Relay tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{
        execute_batch, execute_on_host, BatchDispatcher, BatchRequest, BatchResult,
        ConnectionSpec, Credentials, SessionOptions, SshConnector, TunnelHost,
    };
    pub use crate::output::{ExecError, ProgressEvent, RequestError};
}
