// Executor module - remote command execution engine

use crate::output::errors::ExecError;

pub mod dispatcher;
pub mod runner;
pub mod ssh;
pub mod tunnel;

pub use dispatcher::{execute_batch, BatchDispatcher, BatchRequest, BatchResult, DEFAULT_LIMIT};
pub use runner::{
    execute_on_host, CommandResult, CommandSource, HostExecutionResult, SequentialCommandRunner,
};
pub use ssh::{
    ConnectionSpec, Credentials, SessionOptions, SshChannel, SshConnection, SshConnector,
    TunnelHost, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT,
};
pub use tunnel::Tunnel;

/// One step of a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(String),
    Stderr(String),
    /// Final event of every stream
    Closed {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

/// Single-pass stream of events for one command, ending with `Closed`
pub type EventStream<'a> = Box<dyn Iterator<Item = Result<ChannelEvent, ExecError>> + 'a>;

/// An authenticated session to one host that runs one command at a time
pub trait RemoteSession: Send {
    /// Start a command. The returned stream borrows the session, so a second
    /// command cannot start until this one is finished.
    fn exec_one(&mut self, command: &str) -> Result<EventStream<'_>, ExecError>;

    /// Release the network resources. Safe to call more than once.
    fn close(&mut self);
}

/// Opens sessions for a connection spec (direct or tunnelled)
pub trait Connector: Send + Sync {
    fn open(&self, spec: &ConnectionSpec) -> Result<Box<dyn RemoteSession>, ExecError>;
}
