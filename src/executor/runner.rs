// Sequential command execution over one host connection

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use super::ssh::ConnectionSpec;
use super::{ChannelEvent, Connector, RemoteSession};
use crate::output::errors::{ExecError, Stage};
use crate::output::events::{ProgressEvent, ProgressKind, SharedProgress};

/// Where a host's command list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// Already split, used as given
    List(Vec<String>),
    /// A script; one command per line
    Text(String),
}

impl CommandSource {
    /// The ordered commands. Carriage returns are stripped before splitting
    /// and blank lines are skipped.
    pub fn into_commands(self) -> Vec<String> {
        match self {
            CommandSource::List(commands) => commands,
            CommandSource::Text(text) => text
                .replace('\r', "")
                .split('\n')
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl From<Vec<String>> for CommandSource {
    fn from(commands: Vec<String>) -> Self {
        CommandSource::List(commands)
    }
}

impl From<&[&str]> for CommandSource {
    fn from(commands: &[&str]) -> Self {
        CommandSource::List(commands.iter().map(|c| c.to_string()).collect())
    }
}

impl From<String> for CommandSource {
    fn from(text: String) -> Self {
        CommandSource::Text(text)
    }
}

impl From<&str> for CommandSource {
    fn from(text: &str) -> Self {
        CommandSource::Text(text.to_string())
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    /// None when the connection died first or a signal ended the command
    #[serde(rename = "code")]
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order
    pub all: String,
}

impl CommandResult {
    fn started(command: &str) -> Self {
        CommandResult {
            command: command.to_string(),
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            all: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Everything that happened on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostExecutionResult {
    pub host: String,
    pub error: Option<ExecError>,
    pub stdout: String,
    pub stderr: String,
    /// Each command line followed by its interleaved output
    pub all: String,
    pub commands: Vec<CommandResult>,
    pub duration_ms: u64,
}

impl HostExecutionResult {
    pub fn new(host: impl Into<String>) -> Self {
        HostExecutionResult {
            host: host.into(),
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            all: String::new(),
            commands: Vec::new(),
            duration_ms: 0,
        }
    }

    /// A host that failed before running anything
    pub fn failed(host: impl Into<String>, error: ExecError) -> Self {
        HostExecutionResult {
            error: Some(error),
            ..Self::new(host)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Commands that ran to completion with a nonzero status or a signal
    pub fn nonzero_exits(&self) -> usize {
        self.commands.iter().filter(|c| !c.success()).count()
    }
}

/// Drives an ordered command list over one connection. Nonzero exit codes
/// are recorded and execution continues; a connection-level error stops the
/// remaining commands.
pub struct SequentialCommandRunner<'a> {
    spec: &'a ConnectionSpec,
    progress: Option<SharedProgress>,
}

impl<'a> SequentialCommandRunner<'a> {
    pub fn new(spec: &'a ConnectionSpec, progress: Option<SharedProgress>) -> Self {
        SequentialCommandRunner { spec, progress }
    }

    fn emit(&self, kind: ProgressKind) {
        if let Some(progress) = &self.progress {
            progress.emit(ProgressEvent {
                host: self.spec.host.clone(),
                port: self.spec.port,
                username: self.spec.options.username.clone(),
                kind,
            });
        }
    }

    /// Open a connection, run every command, close the connection. Never
    /// fails: errors end up in the returned result.
    pub fn run(&self, connector: &dyn Connector, commands: &[String]) -> HostExecutionResult {
        let start = Instant::now();
        let mut result = HostExecutionResult::new(self.spec.host.clone());

        match connector.open(self.spec) {
            Ok(mut session) => {
                if let Err(e) = self.drive(session.as_mut(), commands, &mut result) {
                    result.error = Some(e);
                }
                session.close();
            }
            Err(e) => result.error = Some(e),
        }

        if let Some(ref e) = result.error {
            warn!(host = %self.spec.host, error = %e, "host failed");
        }
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    fn drive(
        &self,
        session: &mut dyn RemoteSession,
        commands: &[String],
        result: &mut HostExecutionResult,
    ) -> Result<(), ExecError> {
        for command in commands {
            self.emit(ProgressKind::Command(command.clone()));
            debug!(host = %self.spec.host, %command, "executing");

            result.all.push_str(command);
            result.all.push('\n');

            let stream = session.exec_one(command)?;
            let mut current = CommandResult::started(command);
            let mut closed = false;

            for event in stream {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        // Keep what the command printed before the connection died
                        result.commands.push(current);
                        return Err(e);
                    }
                };

                match event {
                    ChannelEvent::Stdout(chunk) => {
                        self.emit(ProgressKind::Stdout(chunk.clone()));
                        current.stdout.push_str(&chunk);
                        current.all.push_str(&chunk);
                        result.stdout.push_str(&chunk);
                        result.all.push_str(&chunk);
                    }
                    ChannelEvent::Stderr(chunk) => {
                        self.emit(ProgressKind::Stderr(chunk.clone()));
                        current.stderr.push_str(&chunk);
                        current.all.push_str(&chunk);
                        result.stderr.push_str(&chunk);
                        result.all.push_str(&chunk);
                    }
                    ChannelEvent::Closed { exit_code, signal } => {
                        current.exit_code = exit_code;
                        current.signal = signal;
                        closed = true;
                        break;
                    }
                }
            }

            debug!(host = %self.spec.host, %command, code = ?current.exit_code, "command finished");
            result.commands.push(current);

            if !closed {
                return Err(ExecError::transport(
                    Stage::Target,
                    &self.spec.host,
                    "channel ended without an exit status",
                ));
            }
        }
        Ok(())
    }
}

/// Run a command list on one host without blocking the async runtime
pub async fn execute_on_host(
    connector: Arc<dyn Connector>,
    spec: ConnectionSpec,
    commands: impl Into<CommandSource>,
    progress: Option<SharedProgress>,
) -> HostExecutionResult {
    let commands = commands.into().into_commands();
    let host = spec.host.clone();

    let worker = tokio::task::spawn_blocking(move || {
        SequentialCommandRunner::new(&spec, progress).run(connector.as_ref(), &commands)
    });

    match worker.await {
        Ok(result) => result,
        Err(e) => HostExecutionResult::failed(
            host,
            ExecError::internal(format!("host worker failed: {}", e)),
        ),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::executor::ssh::{Credentials, SessionOptions};
    use crate::output::errors::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn spec(host: &str) -> ConnectionSpec {
        ConnectionSpec::new(host, SessionOptions::new("deploy", Credentials::password("pw")))
    }

    fn commands(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_command_source_text_strips_carriage_returns() {
        let source = CommandSource::from("uptime\r\n\r\ndf -h\r\n");
        assert_eq!(source.into_commands(), commands(&["uptime", "df -h"]));
    }

    #[test]
    fn test_command_source_list_is_kept() {
        let source = CommandSource::from(commands(&["a", "", "b"]));
        assert_eq!(source.into_commands(), commands(&["a", "", "b"]));
    }

    #[test]
    fn test_single_command_output() {
        let connector =
            FakeConnector::new().script("echo hi", Script::Run(vec![stdout("hi\n")], 0));
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["echo hi"]));

        assert!(result.is_ok());
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].all, "hi\n");
        assert_eq!(result.commands[0].exit_code, Some(0));
        assert_eq!(result.all, "echo hi\nhi\n");
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nonzero_exit_does_not_stop_sequence() {
        let connector = FakeConnector::new()
            .script("false", Script::Run(Vec::new(), 1))
            .script("echo after", Script::Run(vec![stdout("after\n")], 0));
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["false", "echo after"]));

        assert!(result.is_ok());
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.commands[0].command, "false");
        assert_eq!(result.commands[0].exit_code, Some(1));
        assert_eq!(result.commands[1].exit_code, Some(0));
        assert_eq!(result.commands[1].stdout, "after\n");
        assert_eq!(result.nonzero_exits(), 1);
    }

    #[test]
    fn test_interleaved_output_keeps_arrival_order() {
        let connector = FakeConnector::new().script(
            "build",
            Script::Run(vec![stdout("one\n"), stderr("warn\n"), stdout("two\n")], 0),
        );
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["build"]));

        let cmd = &result.commands[0];
        assert_eq!(cmd.stdout, "one\ntwo\n");
        assert_eq!(cmd.stderr, "warn\n");
        assert_eq!(cmd.all, "one\nwarn\ntwo\n");
        assert_eq!(result.stderr, "warn\n");
    }

    #[test]
    fn test_start_failure_halts_remaining_commands() {
        let connector = FakeConnector::new().script("two", Script::RejectStart);
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["one", "two", "three"]));

        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::Transport));
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].command, "one");
        let executed: Vec<String> = connector
            .executed
            .lock()
            .iter()
            .map(|(_, c)| c.clone())
            .collect();
        assert_eq!(executed, commands(&["one", "two"]));
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_drop_keeps_partial_output() {
        let connector =
            FakeConnector::new().script("tail", Script::DropMidway(vec![stdout("partial")]));
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["tail", "never"]));

        assert!(result.error.is_some());
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].stdout, "partial");
        assert_eq!(result.commands[0].exit_code, None);
        assert_eq!(connector.executed.lock().len(), 1);
    }

    #[test]
    fn test_authentication_failure_yields_no_commands() {
        let connector = FakeConnector::new().refuse(
            "web1",
            ExecError::Authentication {
                stage: Stage::Target,
                host: "web1".to_string(),
                username: "deploy".to_string(),
                message: "denied".to_string(),
            },
        );
        let result = SequentialCommandRunner::new(&spec("web1"), None)
            .run(&connector, &commands(&["uptime"]));

        assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(ErrorKind::Authentication));
        assert!(result.commands.is_empty());
        assert_eq!(result.all, "");
    }

    #[test]
    fn test_progress_events_in_order() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        let progress: SharedProgress =
            Arc::new(move |event: ProgressEvent| sink.lock().push(event.kind));

        let connector = FakeConnector::new().script(
            "echo hi",
            Script::Run(vec![stdout("hi\n"), stderr("careful\n")], 0),
        );
        SequentialCommandRunner::new(&spec("web1"), Some(progress))
            .run(&connector, &commands(&["echo hi"]));

        assert_eq!(
            *events.lock(),
            vec![
                ProgressKind::Command("echo hi".to_string()),
                ProgressKind::Stdout("hi\n".to_string()),
                ProgressKind::Stderr("careful\n".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_on_host_splits_text() {
        let connector = Arc::new(FakeConnector::new());
        let result =
            execute_on_host(connector.clone(), spec("web1"), "uptime\nwhoami\n", None).await;

        assert!(result.is_ok());
        let names: Vec<&str> = result.commands.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(names, vec!["uptime", "whoami"]);
    }
}
