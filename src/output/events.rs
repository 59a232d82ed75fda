// Progress events streamed while commands run

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

/// What a progress event reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    /// A command is about to start
    Command(String),
    /// A chunk of standard output
    Stdout(String),
    /// A chunk of standard error
    Stderr(String),
}

/// A purely observational event; sinks never influence execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Shared handle to a sink, cloned into every host worker
pub type SharedProgress = Arc<dyn ProgressSink>;

/// Logs every event at debug level
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        match &event.kind {
            ProgressKind::Command(command) => {
                tracing::debug!(
                    host = %event.host,
                    port = event.port,
                    user = %event.username,
                    %command,
                    "command started"
                )
            }
            ProgressKind::Stdout(chunk) => {
                tracing::debug!(host = %event.host, stdout = %chunk.trim_end(), "output")
            }
            ProgressKind::Stderr(chunk) => {
                tracing::debug!(host = %event.host, stderr = %chunk.trim_end(), "output")
            }
        }
    }
}

/// Event emitter forwarding into an unbounded channel
#[derive(Clone)]
pub struct ProgressEmitter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        ProgressEmitter { tx }
    }
}

impl ProgressSink for ProgressEmitter {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching
        let _ = self.tx.send(event);
    }
}

/// Create a new progress channel
pub fn create_progress_channel() -> (ProgressEmitter, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressEmitter::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_forwards_events() {
        let (emitter, mut rx) = create_progress_channel();
        emitter.emit(ProgressEvent {
            host: "web1".to_string(),
            port: 22,
            username: "deploy".to_string(),
            kind: ProgressKind::Stdout("hi\n".to_string()),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.host, "web1");
        assert_eq!(event.kind, ProgressKind::Stdout("hi\n".to_string()));
    }

    #[test]
    fn test_emitter_ignores_closed_receiver() {
        let (emitter, rx) = create_progress_channel();
        drop(rx);
        emitter.emit(ProgressEvent {
            host: "web1".to_string(),
            port: 22,
            username: "deploy".to_string(),
            kind: ProgressKind::Command("uptime".to_string()),
        });
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = ProgressEvent {
            host: "web1".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            kind: ProgressKind::Stderr("oops".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["host"], "web1");
        assert_eq!(value["port"], 2222);
        assert_eq!(value["stderr"], "oops");
    }
}
