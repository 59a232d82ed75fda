// Bounded-concurrency fan-out of host runs

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::runner::{execute_on_host, HostExecutionResult};
use super::ssh::{ConnectionSpec, SessionOptions, SshConnector, DEFAULT_PORT};
use super::Connector;
use crate::output::errors::{ExecError, RequestError};
use crate::output::events::{SharedProgress, TracingProgress};

/// Hosts in flight when a request does not say
pub const DEFAULT_LIMIT: usize = 5;

/// A validated batch: the same commands and credentials for every host
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Duplicates are independent work items
    pub hosts: Vec<String>,
    pub commands: Vec<String>,
    pub port: u16,
    pub limit: usize,
    pub options: SessionOptions,
}

impl BatchRequest {
    pub fn new(hosts: Vec<String>, commands: Vec<String>, options: SessionOptions) -> Self {
        BatchRequest {
            hosts,
            commands,
            port: DEFAULT_PORT,
            limit: DEFAULT_LIMIT,
            options,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn validate(&self) -> Result<(), RequestError> {
        if self.hosts.is_empty() {
            return Err(RequestError::NoHosts);
        }
        if self.limit == 0 {
            return Err(RequestError::InvalidLimit(self.limit.to_string()));
        }
        Ok(())
    }
}

/// One result per requested host, in completion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BatchResult {
    pub hosts: Vec<HostExecutionResult>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HostExecutionResult> {
        self.hosts.iter()
    }

    /// Hosts that ended with a connection-level error
    pub fn failed(&self) -> impl Iterator<Item = &HostExecutionResult> {
        self.hosts.iter().filter(|h| !h.is_ok())
    }

    pub fn all_ok(&self) -> bool {
        self.hosts.iter().all(HostExecutionResult::is_ok)
    }
}

impl IntoIterator for BatchResult {
    type Item = HostExecutionResult;
    type IntoIter = std::vec::IntoIter<HostExecutionResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.into_iter()
    }
}

/// Runs one sequential runner per host with at most `limit` in flight.
/// Each host's failure stays in that host's result.
pub struct BatchDispatcher {
    connector: Arc<dyn Connector>,
    progress: Option<SharedProgress>,
}

impl BatchDispatcher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        BatchDispatcher {
            connector,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn dispatch(&self, request: BatchRequest) -> Result<BatchResult, RequestError> {
        request.validate()?;

        let start = Instant::now();
        let BatchRequest {
            hosts,
            commands,
            port,
            limit,
            options,
        } = request;
        let total = hosts.len();

        info!(
            hosts = total,
            commands = commands.len(),
            limit,
            tunnel = ?options.tunnel.as_ref().map(|t| t.host.as_str()),
            "dispatching batch"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let commands = Arc::new(commands);

        let mut pending: FuturesUnordered<_> = hosts
            .into_iter()
            .map(|host| {
                let semaphore = semaphore.clone();
                let connector = self.connector.clone();
                let progress = self.progress.clone();
                let commands = commands.clone();
                let spec = ConnectionSpec::new(host, options.clone()).with_port(port);

                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return HostExecutionResult::failed(spec.host, ExecError::internal(e))
                        }
                    };

                    match &spec.options.tunnel {
                        Some(tunnel) => {
                            debug!(host = %spec.host, tunnel = %tunnel.host, "executing via tunnel")
                        }
                        None => debug!(host = %spec.host, "executing"),
                    }
                    execute_on_host(connector, spec, commands.as_ref().clone(), progress).await
                }
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        while let Some(result) = pending.next().await {
            results.push(result);
        }

        let batch = BatchResult { hosts: results };
        info!(
            hosts = total,
            failed = batch.failed().count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(batch)
    }
}

/// Run a batch over real SSH connections, logging progress at debug level
pub async fn execute_batch(request: BatchRequest) -> Result<BatchResult, RequestError> {
    BatchDispatcher::new(Arc::new(SshConnector::new()))
        .with_progress(Arc::new(TracingProgress))
        .dispatch(request)
        .await
}
