// SSH sessions and single-command channels

use std::fmt;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use ssh2::{Channel, ErrorCode, KeyboardInteractivePrompt, Session};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::tunnel::Tunnel;
use super::{ChannelEvent, Connector, EventStream, RemoteSession};
use crate::output::errors::{ExecError, Stage};

/// Port used when a host does not name one
pub const DEFAULT_PORT: u16 = 22;

/// Handshake timeout used when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a non-blocking read loop sleeps when nothing arrived
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(10);

// libssh2 error codes we classify
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_METHOD_NONE: i32 = -17;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_KEYFILE_AUTH_FAILED: i32 = -48;

/// The single credential presented to a host
#[derive(Clone)]
pub enum Credentials {
    Password(Zeroizing<String>),
    /// Private key material (PEM/OpenSSH text), not a path
    PrivateKey(Zeroizing<String>),
    /// Rely on the SSH agent only
    Agent,
    /// Nothing was configured; the host will reject the login
    Missing,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Credentials::Password(Zeroizing::new(password.into()))
    }

    pub fn private_key(key: impl Into<String>) -> Self {
        Credentials::PrivateKey(Zeroizing::new(key.into()))
    }

    fn method(&self) -> &'static str {
        match self {
            Credentials::Password(_) => "password",
            Credentials::PrivateKey(_) => "publickey",
            Credentials::Agent => "agent",
            Credentials::Missing => "none",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials::{}(<redacted>)", self.method())
    }
}

/// Intermediate host used to reach the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHost {
    pub host: String,
    pub port: u16,
}

impl TunnelHost {
    pub fn new(host: impl Into<String>) -> Self {
        TunnelHost {
            host: host.into(),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Everything about a connection except which host it goes to. Shared by
/// every host of a batch.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub username: String,
    pub credentials: Credentials,
    /// Fall back to agent identities when the credential is rejected
    pub use_agent: bool,
    /// Request agent forwarding on every exec channel
    pub agent_forwarding: bool,
    pub tunnel: Option<TunnelHost>,
    pub connect_timeout: Duration,
}

impl SessionOptions {
    pub fn new(username: impl Into<String>, credentials: Credentials) -> Self {
        SessionOptions {
            username: username.into(),
            credentials,
            use_agent: false,
            agent_forwarding: false,
            tunnel: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_tunnel(mut self, tunnel: TunnelHost) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn with_agent(mut self, use_agent: bool) -> Self {
        self.use_agent = use_agent;
        self
    }

    pub fn with_agent_forwarding(mut self, forward: bool) -> Self {
        self.agent_forwarding = forward;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Where and how to connect for one host. Immutable once built.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub options: SessionOptions,
}

impl ConnectionSpec {
    pub fn new(host: impl Into<String>, options: SessionOptions) -> Self {
        ConnectionSpec {
            host: host.into(),
            port: DEFAULT_PORT,
            options,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(&self) -> &str {
        &self.options.username
    }
}

/// Open a TCP connection, trying every resolved address in turn
pub(crate) fn connect_tcp(
    stage: Stage,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ExecError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ExecError::transport(stage, host, format!("failed to resolve: {}", e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%host, %addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => {
            Err(ExecError::timeout(stage, host, timeout))
        }
        Some(e) => Err(ExecError::transport(stage, host, format!("connection failed: {}", e))),
        None => Err(ExecError::transport(stage, host, "no addresses resolved")),
    }
}

/// Map a libssh2 failure outside of authentication
pub(crate) fn map_ssh_error(
    stage: Stage,
    host: &str,
    timeout: Duration,
    context: &str,
    err: ssh2::Error,
) -> ExecError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT) => {
            ExecError::timeout(stage, host, timeout)
        }
        _ => ExecError::transport(stage, host, format!("{}: {}", context, err)),
    }
}

/// The server refused the credential, or the key could not be used
fn is_rejection(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(
            LIBSSH2_ERROR_PASSWORD_EXPIRED
                | LIBSSH2_ERROR_FILE
                | LIBSSH2_ERROR_METHOD_NONE
                | LIBSSH2_ERROR_AUTHENTICATION_FAILED
                | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
                | LIBSSH2_ERROR_KEYFILE_AUTH_FAILED
        )
    )
}

/// Handshake and authenticate over an already connected stream. The
/// handshake timeout is lifted once authentication succeeds.
pub(crate) fn start_session(
    stage: Stage,
    host: &str,
    stream: TcpStream,
    options: &SessionOptions,
) -> Result<Session, ExecError> {
    let timeout = options.connect_timeout;
    let mut session = Session::new().map_err(|e| {
        ExecError::transport(stage, host, format!("failed to create SSH session: {}", e))
    })?;

    session.set_tcp_stream(stream);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

    session
        .handshake()
        .map_err(|e| map_ssh_error(stage, host, timeout, "SSH handshake failed", e))?;

    authenticate(&session, stage, host, options)?;

    session.set_timeout(0);
    debug!(%host, %stage, user = %options.username, "session established");
    Ok(session)
}

fn authenticate(
    session: &Session,
    stage: Stage,
    host: &str,
    options: &SessionOptions,
) -> Result<(), ExecError> {
    let user = options.username.as_str();
    let mut last_error: Option<ssh2::Error> = None;

    let attempt = match &options.credentials {
        Credentials::Password(password) => session.userauth_password(user, password).or_else(|e| {
            // Some PAM setups only offer keyboard-interactive
            let mut prompter = PasswordPrompter(password.clone());
            session
                .userauth_keyboard_interactive(user, &mut prompter)
                .map_err(|_| e)
        }),
        Credentials::PrivateKey(key) => session.userauth_pubkey_memory(user, None, key, None),
        Credentials::Agent | Credentials::Missing => Ok(()),
    };
    if let Err(e) = attempt {
        // A reset or stall mid-login is a network failure, not a rejection
        if !is_rejection(&e) {
            return Err(map_ssh_error(stage, host, options.connect_timeout, "authentication", e));
        }
        last_error = Some(e);
    }

    let wants_agent = options.use_agent || matches!(options.credentials, Credentials::Agent);
    if !session.authenticated() && wants_agent {
        if let Err(e) = authenticate_with_agent(session, user) {
            last_error = Some(e);
        }
    }

    if session.authenticated() {
        return Ok(());
    }

    Err(ExecError::Authentication {
        stage,
        host: host.to_string(),
        username: user.to_string(),
        message: match (last_error, &options.credentials) {
            (Some(e), _) => e.message().to_string(),
            (None, Credentials::Missing) => {
                "no password, private key or SSH agent configured".to_string()
            }
            (None, credentials) => format!("{} authentication rejected", credentials.method()),
        },
    })
}

fn authenticate_with_agent(session: &Session, user: &str) -> Result<(), ssh2::Error> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;
    for identity in agent.identities()? {
        if agent.userauth(user, &identity).is_ok() {
            break;
        }
    }
    let _ = agent.disconnect();
    Ok(())
}

/// Answers every keyboard-interactive prompt with the password
struct PasswordPrompter(Zeroizing<String>);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.to_string()).collect()
    }
}

/// One authenticated SSH session to one host
pub struct SshChannel {
    session: Option<Session>,
    host: String,
    connect_timeout: Duration,
    agent_forwarding: bool,
}

impl SshChannel {
    /// Connect directly to `spec.host`
    pub fn open(spec: &ConnectionSpec) -> Result<Self, ExecError> {
        let stream = connect_tcp(
            Stage::Target,
            &spec.host,
            spec.port,
            spec.options.connect_timeout,
        )?;
        Self::establish(stream, spec)
    }

    /// Run the SSH protocol over an existing stream (direct or forwarded)
    pub fn establish(stream: TcpStream, spec: &ConnectionSpec) -> Result<Self, ExecError> {
        let session = start_session(Stage::Target, &spec.host, stream, &spec.options)?;
        Ok(SshChannel {
            session: Some(session),
            host: spec.host.clone(),
            connect_timeout: spec.options.connect_timeout,
            agent_forwarding: spec.options.agent_forwarding,
        })
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Start one command and stream its output
    pub fn exec_one(&mut self, command: &str) -> Result<CommandStream<'_>, ExecError> {
        let host = self.host.as_str();
        let timeout = self.connect_timeout;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ExecError::transport(Stage::Target, host, "session is closed"))?;

        let mut channel = session
            .channel_session()
            .map_err(|e| map_ssh_error(Stage::Target, host, timeout, "failed to open channel", e))?;

        if self.agent_forwarding {
            if let Err(e) = channel.request_auth_agent_forwarding() {
                warn!(%host, error = %e, "agent forwarding refused");
            }
        }

        channel.exec(command).map_err(|e| {
            map_ssh_error(Stage::Target, host, timeout, "failed to execute command", e)
        })?;

        session.set_blocking(false);
        Ok(CommandStream {
            session,
            channel,
            host,
            buf: [0u8; 4096],
            stdout: Utf8Chunks::default(),
            stderr: Utf8Chunks::default(),
            finished: false,
        })
    }

    /// Disconnect. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.set_blocking(true);
            session.set_timeout(self.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!(host = %self.host, error = %e, "disconnect failed");
            }
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output of one running command. Polls stdout and stderr without blocking
/// and yields `Closed` once the remote side reaches end of file.
pub struct CommandStream<'a> {
    session: &'a Session,
    channel: Channel,
    host: &'a str,
    buf: [u8; 4096],
    stdout: Utf8Chunks,
    stderr: Utf8Chunks,
    finished: bool,
}

/// Decodes a byte stream chunk by chunk, holding back a multi-byte
/// character split across reads until its remaining bytes arrive
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail(&self.pending);
        if complete == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        Some(text)
    }

    /// Whatever is left once the stream has ended
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a trailing UTF-8 sequence that still lacks bytes
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

impl CommandStream<'_> {
    fn fail(&mut self, err: impl fmt::Display) -> ExecError {
        self.finished = true;
        ExecError::transport(Stage::Target, self.host, err)
    }

    fn finish(&mut self) -> Result<ChannelEvent, ExecError> {
        self.finished = true;
        self.session.set_blocking(true);
        self.channel
            .wait_close()
            .map_err(|e| ExecError::transport(Stage::Target, self.host, e))?;

        let signal = self
            .channel
            .exit_signal()
            .ok()
            .and_then(|s| s.exit_signal);
        let exit_code = match signal {
            Some(_) => None,
            None => self.channel.exit_status().ok(),
        };
        Ok(ChannelEvent::Closed { exit_code, signal })
    }
}

impl Iterator for CommandStream<'_> {
    type Item = Result<ChannelEvent, ExecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match read_some(&mut self.channel, &mut self.buf) {
                Ok(0) => {}
                Ok(n) => {
                    if let Some(text) = self.stdout.push(&self.buf[..n]) {
                        return Some(Ok(ChannelEvent::Stdout(text)));
                    }
                    continue;
                }
                Err(e) => return Some(Err(self.fail(e))),
            }

            match read_some(&mut self.channel.stderr(), &mut self.buf) {
                Ok(0) => {}
                Ok(n) => {
                    if let Some(text) = self.stderr.push(&self.buf[..n]) {
                        return Some(Ok(ChannelEvent::Stderr(text)));
                    }
                    continue;
                }
                Err(e) => return Some(Err(self.fail(e))),
            }

            // Both streams were drained on this pass
            if self.channel.eof() {
                if let Some(text) = self.stdout.flush() {
                    return Some(Ok(ChannelEvent::Stdout(text)));
                }
                if let Some(text) = self.stderr.flush() {
                    return Some(Ok(ChannelEvent::Stderr(text)));
                }
                return Some(self.finish());
            }

            thread::sleep(IDLE_POLL);
        }
    }
}

impl Drop for CommandStream<'_> {
    fn drop(&mut self) {
        self.session.set_blocking(true);
        if !self.finished {
            let _ = self.channel.close();
        }
    }
}

/// A target session plus the tunnel it rides on, if any
pub struct SshConnection {
    channel: SshChannel,
    tunnel: Option<Tunnel>,
}

impl SshConnection {
    pub fn host(&self) -> &str {
        &self.channel.host
    }

    pub fn is_tunnelled(&self) -> bool {
        self.tunnel.is_some()
    }
}

impl RemoteSession for SshConnection {
    fn exec_one(&mut self, command: &str) -> Result<EventStream<'_>, ExecError> {
        let stream = self.channel.exec_one(command)?;
        Ok(Box::new(stream))
    }

    fn close(&mut self) {
        // The tunnel carries the target session, so it goes last
        self.channel.close();
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.close();
        }
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens real SSH connections, through a tunnel when one is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        SshConnector
    }
}

impl Connector for SshConnector {
    fn open(&self, spec: &ConnectionSpec) -> Result<Box<dyn RemoteSession>, ExecError> {
        let connection = match &spec.options.tunnel {
            Some(tunnel_host) => {
                let (mut tunnel, stream) =
                    Tunnel::open_forward(tunnel_host, &spec.options, &spec.host, spec.port)?;
                match SshChannel::establish(stream, spec) {
                    Ok(channel) => SshConnection {
                        channel,
                        tunnel: Some(tunnel),
                    },
                    Err(e) => {
                        tunnel.close();
                        return Err(e);
                    }
                }
            }
            None => SshConnection {
                channel: SshChannel::open(spec)?,
                tunnel: None,
            },
        };
        Ok(Box::new(connection))
    }
}
