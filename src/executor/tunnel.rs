// Double-hop tunnelling through an intermediate SSH host
//
// The jump session opens a direct-tcpip channel to the target. A loopback
// socket pair bridges that channel to an ordinary TcpStream, which the
// target session then uses as its transport.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, warn};

use super::ssh::{
    connect_tcp, map_ssh_error, start_session, SessionOptions, TunnelHost, IDLE_POLL,
};
use crate::output::errors::{ExecError, Stage};

/// A byte stream that can tell a real end-of-file from an empty read
pub(crate) trait ForwardedStream: Read + Write {
    fn at_eof(&self) -> bool;
}

impl ForwardedStream for ssh2::Channel {
    fn at_eof(&self) -> bool {
        self.eof()
    }
}

impl ForwardedStream for TcpStream {
    fn at_eof(&self) -> bool {
        true
    }
}

/// An open jump-host session forwarding to one target
pub struct Tunnel {
    host: String,
    session: Option<Session>,
    shutdown: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

impl Tunnel {
    /// Connect to the jump host and forward to `target_host:target_port`.
    /// Returns the tunnel and the local end of the forwarded socket.
    pub fn open_forward(
        tunnel: &TunnelHost,
        options: &SessionOptions,
        target_host: &str,
        target_port: u16,
    ) -> Result<(Tunnel, TcpStream), ExecError> {
        debug!(tunnel = %tunnel.host, target = %target_host, "opening tunnel");

        let stream = connect_tcp(
            Stage::Tunnel,
            &tunnel.host,
            tunnel.port,
            options.connect_timeout,
        )?;
        let session = start_session(Stage::Tunnel, &tunnel.host, stream, options)?;

        let mut tunnel = Tunnel {
            host: tunnel.host.clone(),
            session: Some(session),
            shutdown: Arc::new(AtomicBool::new(false)),
            pump: None,
            connect_timeout: options.connect_timeout,
        };

        match tunnel.forward(target_host, target_port) {
            Ok(local) => Ok((tunnel, local)),
            Err(e) => {
                tunnel.close();
                Err(e)
            }
        }
    }

    fn forward(&mut self, target_host: &str, target_port: u16) -> Result<TcpStream, ExecError> {
        let host = self.host.clone();
        let session = self
            .session
            .clone()
            .ok_or_else(|| ExecError::transport(Stage::Tunnel, &host, "tunnel is closed"))?;

        // Restore the handshake timeout so an unresponsive jump host cannot hang us
        session.set_timeout(millis(self.connect_timeout));
        let channel = session
            .channel_direct_tcpip(target_host, target_port, Some(("127.0.0.1", 0)))
            .map_err(|e| {
                match map_ssh_error(Stage::Tunnel, &host, self.connect_timeout, "forward", e) {
                    timeout @ ExecError::Timeout { .. } => timeout,
                    other => ExecError::Forward {
                        tunnel: host.clone(),
                        target: format!("{}:{}", target_host, target_port),
                        message: match other {
                            ExecError::Transport { message, .. } => message,
                            other => other.to_string(),
                        },
                    },
                }
            })?;
        session.set_timeout(0);

        let (local, bridged) = socket_pair().map_err(|e| {
            ExecError::transport(Stage::Tunnel, &host, format!("local bridge: {}", e))
        })?;

        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("tunnel-{}", host))
            .spawn(move || {
                let mut channel = channel;
                session.set_blocking(false);
                if let Err(e) = pump(&mut channel, bridged, &shutdown) {
                    debug!(tunnel = %host, error = %e, "tunnel pump stopped");
                }
                let _ = channel.send_eof();
                let _ = channel.close();
            })
            .map_err(|e| {
                ExecError::transport(Stage::Tunnel, &self.host, format!("spawn pump: {}", e))
            })?;

        self.pump = Some(handle);
        debug!(
            tunnel = %self.host,
            target = %target_host,
            port = target_port,
            "forward established"
        );
        Ok(local)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Stop forwarding and disconnect from the jump host. Later calls do
    /// nothing. Close the target session first.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!(tunnel = %self.host, "tunnel pump panicked");
            }
        }

        let Some(session) = self.session.take() else {
            return;
        };
        session.set_blocking(true);
        session.set_timeout(millis(self.connect_timeout));
        if let Err(e) = session.disconnect(None, "closing", None) {
            debug!(tunnel = %self.host, error = %e, "disconnect failed");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

/// A connected loopback pair: (our end, the end handed to the pump)
fn socket_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let local = TcpStream::connect(listener.local_addr()?)?;
    let (accepted, peer) = listener.accept()?;

    // Anyone else on the machine could have raced us to the port
    if peer != local.local_addr()? {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "unexpected peer on tunnel bridge",
        ));
    }
    Ok((local, accepted))
}

/// Copy bytes both ways between the forwarded stream and the local socket
/// until either side closes or shutdown is requested. The remote stream must
/// already be non-blocking.
pub(crate) fn pump<R: ForwardedStream>(
    remote: &mut R,
    mut local: TcpStream,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    local.set_nonblocking(true)?;
    let mut buf = [0u8; 16 * 1024];

    while !shutdown.load(Ordering::SeqCst) {
        let mut activity = false;

        match local.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                write_fully(remote, &buf[..n], shutdown)?;
                activity = true;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match remote.read(&mut buf) {
            Ok(0) if remote.at_eof() => break,
            Ok(0) => {}
            Ok(n) => {
                write_fully(&mut local, &buf[..n], shutdown)?;
                activity = true;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if !activity {
            thread::sleep(IDLE_POLL);
        }
    }

    let _ = local.shutdown(Shutdown::Both);
    Ok(())
}

fn write_fully<W: Write + ?Sized>(
    writer: &mut W,
    mut data: &[u8],
    shutdown: &AtomicBool,
) -> io::Result<()> {
    while !data.is_empty() {
        if shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "tunnel closed"));
        }
        match writer.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(IDLE_POLL),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
