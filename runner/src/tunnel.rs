use crate::config::TunnelConfig;
use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to start ssh")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to find a free local port")]
    NoFreePort(#[source] std::io::Error),
    #[error("ssh exited before the tunnel was ready: {0}")]
    Exited(ExitStatus),
    #[error("Tunnel was not ready within {0:?}")]
    NotReady(Duration),
}

/// Local loopback endpoint forwarded to the queue service through `ssh -L`, closed on drop
#[derive(Debug)]
pub struct Tunnel {
    child: Child,
    local: SocketAddr,
    prefix: String,
}

/// Let the OS pick a port, there is a small window in which another process may grab it
fn free_port() -> Result<u16, TunnelError> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|address| address.port())
        .map_err(TunnelError::NoFreePort)
}

impl Tunnel {
    pub fn open(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let port = if config.local_port == 0 {
            free_port()?
        } else {
            config.local_port
        };
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let mut command = Command::new("ssh");
        command
            .args(["-N", "-o", "ExitOnForwardFailure=yes", "-o", "BatchMode=yes"])
            .arg("-L")
            .arg(format!("{local}:{}", config.remote));
        if let Some(identity) = &config.identity {
            command.arg("-i").arg(identity);
        }
        command
            .arg(&config.ssh)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        debug!(ssh = %config.ssh, remote = %config.remote, local = %local, "Starting tunnel");
        let child = command.spawn().map_err(TunnelError::Spawn)?;

        let mut tunnel = Self {
            child,
            local,
            prefix: config.prefix.clone(),
        };
        tunnel.wait_ready(Duration::from_millis(config.ready_timeout_ms))?;
        info!(local = %local, remote = %config.remote, "Tunnel ready");

        Ok(tunnel)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), TunnelError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait().map_err(TunnelError::Spawn)? {
                return Err(TunnelError::Exited(status));
            }

            if TcpStream::connect_timeout(&self.local, Duration::from_millis(200)).is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::NotReady(timeout));
            }

            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Base url of the experiment routes through the tunnel
    pub fn api_url(&self) -> String {
        format!("http://{}{}", self.local, self.prefix)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        match self.child.kill() {
            Ok(()) => {
                let _ = self.child.wait();
                debug!(local = %self.local, "Closed tunnel");
            }
            Err(error) => warn!(error = ?error, "Failed to stop ssh tunnel"),
        }
    }
}
