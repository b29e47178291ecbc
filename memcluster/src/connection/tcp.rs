use std::io;

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
use std::time::Duration;

use tokio::net::TcpStream;

pub use socket2;

/// Socket options applied to every TCP connection to a cache node.
///
/// `TCP_NODELAY` is on by default: requests are small and a delayed `get`
/// costs more than the extra packets.
#[derive(Clone, Debug)]
pub struct TcpSettings {
    nodelay: bool,
    keepalive: Option<socket2::TcpKeepalive>,
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    user_timeout: Option<Duration>,
}

impl TcpSettings {
    /// Turns `TCP_NODELAY` on or off.
    pub fn set_nodelay(self, nodelay: bool) -> Self {
        Self { nodelay, ..self }
    }

    /// Enables keepalive probes, so idle pooled connections to a vanished
    /// node are noticed by the kernel.
    pub fn set_keepalive(self, keepalive: socket2::TcpKeepalive) -> Self {
        Self {
            keepalive: Some(keepalive),
            ..self
        }
    }

    /// Bounds how long sent data may stay unacknowledged before the
    /// connection is dropped (`TCP_USER_TIMEOUT`).
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    pub fn set_user_timeout(self, user_timeout: Duration) -> Self {
        Self {
            user_timeout: Some(user_timeout),
            ..self
        }
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = socket2::SockRef::from(stream);
        if let Some(keepalive) = &self.keepalive {
            sock.set_tcp_keepalive(keepalive)?;
        }
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        sock.set_tcp_user_timeout(self.user_timeout)?;
        Ok(())
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            user_timeout: None,
        }
    }
}
