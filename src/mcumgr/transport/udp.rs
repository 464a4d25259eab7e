//! SMP over UDP

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::mcumgr::session::{Link, Session, SmpSession, Transport};
use crate::{Error, Result};

/// Port MCUmgr listens on when the address has none
pub const DEFAULT_PORT: u16 = 1337;

const UDP_MTU: usize = 1024;

/// Device reachable over UDP
#[derive(Debug)]
pub struct UdpTransport {
    id: String,
    address: String,
    lock: Arc<Mutex<()>>,
}

impl UdpTransport {
    /// Transport for `host[:port]`
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the address is empty
    pub fn new(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Transport("empty UDP address".to_string()));
        }
        let address = if has_port(address) {
            address.to_string()
        } else if address.contains(':') {
            format!("[{address}]:{DEFAULT_PORT}")
        } else {
            format!("{address}:{DEFAULT_PORT}")
        };
        Ok(Self {
            id: format!("udp://{address}"),
            address,
            lock: Arc::new(Mutex::new(())),
        })
    }
}

fn has_port(address: &str) -> bool {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.contains("]:");
    }
    address.matches(':').count() == 1
}

#[async_trait]
impl Transport for UdpTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn acquire_session(&self) -> Result<Box<dyn Session>> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let peer = tokio::net::lookup_host(&self.address)
            .await?
            .next()
            .ok_or_else(|| Error::Transport(format!("cannot resolve {}", self.address)))?;
        let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;

        Ok(Box::new(SmpSession::new(UdpLink {
            socket,
            _guard: guard,
        })))
    }
}

struct UdpLink {
    socket: UdpSocket,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl Link for UdpLink {
    fn mtu(&self) -> usize {
        UDP_MTU
    }

    async fn transceive(&mut self, packet: &[u8], seq: u8, timeout: Duration) -> Result<Vec<u8>> {
        self.socket.send(packet).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; 65_536];
        loop {
            let n = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf))
                .await
                .map_err(|_| Error::Transport("timed out waiting for UDP response".to_string()))??;
            if n > 6 && buf[6] == seq {
                return Ok(buf[..n].to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(UdpTransport::new("10.0.0.2").unwrap().address, "10.0.0.2:1337");
        assert_eq!(UdpTransport::new("10.0.0.2:9000").unwrap().address, "10.0.0.2:9000");
        assert_eq!(UdpTransport::new("fe80::1").unwrap().address, "[fe80::1]:1337");
        assert_eq!(UdpTransport::new("[fe80::1]:5").unwrap().address, "[fe80::1]:5");
        assert!(UdpTransport::new(" ").is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_with_echo_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(&buf[..n], from).await.unwrap();
        });

        let transport = UdpTransport::new(&addr.to_string()).unwrap();
        let guard = Arc::clone(&transport.lock).lock_owned().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        let mut link = UdpLink { socket, _guard: guard };

        let packet = [2u8, 0, 0, 0, 0, 0, 9, 0];
        let reply = link.transceive(&packet, 9, Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, packet);
    }
}
