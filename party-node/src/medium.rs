//! Discovery media: where announcements travel. UDP multicast on a LAN, or an in-process hub.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const MAX_DATAGRAM: usize = 65536;

/// A shared datagram bus. Every port sees every datagram, including its own.
#[derive(Clone)]
pub enum Medium {
    Udp(Arc<UdpMedium>),
    Local(LocalPort),
}

impl Medium {
    /// Join `group:port` on all interfaces. TTL 1 keeps announcements on the local link.
    pub async fn udp(group: Ipv4Addr, port: u16) -> io::Result<Medium> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_multicast_loop_v4(true)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        debug!("discovery bound to {}:{}", group, port);
        Ok(Medium::Udp(Arc::new(UdpMedium {
            socket,
            dest: SocketAddr::new(IpAddr::V4(group), port),
        })))
    }

    pub fn local(hub: &LocalHub) -> Medium {
        Medium::Local(LocalPort {
            tx: hub.tx.clone(),
            rx: Arc::new(Mutex::new(hub.tx.subscribe())),
        })
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Medium::Udp(m) => m.socket.send_to(bytes, m.dest).await.map(|_| ()),
            Medium::Local(p) => {
                // A port always holds a receiver, so the hub is never empty.
                let _ = p.tx.send(bytes.to_vec());
                Ok(())
            }
        }
    }

    /// Next datagram and the IP it came from.
    pub async fn recv(&self) -> io::Result<(Vec<u8>, IpAddr)> {
        match self {
            Medium::Udp(m) => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let (n, from) = m.socket.recv_from(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, from.ip()))
            }
            Medium::Local(p) => {
                let mut rx = p.rx.lock().await;
                loop {
                    match rx.recv().await {
                        Ok(bytes) => return Ok((bytes, IpAddr::V4(Ipv4Addr::LOCALHOST))),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("local discovery port skipped {} datagrams", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "hub closed"))
                        }
                    }
                }
            }
        }
    }
}

pub struct UdpMedium {
    socket: UdpSocket,
    dest: SocketAddr,
}

/// In-process discovery bus. Announcements carry loopback as their source address.
#[derive(Clone)]
pub struct LocalHub {
    tx: broadcast::Sender<Vec<u8>>,
}

impl LocalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LocalPort {
    tx: broadcast::Sender<Vec<u8>>,
    rx: Arc<Mutex<broadcast::Receiver<Vec<u8>>>>,
}
