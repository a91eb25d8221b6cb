use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::session::server_location::ServerLocation;

/// A connection to the meta server. It is owned exclusively by the session.
#[async_trait]
pub trait Endpoint: Send {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    /// Appends at most `max_read_ahead` received bytes to `buf`, returning the number of bytes
    ///  that were added. `0` means that the peer closed the connection.
    ///
    /// NB: This must be cancel safe, it is polled in a `select!` loop
    async fn recv(&mut self, buf: &mut BytesMut, max_read_ahead: usize) -> anyhow::Result<usize>;

    fn is_good(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Opens [Endpoint]s - one per connection attempt
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, location: &ServerLocation) -> anyhow::Result<Box<dyn Endpoint>>;
}


pub struct TcpConnector {
    connect_timeout: Duration,
}
impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> TcpConnector {
        TcpConnector {
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, location: &ServerLocation) -> anyhow::Result<Box<dyn Endpoint>> {
        let addr = (location.hostname.as_str(), location.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr)).await
            .map_err(|_| anyhow!("timeout connecting to {}", location))??;
        stream.set_nodelay(true)?;

        let local_addr = stream.local_addr().ok();
        debug!("connected to {} from {:?}", location, local_addr);

        Ok(Box::new(TcpEndpoint {
            stream,
            local_addr,
            is_good: true,
        }))
    }
}

pub struct TcpEndpoint {
    stream: TcpStream,
    local_addr: Option<SocketAddr>,
    is_good: bool,
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        if let Err(e) = self.stream.write_all(buf).await {
            self.is_good = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut BytesMut, max_read_ahead: usize) -> anyhow::Result<usize> {
        buf.reserve(max_read_ahead);
        let mut limited = (&mut *buf).limit(max_read_ahead);
        match self.stream.read_buf(&mut limited).await {
            Ok(0) => {
                self.is_good = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.is_good = false;
                Err(e.into())
            }
        }
    }

    fn is_good(&self) -> bool {
        self.is_good
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
