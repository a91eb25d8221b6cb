use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::util::buf::{BufExt, BufMutExt};

/// A (host, port) pair. Hosts are kept as names rather than resolved addresses: the meta server
///  location is resolved on every connection attempt, and a chunk server advertises its client
///  listener under the name clients should use.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct ServerLocation {
    pub hostname: String,
    pub port: u16,
}
impl ServerLocation {
    pub fn new(hostname: impl Into<String>, port: u16) -> ServerLocation {
        ServerLocation {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.hostname);
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ServerLocation> {
        let hostname = buf.checked_get_string()?;
        let port = buf.checked_get_u16()?;
        Ok(ServerLocation {
            hostname,
            port,
        })
    }
}

impl Debug for ServerLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.hostname, self.port)
    }
}

impl Display for ServerLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for ServerLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hostname, port) = s.rsplit_once(':')
            .ok_or_else(|| anyhow!("server location {:?} is not of the form host:port", s))?;

        // IPv6 literals are written in brackets
        let hostname = hostname.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname);

        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("invalid port in server location {:?}: {}", s, e))?;

        let result = ServerLocation::new(hostname, port);
        if !result.is_valid() {
            return Err(anyhow!("invalid server location {:?}", s));
        }
        Ok(result)
    }
}
