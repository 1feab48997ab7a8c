//! Node identity atoms.
//!
//! NodeName: globally unique peer name.
//! ListenAddr: an address a peer accepts connections on.
//! NodeSpec: a peer's full advertisement; equality is by name only.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::channel::ChannelId;
use super::error::{CoreError, InvalidId};

/// Globally unique node name, e.g. `node1@127.0.0.1`.
///
/// Names are non-empty and restricted to a printable subset so they survive
/// both wire forms of remote references unescaped.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Node {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        for c in s.chars() {
            if !(c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-')) {
                return Err(InvalidId::Node {
                    raw: s.clone(),
                    reason: format!("contains forbidden character {c:?}"),
                }
                .into());
            }
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({:?})", self.0)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One address a node listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListenAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl ListenAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let addr: SocketAddr = s.parse().map_err(|_| InvalidId::ListenAddr {
            raw: s.to_string(),
            reason: "expected ip:port".into(),
        })?;
        Ok(Self::from(addr))
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// A peer's advertisement: name, listen addresses and channel capabilities.
///
/// Two specs are equal iff their names are equal; addresses and channels are
/// metadata that may differ between copies learned along different paths.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: NodeName,
    pub listen_addrs: Vec<ListenAddr>,
    pub channels: Vec<ChannelId>,
}

impl NodeSpec {
    pub fn new(name: NodeName, listen_addrs: Vec<ListenAddr>, channels: Vec<ChannelId>) -> Self {
        Self {
            name,
            listen_addrs,
            channels,
        }
    }

    /// The address peers should dial first.
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.listen_addrs.first().map(ListenAddr::socket_addr)
    }
}

impl PartialEq for NodeSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeSpec {}

impl PartialOrd for NodeSpec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeSpec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl std::hash::Hash for NodeSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, port: u16) -> NodeSpec {
        NodeSpec::new(
            NodeName::parse(name).unwrap(),
            vec![ListenAddr::parse(&format!("127.0.0.1:{port}")).unwrap()],
            vec![ChannelId::default_channel()],
        )
    }

    #[test]
    fn node_name_rejects_empty_and_whitespace() {
        assert!(NodeName::parse("").is_err());
        assert!(NodeName::parse("a b").is_err());
        assert!(NodeName::parse("node1@127.0.0.1").is_ok());
    }

    #[test]
    fn spec_equality_ignores_metadata() {
        let a = spec("n1@localhost", 4000);
        let b = spec("n1@localhost", 9000);
        assert_eq!(a, b);
        assert_ne!(a, spec("n2@localhost", 4000));
    }

    #[test]
    fn listen_addr_round_trips() {
        let addr = ListenAddr::parse("127.0.0.1:4040").unwrap();
        assert_eq!(ListenAddr::parse(&addr.to_string()).unwrap(), addr);
    }
}
