//! Node-qualified destinations.
//!
//! A RemoteRef names a node, a registered name on a node, or an opaque
//! process token on a node. Two wire forms exist and must be bit-stable
//! across a cluster: the pair form (node paired with a target tag) and a
//! URI string form. The form in use is fixed by configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};
use super::identity::NodeName;

const URI_SCHEME: &str = "partisan";

/// Which wire encoding remote refs use cluster-wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefFormat {
    /// Node name paired with a tagged target, encoded structurally.
    #[default]
    ImproperList,
    /// Single `partisan:...` URI string.
    Uri,
}

/// A message destination.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemoteRef {
    /// The node itself (no local target).
    Node(NodeName),
    /// A registered name on a node.
    Name { node: NodeName, name: String },
    /// An opaque process token on a node.
    Pid { node: NodeName, token: String },
}

impl RemoteRef {
    pub fn node(&self) -> &NodeName {
        match self {
            RemoteRef::Node(node) => node,
            RemoteRef::Name { node, .. } => node,
            RemoteRef::Pid { node, .. } => node,
        }
    }

    /// The local delivery target, if the ref names one.
    pub fn target(&self) -> Option<&str> {
        match self {
            RemoteRef::Node(_) => None,
            RemoteRef::Name { name, .. } => Some(name),
            RemoteRef::Pid { token, .. } => Some(token),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RemoteRef::Node(_) => "node",
            RemoteRef::Name { .. } => "name",
            RemoteRef::Pid { .. } => "pid",
        }
    }

    /// Render the URI form: `partisan:<kind>:<node>[:<target>]`.
    pub fn to_uri(&self) -> String {
        match self.target() {
            None => format!("{URI_SCHEME}:{}:{}", self.kind(), self.node()),
            Some(target) => format!("{URI_SCHEME}:{}:{}:{target}", self.kind(), self.node()),
        }
    }

    /// Parse the URI form.
    pub fn parse_uri(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| InvalidId::RemoteRef {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let rest = raw
            .strip_prefix(URI_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| invalid("missing partisan: scheme"))?;
        let mut parts = rest.splitn(3, ':');
        let kind = parts.next().ok_or_else(|| invalid("missing kind"))?;
        let node = parts.next().ok_or_else(|| invalid("missing node"))?;
        let node = NodeName::parse(node)?;
        let target = parts.next();

        match (kind, target) {
            ("node", None) => Ok(RemoteRef::Node(node)),
            ("node", Some(_)) => Err(invalid("node refs carry no target").into()),
            ("name", Some(name)) if !name.is_empty() => Ok(RemoteRef::Name {
                node,
                name: name.to_string(),
            }),
            ("pid", Some(token)) if !token.is_empty() => Ok(RemoteRef::Pid {
                node,
                token: token.to_string(),
            }),
            ("name", _) | ("pid", _) => Err(invalid("missing target").into()),
            _ => Err(invalid("unknown kind").into()),
        }
    }

    /// Rebuild from the pair form: node plus tagged target.
    pub fn from_pair(node: NodeName, kind: &str, target: Option<&str>) -> Result<Self, CoreError> {
        match (kind, target) {
            ("node", None) => Ok(RemoteRef::Node(node)),
            ("name", Some(name)) if !name.is_empty() => Ok(RemoteRef::Name {
                node,
                name: name.to_string(),
            }),
            ("pid", Some(token)) if !token.is_empty() => Ok(RemoteRef::Pid {
                node,
                token: token.to_string(),
            }),
            _ => Err(InvalidId::RemoteRef {
                raw: format!("{kind}:{target:?}"),
                reason: "kind and target do not agree".into(),
            }
            .into()),
        }
    }

    /// Destructure into the pair form.
    pub fn as_pair(&self) -> (&NodeName, &'static str, Option<&str>) {
        (self.node(), self.kind(), self.target())
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeName {
        NodeName::parse(name).unwrap()
    }

    #[test]
    fn uri_round_trips_all_kinds() {
        let refs = [
            RemoteRef::Node(node("n1@10.0.0.1")),
            RemoteRef::Name {
                node: node("n1@10.0.0.1"),
                name: "store_proc".into(),
            },
            RemoteRef::Pid {
                node: node("n2@10.0.0.2"),
                token: "proc.42.7".into(),
            },
        ];
        for r in refs {
            assert_eq!(RemoteRef::parse_uri(&r.to_uri()).unwrap(), r);
        }
    }

    #[test]
    fn pair_round_trips() {
        let r = RemoteRef::Name {
            node: node("n1@host"),
            name: "svc".into(),
        };
        let (n, kind, target) = r.as_pair();
        let back = RemoteRef::from_pair(n.clone(), kind, target).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!(RemoteRef::parse_uri("http://x").is_err());
        assert!(RemoteRef::parse_uri("partisan:name:n1@host").is_err());
        assert!(RemoteRef::parse_uri("partisan:node:n1@host:extra").is_err());
        assert!(RemoteRef::parse_uri("partisan:what:n1@host").is_err());
    }
}
