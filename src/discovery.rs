use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a cluster peer.
///
/// Nodes are compared by `(host, port)` and are used as keys in every
/// membership set and progress map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub host: String,
    pub port: u16,
}

impl DiscoveryNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for DiscoveryNode {
    type Err = String;

    /// Parses `host:port`, splitting on the last colon.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {:?}: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let node = DiscoveryNode::new("10.0.0.1", 9000);
        assert_eq!(node.to_string(), "10.0.0.1:9000");
        assert_eq!("10.0.0.1:9000".parse::<DiscoveryNode>().unwrap(), node);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("localhost".parse::<DiscoveryNode>().is_err());
        assert!(":8080".parse::<DiscoveryNode>().is_err());
        assert!("localhost:http".parse::<DiscoveryNode>().is_err());
    }

    #[test]
    fn ordering_is_host_then_port() {
        let a = DiscoveryNode::new("a", 2);
        let b = DiscoveryNode::new("a", 10);
        let c = DiscoveryNode::new("b", 1);
        assert!(a < b);
        assert!(b < c);
    }
}
