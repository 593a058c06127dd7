//! The static directory of nodes taking part in a session.
//!
//! The directory is sorted by node name once, at construction.  A node's
//! position in that order is its vector-clock dimension, so every member
//! of the mesh must be built from the same node list.

use {
    crate::error::{MessagePasserError, Result},
    serde::{Deserialize, Serialize},
    std::{collections::HashSet, fmt},
};

/// A participant in the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Node {
    /// Unique node name.  Names are totally ordered and that order decides
    /// who dials whom during mesh setup.
    pub name: String,
    /// Host name or IP address the node listens on.
    pub address: String,
    /// TCP port the node listens on.
    pub port: u16,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port`, suitable for `TcpStream::connect`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

/// Immutable, name-sorted list of every node in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
}

impl NodeDirectory {
    /// Build a directory, sorting by name.
    ///
    /// Fails on an empty list or when two nodes share a name.
    pub fn new(mut nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MessagePasserError::EmptyDirectory);
        }
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(MessagePasserError::DuplicateNode(node.name.clone()));
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Vector-clock dimension of `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes
            .binary_search_by(|node| node.name.as_str().cmp(name))
            .ok()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index_of(name).and_then(|i| self.nodes.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Look up `name`, failing with [`MessagePasserError::UnknownNode`].
    pub fn require(&self, name: &str) -> Result<(usize, &Node)> {
        let index = self
            .index_of(name)
            .ok_or_else(|| MessagePasserError::UnknownNode(name.to_string()))?;
        Ok((index, &self.nodes[index]))
    }

    /// Split the directory around `local_name`.
    ///
    /// `front` holds every node whose name sorts strictly before the local
    /// name; the local node listens for those.  `latter` holds the local node
    /// itself and every node after it; the local node dials those, which
    /// includes a dial to itself for the loopback connection.
    pub fn partition(&self, local_name: &str) -> (Vec<&Node>, Vec<&Node>) {
        self.nodes
            .iter()
            .partition(|node| node.name.as_str() < local_name)
    }
}
