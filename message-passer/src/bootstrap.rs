//! Peer discovery seam.
//!
//! A [`Bootstrap`] turns the local node into the full list of session
//! members before the mesh is built.  [`StaticBootstrap`] serves the list
//! from a cluster file.

use {
    crate::{error::Result, node::Node},
    log::debug,
};

pub trait Bootstrap {
    /// Resolve every member of the session, `local` included.
    fn peers(&self, local: &Node) -> Result<Vec<Node>>;
}

/// A fixed node list known ahead of time.
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrap {
    nodes: Vec<Node>,
}

impl StaticBootstrap {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

impl Bootstrap for StaticBootstrap {
    fn peers(&self, local: &Node) -> Result<Vec<Node>> {
        let mut nodes = self.nodes.clone();
        if !nodes.iter().any(|n| n.name == local.name) {
            debug!("{} not in the static node list, adding it", local);
            nodes.push(local.clone());
        }
        Ok(nodes)
    }
}
