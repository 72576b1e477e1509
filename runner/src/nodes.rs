use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node list is empty")]
    Empty,
    #[error("At least {required} nodes are required, got {actual}")]
    TooFewNodes { required: usize, actual: usize },
    #[error("Host {0} is not part of the node list")]
    UnknownHost(String),
    #[error("Host {0} has no partner, the node list has an odd length")]
    Unpaired(String),
}

/// How nodes are matched with the node whose tree they work on
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairingStrategy {
    /// node i works on the tree of node i-1, node 0 on the tree of the last node
    #[default]
    Previous,
    /// nodes are grouped in pairs (0,1), (2,3), ... that swap their trees,
    /// an odd trailing node is dropped
    Inverted,
}

/// Ordered list of hostnames taking part in a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeList(Vec<String>);

impl FromStr for NodeList {
    type Err = NodeError;

    /// parse a comma separated list, empty entries are skipped
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let nodes: Vec<String> = input
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(str::to_owned)
            .collect();

        Self::new(nodes)
    }
}

impl fmt::Display for NodeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl NodeList {
    pub fn new(nodes: Vec<String>) -> Result<Self, NodeError> {
        if nodes.is_empty() {
            Err(NodeError::Empty)
        } else {
            Ok(Self(nodes))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// fail with a precondition error when fewer than `required` nodes are present
    pub fn require(&self, required: usize) -> Result<&Self, NodeError> {
        if self.len() < required {
            Err(NodeError::TooFewNodes {
                required,
                actual: self.len(),
            })
        } else {
            Ok(self)
        }
    }

    pub fn index_of(&self, host: &str) -> Option<usize> {
        self.0.iter().position(|node| node == host)
    }

    /// partner(i) = nodes[(i - 1) mod N]
    pub fn partner(&self, index: usize) -> &str {
        let len = self.len();

        &self.0[(index % len + len - 1) % len]
    }

    /// partner of `host`, used by a worker to find the tree it should touch
    pub fn partner_of(&self, host: &str) -> Result<&str, NodeError> {
        self.index_of(host)
            .map(|index| self.partner(index))
            .ok_or_else(|| NodeError::UnknownHost(host.to_owned()))
    }

    /// partner of `host` under `strategy`
    pub fn partner_under(&self, host: &str, strategy: PairingStrategy) -> Result<&str, NodeError> {
        let index = self
            .index_of(host)
            .ok_or_else(|| NodeError::UnknownHost(host.to_owned()))?;

        match self.sources(strategy)[index] {
            Some(source) => Ok(self.0[source].as_str()),
            None => Err(NodeError::Unpaired(host.to_owned())),
        }
    }

    /// Drop the last node if the list has an odd length.
    /// Returns the shortened list and the dropped node, if any.
    pub fn even(&self) -> (NodeList, Option<String>) {
        let mut nodes = self.0.clone();

        let dropped = if nodes.len() % 2 == 1 {
            nodes.pop()
        } else {
            None
        };

        if let Some(ref node) = dropped {
            debug!(node = %node, "Dropped node to get an even node count");
        }

        (Self(nodes), dropped)
    }

    /// For every node the index of the node whose data it receives under `strategy`.
    /// With `Inverted` the list must already be even, a trailing odd node maps to nothing.
    pub fn sources(&self, strategy: PairingStrategy) -> Vec<Option<usize>> {
        let len = self.len();

        match strategy {
            PairingStrategy::Previous => (0..len).map(|i| Some((i + len - 1) % len)).collect(),
            PairingStrategy::Inverted => (0..len)
                .map(|i| {
                    if i % 2 == 1 {
                        Some(i - 1)
                    } else if i + 1 < len {
                        Some(i + 1)
                    } else {
                        None
                    }
                })
                .collect(),
        }
    }

    /// (node, partner) assignment under `strategy`
    pub fn assignment(&self, strategy: PairingStrategy) -> Vec<(&str, &str)> {
        self.sources(strategy)
            .into_iter()
            .enumerate()
            .filter_map(|(index, source)| {
                source.map(|source| (self.0[index].as_str(), self.0[source].as_str()))
            })
            .collect()
    }
}
