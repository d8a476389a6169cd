//! Event parsing and ordering
//!
//! Subgraph-sourced and node-sourced logs are normalised into one
//! `NormalizedEvent` shape with typed argument values and a sortable
//! block-relative index.

mod normalize;
mod parser;

pub use normalize::normalize_values;
pub use parser::{
    event_data, most_recent_annotation, normalize, parse_log, parse_subgraph_event, topic_id,
};

use crate::tx::Params;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Width of the zero-padded log position inside an index
pub const LOG_POSITION_WIDTH: usize = 7;

/// Event as returned by the subgraph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphEvent {
    /// Subgraph entity id, ending in `event_<position>`
    #[serde(default)]
    pub id: Option<String>,
    /// Event name, usually with its signature suffix
    pub name: String,
    /// JSON-encoded argument object
    pub args: String,
    pub address: String,
    /// Seconds since the epoch
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub transaction: Option<SubgraphTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphTransaction {
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub block: Option<SubgraphBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphBlock {
    /// `block_<n>`
    #[serde(default)]
    pub number: Option<String>,
}

/// Canonical event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub name: String,
    pub signature: String,
    /// Keccak-256 of the signature, `0x`-prefixed
    pub topic: String,
    pub address: String,
    pub values: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Block number followed by the 7-digit log position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl NormalizedEvent {
    pub fn event_index(&self) -> Option<EventIndex> {
        self.index.as_deref().and_then(EventIndex::parse)
    }
}

/// Position of a log in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventIndex {
    pub block: u64,
    pub position: u64,
}

impl EventIndex {
    pub fn new(block: u64, position: u64) -> Self {
        Self { block, position }
    }

    /// Parse `"{block}{position:07}"`
    pub fn parse(index: &str) -> Option<Self> {
        if index.len() <= LOG_POSITION_WIDTH || !index.is_ascii() {
            return None;
        }
        let (block, position) = index.split_at(index.len() - LOG_POSITION_WIDTH);
        Some(Self {
            block: block.parse().ok()?,
            position: position.parse().ok()?,
        })
    }

    /// Build the index from a block number and the raw position text
    pub fn format(block: u64, position: &str) -> String {
        format!("{}{:0>width$}", block, position, width = LOG_POSITION_WIDTH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Order two events by index. Unindexed events go last either way.
pub fn compare_by_index(a: &NormalizedEvent, b: &NormalizedEvent, direction: SortDirection) -> Ordering {
    match (a.event_index(), b.event_index()) {
        (Some(a), Some(b)) => match direction {
            SortDirection::Asc => a.cmp(&b),
            SortDirection::Desc => b.cmp(&a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort by index
pub fn sort_events(events: &mut [NormalizedEvent], direction: SortDirection) {
    events.sort_by(|a, b| compare_by_index(a, b, direction));
}
