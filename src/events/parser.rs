//! Event parsing for subgraph entities and node logs

use super::normalize::normalize_values;
use super::{sort_events, EventIndex, NormalizedEvent, SortDirection, SubgraphEvent};
use crate::chain::AbiRegistry;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::Params;

use ethers::types::Log;
use serde_json::Value;
use sha3::{Digest, Keccak256};
use tracing::trace;

const EVENT_ID_MARKER: &str = "event_";
const BLOCK_PREFIX: &str = "block_";

/// `0x`-prefixed Keccak-256 of an event signature
pub fn topic_id(signature: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Seconds to milliseconds; out of range timestamps are dropped
fn to_millis(seconds: u64) -> Option<u64> {
    seconds.checked_mul(1000)
}

/// Merge the values of decoded events into one parameter map; later events
/// win on name clashes
pub fn event_data(events: &[NormalizedEvent]) -> Params {
    let mut data = Params::new();
    for event in events {
        for (name, value) in &event.values {
            data.insert(name.clone(), value.clone());
        }
    }
    data
}

/// Convert a subgraph event into the canonical record
pub fn parse_subgraph_event(event: &SubgraphEvent) -> CoordinatorResult<NormalizedEvent> {
    let raw: Params = serde_json::from_str(&event.args).map_err(|e| {
        CoordinatorError::EventParsing(format!("Invalid args for {}: {}", event.name, e))
    })?;

    let name = match event.name.split_once('(') {
        Some((name, _)) => name.to_string(),
        None => event.name.clone(),
    };

    let block_number = event
        .transaction
        .as_ref()
        .and_then(|tx| tx.block.as_ref())
        .and_then(|block| block.number.as_deref())
        .and_then(|number| number.trim_start_matches(BLOCK_PREFIX).parse::<u64>().ok());

    let timestamp = event
        .timestamp
        .as_deref()
        .and_then(|seconds| seconds.parse::<u64>().ok())
        .and_then(to_millis);

    let hash = event
        .transaction
        .as_ref()
        .and_then(|tx| tx.transaction_hash.clone());

    let index = match (block_number, event.id.as_deref()) {
        (Some(block), Some(id)) => id
            .rfind(EVENT_ID_MARKER)
            .map(|at| &id[at + EVENT_ID_MARKER.len()..])
            .filter(|position| !position.is_empty() && position.chars().all(|c| c.is_ascii_digit()))
            .map(|position| EventIndex::format(block, position)),
        _ => None,
    };

    trace!("Parsed subgraph event {} at {:?}", name, index);

    Ok(NormalizedEvent {
        signature: event.name.clone(),
        topic: topic_id(&event.name),
        name,
        address: event.address.clone(),
        values: normalize_values(&raw),
        block_number,
        timestamp,
        hash,
        index,
    })
}

/// Re-run value normalisation on an already parsed event
pub fn normalize(event: &NormalizedEvent) -> NormalizedEvent {
    NormalizedEvent {
        values: normalize_values(&event.values),
        ..event.clone()
    }
}

/// Decode a node log into the canonical record. Returns `None` for logs no
/// registered ABI knows.
pub fn parse_log(abis: &AbiRegistry, log: &Log, timestamp: Option<u64>) -> Option<NormalizedEvent> {
    let decoded = abis.decode_log(log)?;
    let block_number = log.block_number.map(|n| n.as_u64());
    let index = match (block_number, log.log_index) {
        (Some(block), Some(position)) => Some(EventIndex::format(block, &position.to_string())),
        _ => None,
    };

    crate::metrics::record_event_normalized(&decoded.name, true);

    Some(NormalizedEvent {
        topic: topic_id(&decoded.signature),
        name: decoded.name,
        signature: decoded.signature,
        address: ethers::utils::to_checksum(&log.address, None),
        values: normalize_values(&decoded.args),
        block_number,
        timestamp: timestamp.and_then(to_millis),
        hash: log.transaction_hash.map(|hash| format!("{:?}", hash)),
        index,
    })
}

fn matches_user(value: Option<&Value>, user: &str) -> bool {
    value
        .and_then(Value::as_str)
        .map_or(false, |address| address.eq_ignore_ascii_case(user))
}

/// Latest annotation made by `user`, who is either the agent or the address
/// of the annotation event
pub fn most_recent_annotation(
    events: Vec<NormalizedEvent>,
    user: &str,
) -> Option<NormalizedEvent> {
    let mut own: Vec<NormalizedEvent> = events
        .into_iter()
        .filter(|event| {
            matches_user(event.values.get("agent"), user)
                || matches_user(event.values.get("address"), user)
        })
        .collect();
    sort_events(&mut own, SortDirection::Desc);
    own.into_iter().next()
}
