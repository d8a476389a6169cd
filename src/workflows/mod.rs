//! Colony workflows built on grouped transactions
//!
//! - `colony_create`: the multi-step colony creation batch
//! - `name_check`: debounced, latest-wins colony name availability lookups

pub mod colony_create;
pub mod name_check;

pub use colony_create::{create_colony, ColonyCreated, CreateColonyRequest, TokenChoice, CREATE_COLONY_KEY};
pub use name_check::NameChecker;

use crate::error::{CoordinatorError, CoordinatorResult};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COLONY_NAME_PATTERN: Regex =
        Regex::new(r"^[\p{Ll}\p{Lo}\p{N}]+(-[\p{Ll}\p{Lo}\p{N}]+)*$").expect("valid colony name pattern");
}

/// Lowercase and validate a colony name as used in its ENS label
pub fn normalize_colony_name(name: &str) -> CoordinatorResult<String> {
    let normalized = name.trim().to_lowercase();
    if COLONY_NAME_PATTERN.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(CoordinatorError::InvalidRequest(format!(
            "Invalid colony name '{}'",
            name
        )))
    }
}
