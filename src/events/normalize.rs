//! Argument normalisers
//!
//! Each normaliser reads the raw arguments and returns typed replacements for
//! the fields it knows. Values that are already in canonical form pass through
//! unchanged, which keeps normalisation idempotent.

use crate::tx::Params;

use ethers::types::{Address, U256};
use ethers::utils::to_checksum;
use serde_json::Value;
use std::str::FromStr;

const ADDRESS_FIELDS: &[&str] = &[
    "user",
    "_user",
    "agent",
    "creator",
    "staker",
    "escalator",
    "recipient",
    "voter",
    "buyer",
];

/// Raw arguments with every normaliser's output merged over them
pub fn normalize_values(raw: &Params) -> Params {
    let mut values = raw.clone();
    for normalized in [
        role_values(raw),
        extension_values(raw),
        address_values(raw),
        motion_values(raw),
        storage_slot_values(raw),
        whitelist_values(raw),
    ] {
        values.extend(normalized);
    }
    values
}

fn present<'a>(raw: &'a Params, field: &str) -> Option<&'a Value> {
    raw.get(field).filter(|value| !value.is_null())
}

fn as_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .map(Value::from),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) => Some(Value::Bool(s == "true")),
        _ => None,
    }
}

fn as_u256(value: &Value) -> Option<U256> {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) if s.starts_with("0x") => U256::from_str_radix(&s[2..], 16).ok(),
        Value::String(s) => U256::from_dec_str(s).ok(),
        _ => None,
    }
}

fn coerce_fields(raw: &Params, fields: &[&str], coerce: fn(&Value) -> Option<Value>) -> Params {
    fields
        .iter()
        .filter_map(|field| {
            let value = coerce(present(raw, field)?)?;
            Some((field.to_string(), value))
        })
        .collect()
}

/// `domainId` and `role` to integers, `setTo` to a boolean
fn role_values(raw: &Params) -> Params {
    let mut values = coerce_fields(raw, &["domainId", "role"], as_integer);
    values.extend(coerce_fields(raw, &["setTo"], as_flag));
    values
}

fn extension_values(raw: &Params) -> Params {
    coerce_fields(raw, &["version"], as_integer)
}

/// Known address fields to EIP-55 checksum form
fn address_values(raw: &Params) -> Params {
    coerce_fields(raw, ADDRESS_FIELDS, |value| {
        let address = Address::from_str(value.as_str()?).ok()?;
        Some(Value::String(to_checksum(&address, None)))
    })
}

/// `amount` becomes `stakeAmount`, `vote` an integer
fn motion_values(raw: &Params) -> Params {
    let mut values = Params::new();
    if let Some(amount) = present(raw, "amount").and_then(as_u256) {
        values.insert("stakeAmount".to_string(), Value::String(amount.to_string()));
    }
    values.extend(coerce_fields(raw, &["vote"], as_integer));
    values
}

/// `slot` to even-length `0x` hex
fn storage_slot_values(raw: &Params) -> Params {
    coerce_fields(raw, &["slot"], |value| {
        let slot = as_u256(value)?;
        let mut digits = format!("{:x}", slot);
        if digits.len() % 2 == 1 {
            digits.insert(0, '0');
        }
        Some(Value::String(format!("0x{}", digits)))
    })
}

fn whitelist_values(raw: &Params) -> Params {
    coerce_fields(raw, &["_status"], as_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_role_fields() {
        let values = normalize_values(&params(json!({
            "domainId": "2",
            "role": "6",
            "setTo": "true",
            "extra": "kept",
        })));
        assert_eq!(values["domainId"], json!(2));
        assert_eq!(values["role"], json!(6));
        assert_eq!(values["setTo"], json!(true));
        assert_eq!(values["extra"], json!("kept"));

        let values = normalize_values(&params(json!({ "setTo": "false" })));
        assert_eq!(values["setTo"], json!(false));
    }

    #[test]
    fn test_addresses_are_checksummed() {
        let values = normalize_values(&params(json!({
            "agent": "0xb8db6ac1ce3e1d2a0e1a6fd82dc0ab2aa4d5d7a4",
            "user": "not an address",
        })));
        assert_eq!(
            values["agent"],
            json!("0xb8dB6ac1cE3e1d2a0e1a6FD82Dc0Ab2AA4d5D7a4")
        );
        assert_eq!(values["user"], json!("not an address"));
    }

    #[test]
    fn test_motion_fields() {
        let values = normalize_values(&params(json!({
            "amount": "115792089237316195423570985008687907853269984665640564039457584007913129639935",
            "vote": "1",
        })));
        assert_eq!(
            values["stakeAmount"],
            json!("115792089237316195423570985008687907853269984665640564039457584007913129639935")
        );
        assert_eq!(values["vote"], json!(1));
        assert!(values.contains_key("amount"));
    }

    #[test]
    fn test_storage_slot_to_hex() {
        assert_eq!(
            normalize_values(&params(json!({ "slot": "5" })))["slot"],
            json!("0x05")
        );
        assert_eq!(
            normalize_values(&params(json!({ "slot": "256" })))["slot"],
            json!("0x0100")
        );
        assert_eq!(
            normalize_values(&params(json!({ "slot": "0x0100" })))["slot"],
            json!("0x0100")
        );
    }

    #[test]
    fn test_whitelist_status_and_version() {
        let values = normalize_values(&params(json!({ "_status": "true", "version": "3" })));
        assert_eq!(values["_status"], json!(true));
        assert_eq!(values["version"], json!(3));
    }

    #[test]
    fn test_uncoercible_values_left_raw() {
        let values = normalize_values(&params(json!({ "domainId": "root", "vote": null })));
        assert_eq!(values["domainId"], json!("root"));
        assert_eq!(values["vote"], Value::Null);
        assert!(!values.contains_key("stakeAmount"));
    }

    #[test]
    fn test_normalising_twice_changes_nothing() {
        let once = normalize_values(&params(json!({
            "domainId": "1",
            "setTo": "true",
            "agent": "0xb8db6ac1ce3e1d2a0e1a6fd82dc0ab2aa4d5d7a4",
            "amount": "1000",
            "slot": "7",
            "_status": "false",
        })));
        assert_eq!(normalize_values(&once), once);
    }
}
