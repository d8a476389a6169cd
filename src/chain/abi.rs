//! ABI registry: encodes method calls and decodes receipt logs per contract context

use crate::config::ContractConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::{ContractContext, Params};

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{Abi, Event, Function, ParamType, RawLog, Token};
use ethers::types::{Address, Bytes, Log, I256, H256};
use ethers::utils::to_checksum;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};

/// A log matched to its ABI event
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub name: String,
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`
    pub signature: String,
    pub args: Params,
}

/// ABIs and default addresses for every configured context
#[derive(Debug, Clone, Default)]
pub struct AbiRegistry {
    abis: HashMap<ContractContext, Abi>,
    addresses: HashMap<ContractContext, Address>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load ABI files named in the contracts configuration
    pub fn from_config(
        contracts: &HashMap<ContractContext, ContractConfig>,
    ) -> CoordinatorResult<Self> {
        let mut registry = Self::new();

        for (context, contract) in contracts {
            let raw = std::fs::read_to_string(&contract.abi_path).map_err(|e| {
                CoordinatorError::Config(format!(
                    "Failed to read ABI for {} at {:?}: {}",
                    context, contract.abi_path, e
                ))
            })?;
            let abi = parse_abi(&raw)
                .map_err(|e| CoordinatorError::Config(format!("Invalid ABI for {}: {}", context, e)))?;

            let address = match contract.address.as_deref() {
                Some(addr) if !addr.is_empty() => Some(parse_address(addr)?),
                _ => None,
            };

            debug!(
                "Loaded ABI for {} ({} functions, {} events)",
                context,
                abi.functions().count(),
                abi.events().count()
            );
            registry.register(*context, abi, address);
        }

        Ok(registry)
    }

    pub fn register(&mut self, context: ContractContext, abi: Abi, address: Option<Address>) {
        self.abis.insert(context, abi);
        if let Some(address) = address {
            self.addresses.insert(context, address);
        }
    }

    pub fn abi(&self, context: ContractContext) -> CoordinatorResult<&Abi> {
        self.abis
            .get(&context)
            .ok_or_else(|| CoordinatorError::Config(format!("No ABI configured for {}", context)))
    }

    /// Record identifier first, then the context default
    pub fn resolve_address(
        &self,
        context: ContractContext,
        identifier: Option<&str>,
    ) -> CoordinatorResult<Address> {
        match identifier {
            Some(identifier) => parse_address(identifier),
            None => self.addresses.get(&context).copied().ok_or_else(|| {
                CoordinatorError::Contract(format!(
                    "No address for {}: supply an identifier",
                    context
                ))
            }),
        }
    }

    fn function(&self, context: ContractContext, method: &str) -> CoordinatorResult<&Function> {
        self.abi(context)?
            .function(method)
            .map_err(|e| CoordinatorError::Contract(format!("{}.{}: {}", context, method, e)))
    }

    /// Encode calldata. Inputs are matched to params by name (ignoring a
    /// leading underscore and case), leftovers by position.
    pub fn encode_call(
        &self,
        context: ContractContext,
        method: &str,
        params: &Params,
    ) -> CoordinatorResult<Bytes> {
        let function = self.function(context, method)?;
        let entries: Vec<(&String, &Value)> = params.iter().collect();
        let mut used = vec![false; entries.len()];

        let mut matched: Vec<Option<&Value>> = function
            .inputs
            .iter()
            .map(|input| {
                let wanted = param_key(&input.name);
                let position = entries
                    .iter()
                    .enumerate()
                    .position(|(i, (name, _))| !used[i] && param_key(name) == wanted)?;
                used[position] = true;
                Some(entries[position].1)
            })
            .collect();

        let mut leftovers = entries
            .iter()
            .enumerate()
            .filter(|(i, _)| !used[*i])
            .map(|(_, (_, value))| *value);
        for slot in matched.iter_mut().filter(|slot| slot.is_none()) {
            *slot = leftovers.next();
        }

        let tokens = function
            .inputs
            .iter()
            .zip(matched)
            .map(|(input, value)| {
                let value = value.ok_or_else(|| {
                    CoordinatorError::Contract(format!(
                        "{}.{}: missing parameter {}",
                        context, method, input.name
                    ))
                })?;
                tokenize(&input.kind, value).map_err(|e| {
                    CoordinatorError::Contract(format!(
                        "{}.{}: bad value for {}: {}",
                        context, method, input.name, e
                    ))
                })
            })
            .collect::<CoordinatorResult<Vec<_>>>()?;

        let data = function
            .encode_input(&tokens)
            .map_err(|e| CoordinatorError::Contract(format!("{}.{}: {}", context, method, e)))?;

        Ok(Bytes::from(data))
    }

    /// Decode return data of a read-only call
    pub fn decode_output(
        &self,
        context: ContractContext,
        method: &str,
        data: &[u8],
    ) -> CoordinatorResult<Vec<Value>> {
        let function = self.function(context, method)?;
        let tokens = function
            .decode_output(data)
            .map_err(|e| CoordinatorError::Contract(format!("{}.{}: {}", context, method, e)))?;
        Ok(tokens.into_iter().map(token_to_json).collect())
    }

    fn find_event(&self, topic: &H256) -> Option<&Event> {
        self.abis
            .values()
            .flat_map(|abi| abi.events())
            .find(|event| !event.anonymous && event.signature() == *topic)
    }

    /// Decode one log against every registered ABI
    pub fn decode_log(&self, log: &Log) -> Option<DecodedLog> {
        let topic = log.topics.first()?;
        let event = self.find_event(topic)?;

        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };

        match event.parse_log(raw) {
            Ok(parsed) => Some(DecodedLog {
                name: event.name.clone(),
                signature: event_signature(event),
                args: parsed
                    .params
                    .into_iter()
                    .map(|param| (param.name, token_to_json(param.value)))
                    .collect(),
            }),
            Err(e) => {
                warn!("Failed to decode {} log: {}", event.name, e);
                None
            }
        }
    }

    /// Whether any registered ABI declares an event with this name
    pub fn knows_event(&self, name: &str) -> bool {
        self.abis.values().any(|abi| abi.event(name).is_ok())
    }
}

fn event_signature(event: &Event) -> String {
    let kinds: Vec<String> = event.inputs.iter().map(|input| input.kind.to_string()).collect();
    format!("{}({})", event.name, kinds.join(","))
}

fn param_key(name: &str) -> String {
    name.trim_start_matches('_').to_lowercase()
}

/// Accept either a bare ABI array or a build artifact with an `abi` field
fn parse_abi(raw: &str) -> Result<Abi, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let abi = match value {
        Value::Object(mut artifact) if artifact.contains_key("abi") => {
            artifact.remove("abi").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(abi)
}

pub fn parse_address(value: &str) -> CoordinatorResult<Address> {
    Address::from_str(value)
        .map_err(|e| CoordinatorError::Contract(format!("Invalid address {}: {}", value, e)))
}

fn value_to_abi_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => format!(
            "[{}]",
            items
                .iter()
                .map(value_to_abi_string)
                .collect::<Vec<_>>()
                .join(",")
        ),
        other => other.to_string(),
    }
}

fn tokenize(kind: &ParamType, value: &Value) -> Result<Token, ethers::abi::Error> {
    LenientTokenizer::tokenize(kind, &value_to_abi_string(value))
}

/// Convert a decoded token into JSON the rest of the coordinator understands
pub fn token_to_json(token: Token) -> Value {
    match token {
        Token::Address(address) => Value::String(to_checksum(&address, None)),
        Token::Uint(value) => Value::String(value.to_string()),
        Token::Int(value) => Value::String(I256::from_raw(value).to_string()),
        Token::Bool(value) => Value::Bool(value),
        Token::String(value) => Value::String(value),
        Token::Bytes(bytes) | Token::FixedBytes(bytes) => {
            Value::String(format!("0x{}", hex::encode(bytes)))
        }
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_json).collect())
        }
    }
}
