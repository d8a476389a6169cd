//! Colony creation batch
//!
//! Creates every step up front, held where it needs data from an earlier
//! step, then feeds receipts and event data forward one step at a time:
//!
//! ```text
//! createToken -> createColony -> createLabel
//!             -> deployTokenAuthority -> setTokenAuthority
//!             -> deployOneTx -> setOneTxRole
//! ```

use super::normalize_colony_name;
use crate::actions::{Action, ActionType, SucceededPayload};
use crate::chain::abi::parse_address;
use crate::chain::ContractClient;
use crate::coordination::{Dispatcher, GroupCoordinator};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::{ContractContext, Params, TxConfig};

use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

pub const CREATE_COLONY_KEY: &str = "transaction.batch.createColony";

const CREATE_TOKEN: &str = "createToken";
const CREATE_COLONY: &str = "createColony";
const CREATE_LABEL: &str = "createLabel";
const DEPLOY_TOKEN_AUTHORITY: &str = "deployTokenAuthority";
const SET_TOKEN_AUTHORITY: &str = "setTokenAuthority";
const DEPLOY_ONE_TX: &str = "deployOneTx";
const SET_ONE_TX_ROLE: &str = "setOneTxRole";

const ONE_TX_EXTENSION: &str = "OneTxPayment";
const TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenChoice {
    /// Deploy a new token for the colony
    Create,
    /// Use an existing token
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateColonyRequest {
    pub colony_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub token_choice: TokenChoice,
    /// Required when selecting an existing token
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub token_symbol: Option<String>,
    /// Metadata location registered with the colony label
    #[serde(default)]
    pub metadata_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColonyCreated {
    pub group_id: String,
    pub colony_name: String,
    pub colony_address: Address,
    pub token_address: Address,
    pub one_tx_address: Address,
}

/// Everything that has been checked before a single step is dispatched
struct ColonyPlan {
    colony_name: String,
    token: TokenPlan,
    metadata_path: String,
}

enum TokenPlan {
    Create { name: String, symbol: String },
    Existing(Address),
}

impl ColonyPlan {
    fn from_request(request: &CreateColonyRequest) -> CoordinatorResult<Self> {
        let colony_name = normalize_colony_name(&request.colony_name)?;

        let token = match request.token_choice {
            TokenChoice::Create => {
                let name = request.token_name.clone().filter(|n| !n.trim().is_empty());
                let symbol = request.token_symbol.clone().filter(|s| !s.trim().is_empty());
                match (name, symbol) {
                    (Some(name), Some(symbol)) => TokenPlan::Create { name, symbol },
                    _ => {
                        return Err(CoordinatorError::InvalidRequest(
                            "Token name and symbol are required to create a token".to_string(),
                        ))
                    }
                }
            }
            TokenChoice::Select => match request.token_address.as_deref() {
                Some(address) if !address.is_empty() => TokenPlan::Existing(parse_address(address)?),
                _ => {
                    return Err(CoordinatorError::InvalidRequest(
                        "Token address not provided".to_string(),
                    ))
                }
            },
        };

        Ok(Self {
            colony_name,
            token,
            metadata_path: request.metadata_path.clone().unwrap_or_default(),
        })
    }

    fn creates_token(&self) -> bool {
        matches!(self.token, TokenPlan::Create { .. })
    }

    fn step_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.creates_token() {
            names.push(CREATE_TOKEN);
        }
        names.extend([CREATE_COLONY, CREATE_LABEL]);
        if self.creates_token() {
            names.extend([DEPLOY_TOKEN_AUTHORITY, SET_TOKEN_AUTHORITY]);
        }
        names.extend([DEPLOY_ONE_TX, SET_ONE_TX_ROLE]);
        names
    }
}

fn params(entries: &[(&str, Value)]) -> Params {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn checksum(address: &Address) -> Value {
    Value::String(to_checksum(address, None))
}

/// Run the colony creation batch under `group_id`.
///
/// Emits `COLONY_CREATE_SUCCESS` once every step exists and again with the
/// created addresses at the end, or a single `COLONY_CREATE_ERROR`. The
/// group's channels are closed whatever the outcome.
pub async fn create_colony(
    dispatcher: Dispatcher,
    client: Arc<dyn ContractClient>,
    group_id: String,
    request: CreateColonyRequest,
) -> CoordinatorResult<ColonyCreated> {
    let plan = match ColonyPlan::from_request(&request) {
        Ok(plan) => plan,
        Err(e) => {
            report_failure(&dispatcher, &group_id, &e);
            return Err(e);
        }
    };

    let mut group = GroupCoordinator::create_channels(
        dispatcher.clone(),
        CREATE_COLONY_KEY,
        group_id.clone(),
        &plan.step_names(),
    );

    let result = run_steps(&mut group, client.as_ref(), &plan).await;
    group.close();

    match result {
        Ok(created) => {
            crate::metrics::record_group_completed(true);
            info!(
                "Colony {} created at {:?} (group {})",
                created.colony_name, created.colony_address, group_id
            );
            dispatcher.dispatch(
                Action::new(
                    ActionType::ColonyCreateSuccess,
                    group_id,
                    json!({
                        "colonyName": created.colony_name,
                        "colonyAddress": checksum(&created.colony_address),
                        "tokenAddress": checksum(&created.token_address),
                        "oneTxAddress": checksum(&created.one_tx_address),
                    }),
                )
                .with_key(CREATE_COLONY_KEY),
            )?;
            Ok(created)
        }
        Err(e) => {
            crate::metrics::record_group_completed(false);
            report_failure(&dispatcher, &group_id, &e);
            Err(e)
        }
    }
}

fn report_failure(dispatcher: &Dispatcher, group_id: &str, err: &CoordinatorError) {
    error!("Colony creation {} failed: {}", group_id, err);
    let action = Action::failure(ActionType::ColonyCreateError, group_id, err).with_key(CREATE_COLONY_KEY);
    if let Err(e) = dispatcher.dispatch(action) {
        error!("Could not report colony creation failure: {}", e);
    }
}

async fn run_steps(
    group: &mut GroupCoordinator,
    client: &dyn ContractClient,
    plan: &ColonyPlan,
) -> CoordinatorResult<ColonyCreated> {
    create_steps(group, plan)?;
    group.wait_all_created().await?;

    group.dispatcher().dispatch(
        Action::new(
            ActionType::ColonyCreateSuccess,
            group.group_id(),
            json!({ "steps": group.step_names() }),
        )
        .with_key(CREATE_COLONY_KEY),
    )?;

    let token_address = match &plan.token {
        TokenPlan::Create { .. } => {
            let created = group.wait_for(CREATE_TOKEN, ActionType::TransactionSucceeded).await?;
            deployed_address(&created, CREATE_TOKEN)?
        }
        TokenPlan::Existing(address) => *address,
    };

    group.add_params(CREATE_COLONY, params(&[("tokenAddress", checksum(&token_address))]))?;
    group.ready(CREATE_COLONY)?;
    let created = group.wait_for(CREATE_COLONY, ActionType::TransactionSucceeded).await?;
    let colony_address = colony_address_of(&created)?;
    let colony = to_checksum(&colony_address, None);

    group.add_params(
        CREATE_LABEL,
        params(&[("orbitDBPath", Value::String(plan.metadata_path.clone()))]),
    )?;
    for name in [CREATE_LABEL, DEPLOY_ONE_TX, SET_ONE_TX_ROLE] {
        group.add_identifier(name, colony.clone())?;
    }
    if plan.creates_token() {
        let token = to_checksum(&token_address, None);
        for name in [DEPLOY_TOKEN_AUTHORITY, SET_TOKEN_AUTHORITY] {
            group.add_identifier(name, token.clone())?;
        }
    }

    group.ready(CREATE_LABEL)?;
    group.wait_for(CREATE_LABEL, ActionType::TransactionSucceeded).await?;

    if plan.creates_token() {
        group.add_params(
            DEPLOY_TOKEN_AUTHORITY,
            params(&[
                ("colonyAddress", checksum(&colony_address)),
                ("tokenAddress", checksum(&token_address)),
            ]),
        )?;
        group.ready(DEPLOY_TOKEN_AUTHORITY)?;
        let deployed = group
            .wait_for(DEPLOY_TOKEN_AUTHORITY, ActionType::TransactionSucceeded)
            .await?;
        let authority = deployed_address(&deployed, DEPLOY_TOKEN_AUTHORITY)?;

        group.add_params(SET_TOKEN_AUTHORITY, params(&[("authority", checksum(&authority))]))?;
        group.ready(SET_TOKEN_AUTHORITY)?;
        group.wait_for(SET_TOKEN_AUTHORITY, ActionType::TransactionSucceeded).await?;
    }

    group.ready(DEPLOY_ONE_TX)?;
    group.wait_for(DEPLOY_ONE_TX, ActionType::TransactionSucceeded).await?;

    let one_tx_address = extension_address(client, &colony, ONE_TX_EXTENSION).await?;
    group.add_params(SET_ONE_TX_ROLE, params(&[("address", checksum(&one_tx_address))]))?;
    group.ready(SET_ONE_TX_ROLE)?;
    group.wait_for(SET_ONE_TX_ROLE, ActionType::TransactionSucceeded).await?;

    Ok(ColonyCreated {
        group_id: group.group_id().to_string(),
        colony_name: plan.colony_name.clone(),
        colony_address,
        token_address,
        one_tx_address,
    })
}

fn create_steps(group: &GroupCoordinator, plan: &ColonyPlan) -> CoordinatorResult<()> {
    if let TokenPlan::Create { name, symbol } = &plan.token {
        group.create_transaction(
            CREATE_TOKEN,
            TxConfig::new(ContractContext::Network, "createToken")
                .with_param("name", name.clone())
                .with_param("symbol", symbol.clone())
                .with_param("decimals", TOKEN_DECIMALS),
        )?;
    }

    group.create_transaction(
        CREATE_COLONY,
        TxConfig::new(ContractContext::Network, "createColony").not_ready(),
    )?;
    group.create_transaction(
        CREATE_LABEL,
        TxConfig::new(ContractContext::Colony, "registerColonyLabel")
            .with_param("colonyName", plan.colony_name.clone())
            .not_ready(),
    )?;

    if plan.creates_token() {
        group.create_transaction(
            DEPLOY_TOKEN_AUTHORITY,
            TxConfig::new(ContractContext::Token, "createTokenAuthority")
                .with_param("allowedToTransfer", Value::Array(Vec::new()))
                .not_ready(),
        )?;
        group.create_transaction(
            SET_TOKEN_AUTHORITY,
            TxConfig::new(ContractContext::Token, "setAuthority").not_ready(),
        )?;
    }

    group.create_transaction(
        DEPLOY_ONE_TX,
        TxConfig::new(ContractContext::Colony, "addExtension")
            .with_param("contractName", ONE_TX_EXTENSION)
            .not_ready(),
    )?;
    group.create_transaction(
        SET_ONE_TX_ROLE,
        TxConfig::new(ContractContext::Colony, "setRootRole")
            .with_method_context("setOneTxRole")
            .with_param("setTo", true)
            .not_ready(),
    )?;

    Ok(())
}

/// Contract created by a deployment step
fn deployed_address(action: &Action, step: &str) -> CoordinatorResult<Address> {
    action
        .transaction()
        .and_then(|record| record.receipt)
        .and_then(|receipt| receipt.contract_address)
        .ok_or_else(|| {
            CoordinatorError::Coordination(format!("Missing contract address from {}", step))
        })
}

fn colony_address_of(action: &Action) -> CoordinatorResult<Address> {
    let payload: SucceededPayload = action.payload_as()?;

    match payload.event_data.get("colonyAddress").and_then(Value::as_str) {
        Some(address) => parse_address(address),
        None => Err(CoordinatorError::Coordination(
            "Missing colony address".to_string(),
        )),
    }
}

async fn extension_address(
    client: &dyn ContractClient,
    colony: &str,
    extension: &str,
) -> CoordinatorResult<Address> {
    let output = client
        .call(
            ContractContext::Colony,
            Some(colony.to_string()),
            "getExtensionAddress",
            params(&[("contractName", json!(extension))]),
        )
        .await?;

    match output.first().and_then(Value::as_str) {
        Some(address) => parse_address(address),
        None => Err(CoordinatorError::Contract(format!(
            "No {} extension address for colony {}",
            extension, colony
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockContractClient, TransactionOutcome};
    use crate::config::CoordinatorConfig;
    use crate::coordination::CoordinationEngine;
    use crate::tx::{ReceiptSummary, TransactionStatus};
    use ethers::types::{H256, U256};
    use tokio::sync::broadcast;

    const COLONY: u64 = 0xc0;
    const TOKEN: u64 = 0x70;
    const AUTHORITY: u64 = 0xa0;
    const ONE_TX: u64 = 0x01;

    fn address(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn start(client: MockContractClient) -> (Arc<CoordinationEngine>, Arc<dyn ContractClient>) {
        let client: Arc<dyn ContractClient> = Arc::new(client);
        let engine = Arc::new(CoordinationEngine::new(
            client.clone(),
            None,
            CoordinatorConfig::for_tests(),
        ));
        let runner = engine.clone();
        tokio::spawn(async move { runner.run().await });
        (engine, client)
    }

    /// Client that mines every transaction, deploying contracts where a step
    /// creates one
    fn chain(revert: Option<&'static str>) -> MockContractClient {
        let mut client = MockContractClient::new();
        client.expect_health_check().returning(|| true);
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(1_000_000_000u64)));
        client.expect_pending_nonce().returning(|| Ok(0));
        client.expect_send().returning(|_, _| Ok(H256::repeat_byte(7)));
        client.expect_transaction_receipt().returning(move |tx, hash| {
            let contract_address = match tx.method_name.as_str() {
                "createToken" => Some(address(TOKEN)),
                "createTokenAuthority" => Some(address(AUTHORITY)),
                _ => None,
            };
            let mut event_data = Params::new();
            if tx.method_name == "createColony" {
                event_data.insert(
                    "colonyAddress".to_string(),
                    json!(to_checksum(&address(COLONY), None)),
                );
            }
            let reverted = revert == Some(tx.method_name.as_str());
            Ok(Some(TransactionOutcome {
                receipt: ReceiptSummary {
                    transaction_hash: hash,
                    block_number: Some(10),
                    contract_address,
                    gas_used: Some(U256::from(50_000)),
                    status: Some(if reverted { 0 } else { 1 }),
                },
                event_data,
            }))
        });
        client.expect_call().returning(|_, identifier, method, _| {
            assert_eq!(method, "getExtensionAddress");
            assert_eq!(identifier, Some(to_checksum(&address(COLONY), None)));
            Ok(vec![json!(to_checksum(&address(ONE_TX), None))])
        });
        client
    }

    fn request(token_choice: TokenChoice) -> CreateColonyRequest {
        CreateColonyRequest {
            colony_name: "MyColony".to_string(),
            display_name: Some("My Colony".to_string()),
            token_choice,
            token_address: None,
            token_name: Some("Colony Token".to_string()),
            token_symbol: Some("CLNY".to_string()),
            metadata_path: Some("/orbitdb/colony".to_string()),
        }
    }

    async fn next_of(bus: &mut broadcast::Receiver<Action>, action_type: ActionType) -> Action {
        loop {
            let action = bus.recv().await.unwrap();
            if action.action_type == action_type {
                return action;
            }
        }
    }

    #[tokio::test]
    async fn test_create_colony_with_new_token() {
        let (engine, client) = start(chain(None));
        let mut bus = engine.subscribe();

        let created = create_colony(
            engine.dispatcher(),
            client,
            "group-1".to_string(),
            request(TokenChoice::Create),
        )
        .await
        .unwrap();

        assert_eq!(created.colony_name, "mycolony");
        assert_eq!(created.colony_address, address(COLONY));
        assert_eq!(created.token_address, address(TOKEN));
        assert_eq!(created.one_tx_address, address(ONE_TX));

        let steps = engine.registry().group("group-1").await;
        let names: Vec<_> = steps.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "group-1-createToken",
                "group-1-createColony",
                "group-1-createLabel",
                "group-1-deployTokenAuthority",
                "group-1-setTokenAuthority",
                "group-1-deployOneTx",
                "group-1-setOneTxRole",
            ]
        );
        assert!(steps.iter().all(|r| r.status == TransactionStatus::Succeeded));

        let colony = to_checksum(&address(COLONY), None);
        let token = to_checksum(&address(TOKEN), None);
        assert_eq!(steps[1].params["tokenAddress"], json!(token));
        assert_eq!(steps[2].params["colonyName"], json!("mycolony"));
        assert_eq!(steps[2].params["orbitDBPath"], json!("/orbitdb/colony"));
        assert_eq!(steps[2].identifier.as_deref(), Some(colony.as_str()));
        assert_eq!(steps[3].identifier.as_deref(), Some(token.as_str()));
        assert_eq!(steps[3].params["colonyAddress"], json!(colony));
        assert_eq!(
            steps[4].params["authority"],
            json!(to_checksum(&address(AUTHORITY), None))
        );
        assert_eq!(
            steps[6].params["address"],
            json!(to_checksum(&address(ONE_TX), None))
        );
        assert_eq!(steps[6].params["setTo"], json!(true));

        // Once when every step exists, once on completion
        let first = next_of(&mut bus, ActionType::ColonyCreateSuccess).await;
        assert_eq!(first.id(), "group-1");
        assert_eq!(first.meta.key.as_deref(), Some(CREATE_COLONY_KEY));
        let last = next_of(&mut bus, ActionType::ColonyCreateSuccess).await;
        assert_eq!(last.payload["colonyAddress"], json!(colony));

        assert_eq!(engine.dispatcher().channels().open_count(), 0);
        engine.stop();
    }

    #[tokio::test]
    async fn test_create_colony_with_existing_token() {
        let (engine, client) = start(chain(None));
        let mut select = request(TokenChoice::Select);
        select.token_address = Some(to_checksum(&address(TOKEN), None));

        let created = create_colony(engine.dispatcher(), client, "group-2".to_string(), select)
            .await
            .unwrap();
        assert_eq!(created.token_address, address(TOKEN));

        let steps = engine.registry().group("group-2").await;
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].id, "group-2-createColony");
        engine.stop();
    }

    #[tokio::test]
    async fn test_missing_token_address_fails_before_any_step() {
        let mut client = MockContractClient::new();
        client.expect_health_check().returning(|| true);
        client.expect_send().never();
        let (engine, client) = start(client);
        let mut bus = engine.subscribe();

        let result = create_colony(
            engine.dispatcher(),
            client,
            "group-3".to_string(),
            request(TokenChoice::Select),
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRequest(_))));

        let failure = next_of(&mut bus, ActionType::ColonyCreateError).await;
        assert!(failure.error);
        assert!(engine.registry().group("group-3").await.is_empty());
        engine.stop();
    }

    #[tokio::test]
    async fn test_failed_step_fails_colony_and_closes_channels() {
        let (engine, client) = start(chain(Some("createColony")));
        let mut bus = engine.subscribe();

        let result = create_colony(
            engine.dispatcher(),
            client,
            "group-4".to_string(),
            request(TokenChoice::Create),
        )
        .await;
        match result {
            Err(CoordinatorError::GroupFailed { group_id, key, .. }) => {
                assert_eq!(group_id, "group-4");
                assert_eq!(key, CREATE_COLONY_KEY);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let failure = next_of(&mut bus, ActionType::ColonyCreateError).await;
        assert_eq!(failure.id(), "group-4");

        // The token step already succeeded and stays that way
        let token = engine.registry().get("group-4-createToken").await.unwrap();
        assert_eq!(token.status, TransactionStatus::Succeeded);
        let label = engine.registry().get("group-4-createLabel").await.unwrap();
        assert_eq!(label.status, TransactionStatus::Created);

        assert_eq!(engine.dispatcher().channels().open_count(), 0);
        engine.stop();
    }
}
