//! Grouped transactions: one batch of named steps sharing a group id
//!
//! Steps are created in listed order with indices `0..N`. A step created
//! with `ready = false` is held until its params arrive and it is marked
//! ready, usually after an earlier step succeeded.

use super::engine::Dispatcher;
use crate::actions::{Action, ActionType};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::{Params, TransactionChannel, TransactionGroup, TransactionRecord, TxConfig, TxId};

use std::collections::HashMap;
use tracing::debug;

/// Channel and identity of one step
#[derive(Debug)]
pub struct GroupStep {
    pub id: TxId,
    pub index: usize,
    channel: TransactionChannel,
}

pub struct GroupCoordinator {
    dispatcher: Dispatcher,
    key: String,
    group_id: String,
    steps: HashMap<String, GroupStep>,
    /// Step names in creation order
    order: Vec<String>,
    closed: bool,
}

impl GroupCoordinator {
    /// Open a channel per step before anything is dispatched for them
    pub fn create_channels<S: AsRef<str>>(
        dispatcher: Dispatcher,
        key: impl Into<String>,
        group_id: impl Into<String>,
        names: &[S],
    ) -> Self {
        let group_id = group_id.into();
        let mut steps = HashMap::new();
        let mut order = Vec::new();

        for (index, name) in names.iter().enumerate() {
            let name = name.as_ref().to_string();
            let id = format!("{}-{}", group_id, name);
            let channel = dispatcher.open_channel(id.clone());
            steps.insert(name.clone(), GroupStep { id, index, channel });
            order.push(name);
        }

        crate::metrics::record_group_started();
        debug!("Opened {} channels for group {}", order.len(), group_id);

        Self {
            dispatcher,
            key: key.into(),
            group_id,
            steps,
            order,
            closed: false,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    fn step(&self, name: &str) -> CoordinatorResult<&GroupStep> {
        self.steps.get(name).ok_or_else(|| {
            CoordinatorError::Coordination(format!(
                "Group {} has no step {}",
                self.group_id, name
            ))
        })
    }

    pub fn id_of(&self, name: &str) -> CoordinatorResult<&str> {
        Ok(self.step(name)?.id.as_str())
    }

    /// Dispatch the creation of a step's transaction
    pub fn create_transaction(&self, name: &str, config: TxConfig) -> CoordinatorResult<TxId> {
        let step = self.step(name)?;
        let record = TransactionRecord::new(
            step.id.clone(),
            config,
            Some(TransactionGroup {
                key: self.key.clone(),
                id: self.group_id.clone(),
                index: step.index,
            }),
        );
        self.dispatcher.dispatch(Action::transaction_created(&record))?;
        Ok(step.id.clone())
    }

    pub fn add_params(&self, name: &str, params: Params) -> CoordinatorResult<()> {
        let id = self.id_of(name)?;
        self.dispatcher
            .dispatch(Action::transaction_add_params(id, params))
    }

    pub fn add_identifier(&self, name: &str, identifier: impl Into<String>) -> CoordinatorResult<()> {
        let id = self.id_of(name)?;
        self.dispatcher
            .dispatch(Action::transaction_add_identifier(id, identifier))
    }

    pub fn ready(&self, name: &str) -> CoordinatorResult<()> {
        let id = self.id_of(name)?;
        self.dispatcher.dispatch(Action::transaction_ready(id))
    }

    /// Wait for an action on a step's channel. A step failure becomes the
    /// failure of the whole group.
    pub async fn wait_for(&mut self, name: &str, action_type: ActionType) -> CoordinatorResult<Action> {
        let group_id = self.group_id.clone();
        let key = self.key.clone();
        let step = self.steps.get_mut(name).ok_or_else(|| {
            CoordinatorError::Coordination(format!("Group {} has no step {}", group_id, name))
        })?;

        step.channel
            .take_from(action_type)
            .await
            .map_err(|source| CoordinatorError::GroupFailed {
                group_id,
                key,
                source: Box::new(source),
            })
    }

    /// Wait until every step's record exists
    pub async fn wait_all_created(&mut self) -> CoordinatorResult<()> {
        for name in self.order.clone() {
            self.wait_for(&name, ActionType::TransactionCreated).await?;
        }
        Ok(())
    }

    /// Close every channel of the group
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for step in self.steps.values_mut() {
            self.dispatcher.close_channel(&step.id);
            step.channel.close();
        }
        self.closed = true;
        debug!("Closed channels of group {}", self.group_id);
    }
}

impl Drop for GroupCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}
