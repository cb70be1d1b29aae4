use crate::contract::Contract;
use crate::error::ContractError;
use crate::followup::FollowUp;
use crate::magic_link::MagicLinkRecord;
use crate::termination::TerminationRequest;
use crate::types::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Persistence seam for every aggregate the engine owns.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn load_subscription(&self, subscription_id: &str)
        -> Result<Option<Subscription>, ContractError>;

    async fn find_subscription_by_quote(
        &self,
        quote_uuid: &str,
    ) -> Result<Option<Subscription>, ContractError>;

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), ContractError>;

    async fn load_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError>;

    async fn find_contract_by_envelope(
        &self,
        envelope_id: &str,
    ) -> Result<Option<Contract>, ContractError>;

    async fn list_contracts(&self) -> Result<Vec<Contract>, ContractError>;

    /// Save a subscription and one of its contracts as one unit.
    async fn save_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<(), ContractError>;

    /// The open (unconfirmed) termination request for a contract, if any.
    async fn load_termination(
        &self,
        contract_id: &str,
    ) -> Result<Option<TerminationRequest>, ContractError>;

    async fn save_termination(&self, request: &TerminationRequest) -> Result<(), ContractError>;

    async fn delete_termination(&self, contract_id: &str) -> Result<bool, ContractError>;

    /// Save the closed subscription, the terminated contract and the
    /// confirmed request as one unit.
    async fn save_termination_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
        request: &TerminationRequest,
    ) -> Result<(), ContractError>;

    async fn save_magic_link(&self, record: &MagicLinkRecord) -> Result<(), ContractError>;

    async fn find_magic_link(&self, token_hash: &str)
        -> Result<Option<MagicLinkRecord>, ContractError>;

    async fn save_follow_up(&self, follow_up: &FollowUp) -> Result<(), ContractError>;

    async fn load_follow_up(&self, follow_up_id: &str) -> Result<Option<FollowUp>, ContractError>;

    async fn list_follow_ups(&self, include_resolved: bool) -> Result<Vec<FollowUp>, ContractError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    subscriptions: BTreeMap<String, Subscription>,
    contracts: BTreeMap<String, Contract>,
    /// Keyed by contract id; confirmed requests are kept for audit.
    terminations: BTreeMap<String, TerminationRequest>,
    magic_links: BTreeMap<String, MagicLinkRecord>,
    follow_ups: BTreeMap<String, FollowUp>,
}

impl StoreData {
    fn find_subscription_by_quote(&self, quote_uuid: &str) -> Option<Subscription> {
        self.subscriptions
            .values()
            .find(|subscription| subscription.quote_uuid == quote_uuid)
            .cloned()
    }

    fn find_contract_by_envelope(&self, envelope_id: &str) -> Option<Contract> {
        self.contracts
            .values()
            .find(|contract| contract.target_for_envelope(envelope_id).is_some())
            .cloned()
    }

    fn open_termination(&self, contract_id: &str) -> Option<TerminationRequest> {
        self.terminations
            .get(contract_id)
            .filter(|request| !request.is_complete())
            .cloned()
    }

    fn follow_ups(&self, include_resolved: bool) -> Vec<FollowUp> {
        let mut values: Vec<FollowUp> = self
            .follow_ups
            .values()
            .filter(|follow_up| include_resolved || follow_up.is_open())
            .cloned()
            .collect();
        values.sort_by_key(|follow_up| follow_up.created_at);
        values
    }
}

/// Process-local store for tests and sandbox deployments.
#[derive(Debug, Default)]
pub struct InMemoryContractStore {
    data: RwLock<StoreData>,
}

impl InMemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContractStore for InMemoryContractStore {
    async fn load_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        Ok(self.data.read().await.subscriptions.get(subscription_id).cloned())
    }

    async fn find_subscription_by_quote(
        &self,
        quote_uuid: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        Ok(self.data.read().await.find_subscription_by_quote(quote_uuid))
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), ContractError> {
        self.data
            .write()
            .await
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }

    async fn load_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError> {
        Ok(self.data.read().await.contracts.get(contract_id).cloned())
    }

    async fn find_contract_by_envelope(
        &self,
        envelope_id: &str,
    ) -> Result<Option<Contract>, ContractError> {
        Ok(self.data.read().await.find_contract_by_envelope(envelope_id))
    }

    async fn list_contracts(&self) -> Result<Vec<Contract>, ContractError> {
        Ok(self.data.read().await.contracts.values().cloned().collect())
    }

    async fn save_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<(), ContractError> {
        let mut data = self.data.write().await;
        data.subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        data.contracts
            .insert(contract.contract_id.clone(), contract.clone());
        Ok(())
    }

    async fn save_termination_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
        request: &TerminationRequest,
    ) -> Result<(), ContractError> {
        let mut data = self.data.write().await;
        data.subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        data.contracts
            .insert(contract.contract_id.clone(), contract.clone());
        data.terminations
            .insert(request.contract_id.clone(), request.clone());
        Ok(())
    }

    async fn load_termination(
        &self,
        contract_id: &str,
    ) -> Result<Option<TerminationRequest>, ContractError> {
        Ok(self.data.read().await.open_termination(contract_id))
    }

    async fn save_termination(&self, request: &TerminationRequest) -> Result<(), ContractError> {
        self.data
            .write()
            .await
            .terminations
            .insert(request.contract_id.clone(), request.clone());
        Ok(())
    }

    async fn delete_termination(&self, contract_id: &str) -> Result<bool, ContractError> {
        Ok(self
            .data
            .write()
            .await
            .terminations
            .remove(contract_id)
            .is_some())
    }

    async fn save_magic_link(&self, record: &MagicLinkRecord) -> Result<(), ContractError> {
        self.data
            .write()
            .await
            .magic_links
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_magic_link(
        &self,
        token_hash: &str,
    ) -> Result<Option<MagicLinkRecord>, ContractError> {
        Ok(self.data.read().await.magic_links.get(token_hash).cloned())
    }

    async fn save_follow_up(&self, follow_up: &FollowUp) -> Result<(), ContractError> {
        self.data
            .write()
            .await
            .follow_ups
            .insert(follow_up.follow_up_id.clone(), follow_up.clone());
        Ok(())
    }

    async fn load_follow_up(&self, follow_up_id: &str) -> Result<Option<FollowUp>, ContractError> {
        Ok(self.data.read().await.follow_ups.get(follow_up_id).cloned())
    }

    async fn list_follow_ups(&self, include_resolved: bool) -> Result<Vec<FollowUp>, ContractError> {
        Ok(self.data.read().await.follow_ups(include_resolved))
    }
}

/// JSON snapshot store persisted after every mutation.
///
/// Writes go to a temporary file that is renamed over the snapshot, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FileContractStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl FileContractStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ContractError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path).map_err(io_error)?;
            if bytes.is_empty() {
                StoreData::default()
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| ContractError::Serialization(e.to_string()))?
            }
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<F>(&self, apply: F) -> Result<(), ContractError>
    where
        F: FnOnce(&mut StoreData) + Send,
    {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        apply(&mut next);
        persist(&self.path, &next)?;
        *data = next;
        Ok(())
    }
}

fn persist(path: &Path, data: &StoreData) -> Result<(), ContractError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let bytes =
        serde_json::to_vec_pretty(data).map_err(|e| ContractError::Serialization(e.to_string()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).map_err(io_error)?;
    fs::rename(tmp_path, path).map_err(io_error)?;
    Ok(())
}

fn io_error(error: std::io::Error) -> ContractError {
    ContractError::Storage(format!("contract store io error: {error}"))
}

#[async_trait]
impl ContractStore for FileContractStore {
    async fn load_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        Ok(self.data.read().await.subscriptions.get(subscription_id).cloned())
    }

    async fn find_subscription_by_quote(
        &self,
        quote_uuid: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        Ok(self.data.read().await.find_subscription_by_quote(quote_uuid))
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), ContractError> {
        let subscription = subscription.clone();
        self.mutate(move |data| {
            data.subscriptions
                .insert(subscription.subscription_id.clone(), subscription);
        })
        .await
    }

    async fn load_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError> {
        Ok(self.data.read().await.contracts.get(contract_id).cloned())
    }

    async fn find_contract_by_envelope(
        &self,
        envelope_id: &str,
    ) -> Result<Option<Contract>, ContractError> {
        Ok(self.data.read().await.find_contract_by_envelope(envelope_id))
    }

    async fn list_contracts(&self) -> Result<Vec<Contract>, ContractError> {
        Ok(self.data.read().await.contracts.values().cloned().collect())
    }

    async fn save_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<(), ContractError> {
        let subscription = subscription.clone();
        let contract = contract.clone();
        self.mutate(move |data| {
            data.subscriptions
                .insert(subscription.subscription_id.clone(), subscription);
            data.contracts.insert(contract.contract_id.clone(), contract);
        })
        .await
    }

    async fn save_termination_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
        request: &TerminationRequest,
    ) -> Result<(), ContractError> {
        let subscription = subscription.clone();
        let contract = contract.clone();
        let request = request.clone();
        self.mutate(move |data| {
            data.subscriptions
                .insert(subscription.subscription_id.clone(), subscription);
            data.contracts.insert(contract.contract_id.clone(), contract);
            data.terminations.insert(request.contract_id.clone(), request);
        })
        .await
    }

    async fn load_termination(
        &self,
        contract_id: &str,
    ) -> Result<Option<TerminationRequest>, ContractError> {
        Ok(self.data.read().await.open_termination(contract_id))
    }

    async fn save_termination(&self, request: &TerminationRequest) -> Result<(), ContractError> {
        let request = request.clone();
        self.mutate(move |data| {
            data.terminations.insert(request.contract_id.clone(), request);
        })
        .await
    }

    async fn delete_termination(&self, contract_id: &str) -> Result<bool, ContractError> {
        let existed = self.data.read().await.terminations.contains_key(contract_id);
        if existed {
            let contract_id = contract_id.to_string();
            self.mutate(move |data| {
                data.terminations.remove(&contract_id);
            })
            .await?;
        }
        Ok(existed)
    }

    async fn save_magic_link(&self, record: &MagicLinkRecord) -> Result<(), ContractError> {
        let record = record.clone();
        self.mutate(move |data| {
            data.magic_links.insert(record.token_hash.clone(), record);
        })
        .await
    }

    async fn find_magic_link(
        &self,
        token_hash: &str,
    ) -> Result<Option<MagicLinkRecord>, ContractError> {
        Ok(self.data.read().await.magic_links.get(token_hash).cloned())
    }

    async fn save_follow_up(&self, follow_up: &FollowUp) -> Result<(), ContractError> {
        let follow_up = follow_up.clone();
        self.mutate(move |data| {
            data.follow_ups
                .insert(follow_up.follow_up_id.clone(), follow_up);
        })
        .await
    }

    async fn load_follow_up(&self, follow_up_id: &str) -> Result<Option<FollowUp>, ContractError> {
        Ok(self.data.read().await.follow_ups.get(follow_up_id).cloned())
    }

    async fn list_follow_ups(&self, include_resolved: bool) -> Result<Vec<FollowUp>, ContractError> {
        Ok(self.data.read().await.follow_ups(include_resolved))
    }
}
