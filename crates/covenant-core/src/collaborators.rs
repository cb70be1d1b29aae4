//! Interfaces the core calls into: field-service tasks, billing, document
//! rendering and archival. None of them are owned by this crate.

use crate::contract::Contract;
use crate::error::ContractError;
use crate::types::{AmountMinor, SourceDocument, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationTaskRequest {
    pub subscription_id: String,
    pub contract_id: String,
    pub customer_name: String,
    pub reason: String,
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Create the installation task; returns the scheduler's task reference.
    async fn create_installation_task(
        &self,
        request: &InstallationTaskRequest,
    ) -> Result<String, ContractError>;
}

/// A registered customer payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub reference: String,
    pub amount_minor: AmountMinor,
    pub currency: String,
    /// Invoice the payment was already reconciled against, if any.
    pub applied_invoice: Option<String>,
}

#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn cancel_recurring_billing(&self, subscription_id: &str) -> Result<(), ContractError>;

    /// Sum of payments collected against the contract so far.
    async fn total_paid(&self, contract_id: &str) -> Result<AmountMinor, ContractError>;

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>, ContractError>;
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_contract(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<SourceDocument, ContractError>;

    async fn render_addendum(
        &self,
        contract: &Contract,
        addendum_id: &str,
    ) -> Result<SourceDocument, ContractError>;
}

#[async_trait]
pub trait DocumentArchive: Send + Sync {
    /// Persist signed bytes; returns an archive reference.
    async fn store(
        &self,
        contract_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, ContractError>;
}
