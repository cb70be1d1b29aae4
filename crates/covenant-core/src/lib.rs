//! Service contract lifecycle core.
//!
//! Contracts are drafted from confirmed quotes, sent for e-signature under a
//! single envelope, reconciled from provider webhooks and polling, and closed
//! through a step-gated termination wizard. Subscription progress is a pure
//! projection of the states recorded here.

#![deny(unsafe_code)]

pub mod addendum;
pub mod collaborators;
pub mod contract;
pub mod embedded;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod followup;
pub mod journal;
pub mod journal_storage;
pub mod lifecycle;
pub mod links;
pub mod locks;
pub mod magic_link;
pub mod phone;
pub mod progress;
pub mod provider;
pub mod sandbox;
pub mod store;
pub mod termination;
pub mod token;
pub mod types;

pub use addendum::{Addendum, AddendumState, AppliedAdjustment};
pub use collaborators::{
    BillingGateway, DocumentArchive, DocumentRenderer, InstallationTaskRequest, PaymentRecord,
    TaskScheduler,
};
pub use contract::{Contract, SigningTarget};
pub use embedded::{normalize_signing_url, EmbeddedSigningStatus};
pub use engine::{
    AbandonOutcome, Collaborators, CompanySigner, ContractEngine, EngineConfig, MagicLinkGrant,
    PollSummary, QuoteConfirmation, RecipientChanges, ReconcileOutcome, ReconcileSource,
    ServiceStateUpdate, SigningRedirect, SigningReturn, SweepSummary, TerminationAction,
    TerminationReceipt, WebhookDisposition, WebhookEvent,
};
pub use envelope::{EnvelopeState, ReconcileDelta, SigningEnvelope, SigningPacket};
pub use error::ContractError;
pub use followup::{FollowUp, FollowUpKind, SideEffectOutcome};
pub use journal::{AuditJournal, ContractNote, JournalEntry, JournalEntryKind};
pub use journal_storage::{JournalStorageConfig, PersistentJournal};
pub use lifecycle::{ContractEvent, ContractState};
pub use links::{LinkRejection, QuoteLinkParams, QuoteLinkSigner};
pub use locks::KeyedLocks;
pub use magic_link::{MagicLinkRecord, MagicLinkRejection};
pub use phone::PhoneNumber;
pub use progress::{project, ProgressInputs, ProgressStage};
pub use provider::{
    DownloadedDocument, EmbeddedSigningRequest, EnvelopeDraft, EnvelopeReceipt,
    EnvelopeStatusReport, ProviderEnvelopeStatus, ProviderRecipientStatus, RecipientDraft,
    RecipientStatuses, RecipientUpdate, SignatureProvider,
};
pub use store::{ContractStore, FileContractStore, InMemoryContractStore};
pub use termination::{
    ClosureDetails, ClosureRecord, CompetitorInfo, TerminationReason, TerminationRequest,
    TerminationStep, MANAGER_APPROVAL_THRESHOLD_MINOR,
};
pub use token::{AccessToken, StaticTokenSource, TokenCache, TokenSource};
pub use types::{
    format_minor, AmountMinor, ConfigurationState, ContractTerms, DeliveryChannel,
    InstallationState, InternetServiceState, QuoteStatus, Recipient, RecipientRole,
    SourceDocument, StoredDocument, Subscription, SubscriptionContractState, SubscriptionState,
};
