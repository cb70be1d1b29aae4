//! Configuration for covenantd

use chrono::Duration;
use covenant_adapters::HttpProviderConfig;
use covenant_core::{CompanySigner, EngineConfig, JournalStorageConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub links: LinksConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub company_signer: CompanySignerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub journal: JournalConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8480)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// In-process provider; envelopes never leave the service.
    #[default]
    Sandbox,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub mode: ProviderMode,

    /// Origin embedded signing URLs are checked against in sandbox mode.
    #[serde(default = "default_sandbox_base_uri")]
    pub sandbox_base_uri: String,

    #[serde(default)]
    pub http: HttpProviderConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Sandbox,
            sandbox_base_uri: default_sandbox_base_uri(),
            http: HttpProviderConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn base_uri(&self) -> &str {
        match self.mode {
            ProviderMode::Sandbox => &self.sandbox_base_uri,
            ProviderMode::Http => &self.http.base_uri,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinksConfig {
    /// Public origin of this service, used in every link handed to customers.
    pub public_base_url: String,

    /// First entry signs new links; all entries verify.
    pub quote_link_secrets: Vec<String>,

    #[serde(default = "default_quote_link_validity_days")]
    pub quote_link_validity_days: u32,

    #[serde(default = "default_magic_link_ttl_hours")]
    pub magic_link_ttl_hours: i64,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8480".to_string(),
            quote_link_secrets: vec!["covenant-local-dev-secret".to_string()],
            quote_link_validity_days: default_quote_link_validity_days(),
            magic_link_ttl_hours: default_magic_link_ttl_hours(),
        }
    }
}

/// Webhook authenticity. An empty secret disables the check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub hmac_secret: String,
}

impl WebhookConfig {
    pub fn secret(&self) -> Option<&str> {
        Some(self.hmac_secret.as_str()).filter(|secret| !secret.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Envelope status poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Renewal/expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_renewal_notice_days")]
    pub renewal_notice_days: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            renewal_notice_days: default_renewal_notice_days(),
        }
    }
}

/// Counter-signer added after the customer. Empty email means customer-only envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanySignerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl Default for CompanySignerConfig {
    fn default() -> Self {
        Self {
            name: "Contracts Desk".to_string(),
            email: "contracts@example.com".to_string(),
        }
    }
}

/// Contract store location. Empty path keeps everything in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JournalConfig {
    #[default]
    Memory,

    Postgres {
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sandbox_base_uri() -> String {
    "https://sandbox.sign.local".to_string()
}

fn default_quote_link_validity_days() -> u32 {
    14
}

fn default_magic_link_ttl_hours() -> i64 {
    72
}

fn default_poll_interval() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    3_600
}

fn default_renewal_notice_days() -> u32 {
    30
}

fn default_pool_size() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `COVENANT_`-prefixed environment variables (`__` separates sections,
    /// e.g. `COVENANT_PROVIDER__MODE=http`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COVENANT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("links.quote_link_secrets"),
        );

        builder.build()?.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        let company_signer = Some(&self.company_signer)
            .filter(|signer| !signer.email.trim().is_empty())
            .map(|signer| CompanySigner {
                name: signer.name.clone(),
                email: signer.email.clone(),
            });
        let journal_storage = match &self.journal {
            JournalConfig::Memory => JournalStorageConfig::Memory,
            JournalConfig::Postgres {
                url,
                max_connections,
            } => JournalStorageConfig::postgres(url.clone(), *max_connections),
        };

        EngineConfig {
            provider_base_uri: self.provider.base_uri().to_string(),
            public_base_url: self.links.public_base_url.clone(),
            quote_link_secrets: self.links.quote_link_secrets.clone(),
            quote_link_validity_days: self.links.quote_link_validity_days,
            magic_link_ttl: Duration::hours(self.links.magic_link_ttl_hours.max(1)),
            renewal_notice_days: self.lifecycle.renewal_notice_days,
            company_signer,
            journal_storage,
        }
    }
}
