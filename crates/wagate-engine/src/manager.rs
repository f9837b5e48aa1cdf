//! Name-addressed facade over the registry, store and per-instance lifecycles.
//!
//! The API layer talks only to `InstanceManager`; it is built once at start-up
//! and shared behind an `Arc`.

use std::sync::{Arc, LazyLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::future::join_all;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use wagate_core::protocol::{ProtocolConnector, SendReceipt};
use wagate_core::transcription::Transcriber;
use wagate_core::ConnectionStatus;
use wagate_store::{InstanceConfigUpdate, InstanceRecord, InstanceRepo, NewInstance, StoreError};

use crate::config::EngineConfig;
use crate::error::InstanceError;
use crate::fanout::Subscription;
use crate::instance::{Instance, InstanceSnapshot, Services};
use crate::outbound::MediaMessage;
use crate::registry::InstanceRegistry;
use crate::webhook::WebhookDispatcher;

static INSTANCE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

const API_KEY_BYTES: usize = 32;

/// Keeps a send's typing choreography well inside the HTTP request timeout.
pub const MAX_TYPING_DELAY_MS: u32 = 30_000;

/// Partial configuration update; absent fields keep their current value.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct ConfigPatch {
    pub transcription_enabled: Option<bool>,
    pub typing_delay_min: Option<u32>,
    pub typing_delay_max: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub instance: String,
    pub status: ConnectionStatus,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QrReport {
    pub instance: String,
    pub status: ConnectionStatus,
    pub qrcode: Option<String>,
}

pub struct InstanceManager {
    registry: InstanceRegistry,
    services: Arc<Services>,
}

impl InstanceManager {
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        repo: InstanceRepo,
        transcriber: Option<Arc<dyn Transcriber>>,
        config: EngineConfig,
    ) -> Self {
        let services = Services {
            connector,
            repo,
            webhook: WebhookDispatcher::new(config.webhook_timeout),
            transcriber,
            config,
        };
        Self {
            registry: InstanceRegistry::new(),
            services: Arc::new(services),
        }
    }

    /// Registers every stored instance as disconnected. Rows that cannot be
    /// decoded are skipped. Returns how many instances were loaded.
    pub fn load_from_store(&self) -> Result<usize, InstanceError> {
        let mut loaded = 0;
        for row in self.services.repo.list_each()? {
            let record = match row {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable instance row");
                    continue;
                }
            };
            if record.status != ConnectionStatus::Disconnected {
                if let Err(e) =
                    self.services
                        .repo
                        .update_status(&record.id, ConnectionStatus::Disconnected, record.phone.as_deref())
                {
                    warn!(instance = %record.name, error = %e, "failed to reset stored status");
                }
            }
            let instance = Instance::new(&record, self.services.clone());
            match self.registry.add(instance) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(instance = %record.name, error = %e, "skipping instance"),
            }
        }
        info!(count = loaded, "instances loaded");
        Ok(loaded)
    }

    pub fn list(&self) -> Vec<InstanceSnapshot> {
        self.registry.list().iter().map(|i| i.snapshot()).collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Instance>, InstanceError> {
        self.registry
            .get_by_name(name)
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))
    }

    pub fn snapshot(&self, name: &str) -> Result<InstanceSnapshot, InstanceError> {
        Ok(self.get(name)?.snapshot())
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str) -> Result<InstanceSnapshot, InstanceError> {
        if !INSTANCE_NAME.is_match(name) {
            return Err(InstanceError::InvalidName(name.to_string()));
        }
        if self.registry.get_by_name(name).is_some() {
            return Err(InstanceError::NameTaken(name.to_string()));
        }

        let defaults = self.services.config.defaults;
        let record = self
            .services
            .repo
            .create(&NewInstance {
                name: name.to_string(),
                api_key: generate_api_key(),
                transcription_enabled: defaults.transcription_enabled,
                typing_delay_min: defaults.typing_delay_min,
                typing_delay_max: defaults.typing_delay_max,
            })
            .map_err(|e| match e {
                StoreError::Conflict(_) => InstanceError::NameTaken(name.to_string()),
                other => other.into(),
            })?;

        let instance = Instance::new(&record, self.services.clone());
        if let Err(e) = self.registry.add(instance.clone()) {
            // Lost a race with a concurrent create of the same name.
            self.discard_record(&record);
            return Err(e);
        }
        info!(instance = %name, instance_id = %record.id, "instance created");
        Ok(instance.snapshot())
    }

    fn discard_record(&self, record: &InstanceRecord) {
        if let Err(e) = self.services.repo.delete(&record.id) {
            warn!(instance = %record.name, instance_id = %record.id, error = %e, "failed to discard orphaned instance row");
        }
    }

    /// Disconnects, then evicts from registry and store.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), InstanceError> {
        let instance = self.get(name)?;
        instance.destroy().await;
        self.registry.remove(instance.id());
        self.services.repo.delete(instance.id())?;
        info!(instance = %name, "instance removed");
        Ok(())
    }

    pub async fn connect(&self, name: &str) -> Result<InstanceSnapshot, InstanceError> {
        let instance = self.get(name)?;
        instance.connect().await?;
        Ok(instance.snapshot())
    }

    pub async fn disconnect(&self, name: &str) -> Result<InstanceSnapshot, InstanceError> {
        let instance = self.get(name)?;
        instance.disconnect().await;
        Ok(instance.snapshot())
    }

    /// Blank or absent URLs clear the webhook.
    pub fn update_webhook(&self, name: &str, url: Option<&str>) -> Result<InstanceSnapshot, InstanceError> {
        let instance = self.get(name)?;
        let url = url.map(str::trim).filter(|u| !u.is_empty());
        if let Some(url) = url {
            validate_webhook_url(url)?;
        }
        self.services.repo.update_webhook(instance.id(), url)?;
        instance.set_webhook(url.map(String::from));
        Ok(instance.snapshot())
    }

    pub fn update_config(&self, name: &str, patch: ConfigPatch) -> Result<InstanceSnapshot, InstanceError> {
        let instance = self.get(name)?;
        let current = instance.settings();
        let update = InstanceConfigUpdate {
            transcription_enabled: patch.transcription_enabled.unwrap_or(current.transcription_enabled),
            typing_delay_min: patch.typing_delay_min.unwrap_or(current.typing.min_ms),
            typing_delay_max: patch.typing_delay_max.unwrap_or(current.typing.max_ms),
        };
        if update.typing_delay_max > MAX_TYPING_DELAY_MS {
            return Err(InstanceError::InvalidConfig(format!(
                "typing_delay_max ({}) exceeds {MAX_TYPING_DELAY_MS} ms",
                update.typing_delay_max
            )));
        }
        if update.typing_delay_min > update.typing_delay_max {
            return Err(InstanceError::InvalidConfig(format!(
                "typing_delay_min ({}) exceeds typing_delay_max ({})",
                update.typing_delay_min, update.typing_delay_max
            )));
        }
        self.services.repo.update_config(instance.id(), &update)?;
        instance.set_config(&update);
        Ok(instance.snapshot())
    }

    /// Issues and persists a new API key; the old one stops working at once.
    pub fn regenerate_api_key(&self, name: &str) -> Result<String, InstanceError> {
        let instance = self.get(name)?;
        let key = generate_api_key();
        self.services.repo.update_api_key(instance.id(), &key)?;
        instance.set_api_key(key.clone());
        info!(instance = %name, "api key rotated");
        Ok(key)
    }

    pub fn status(&self, name: &str) -> Result<StatusReport, InstanceError> {
        let instance = self.get(name)?;
        Ok(StatusReport {
            instance: name.to_string(),
            status: instance.live_status(),
            phone: instance.phone(),
        })
    }

    pub fn qr(&self, name: &str) -> Result<QrReport, InstanceError> {
        let instance = self.get(name)?;
        Ok(QrReport {
            instance: name.to_string(),
            status: instance.live_status(),
            qrcode: instance.pairing_code(),
        })
    }

    pub fn subscribe(&self, name: &str) -> Result<Subscription, InstanceError> {
        Ok(self.get(name)?.subscribe())
    }

    pub async fn send_text(&self, name: &str, number: &str, text: String) -> Result<SendReceipt, InstanceError> {
        self.get(name)?.send_text(number, text).await
    }

    pub async fn send_media(
        &self,
        name: &str,
        number: &str,
        media: MediaMessage,
    ) -> Result<SendReceipt, InstanceError> {
        self.get(name)?.send_media(number, media).await
    }

    /// Disconnects every instance; used on process shutdown.
    pub async fn shutdown(&self) {
        let instances = self.registry.list();
        join_all(instances.iter().map(|i| i.disconnect())).await;
        info!(count = instances.len(), "all instances disconnected");
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_webhook_url(url: &str) -> Result<(), InstanceError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| InstanceError::InvalidConfig(format!("webhook url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(InstanceError::InvalidConfig(format!(
            "webhook url must be http(s) with a host, got scheme {scheme}"
        ))),
    }
}
