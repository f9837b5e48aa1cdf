//! Settings type definitions.
//!
//! JSON keys are camelCase. Every section is `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

/// Upper bound for typing delays, kept in step with the engine's limit.
pub const MAX_TYPING_DELAY_MS: u32 = 30_000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WagateSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub lifecycle: LifecycleSettings,
    pub webhook: WebhookSettings,
    pub transcription: TranscriptionSettings,
    /// Applied to instances at creation time.
    pub instance_defaults: InstanceDefaults,
    pub logging: LoggingSettings,
}

impl WagateSettings {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        let d = &self.instance_defaults;
        if d.typing_delay_min > d.typing_delay_max {
            return Err(crate::SettingsError::InvalidValue(format!(
                "instanceDefaults.typingDelayMin ({}) exceeds typingDelayMax ({})",
                d.typing_delay_min, d.typing_delay_max
            )));
        }
        if d.typing_delay_max > MAX_TYPING_DELAY_MS {
            return Err(crate::SettingsError::InvalidValue(format!(
                "instanceDefaults.typingDelayMax ({}) exceeds {MAX_TYPING_DELAY_MS}",
                d.typing_delay_max
            )));
        }
        if self.lifecycle.subscriber_capacity == 0 {
            return Err(crate::SettingsError::InvalidValue(
                "lifecycle.subscriberCapacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Bearer token guarding the management routes. Open when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            admin_token: None,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: String,
    pub log_db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "data/wagate.db".into(),
            log_db_path: "data/logs.db".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleSettings {
    pub keepalive_interval_secs: u64,
    /// Delay before the first connectivity reconciliation after connect.
    pub settle_delay_secs: u64,
    pub presence_pause_ms: u64,
    pub subscriber_capacity: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 20,
            settle_delay_secs: 3,
            presence_pause_ms: 500,
            subscriber_capacity: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    pub timeout_secs: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionSettings {
    /// Base URL of a whisper.cpp-compatible server (`POST {baseUrl}/inference`).
    pub base_url: String,
    pub language: String,
    pub timeout_secs: u64,
    pub ffmpeg_path: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".into(),
            language: "pt".into(),
            timeout_secs: 120,
            ffmpeg_path: "ffmpeg".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceDefaults {
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            transcription_enabled: true,
            typing_delay_min: 1000,
            typing_delay_max: 3000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist warn+ events to `storage.logDbPath`.
    pub persist: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            persist: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_constants() {
        let s = WagateSettings::default();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.lifecycle.keepalive_interval_secs, 20);
        assert_eq!(s.lifecycle.subscriber_capacity, 10);
        assert_eq!(s.webhook.timeout_secs, 10);
        assert_eq!(s.instance_defaults.typing_delay_min, 1000);
        assert_eq!(s.instance_defaults.typing_delay_max, 3000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn keys_are_camel_case() {
        let json = serde_json::to_value(WagateSettings::default()).unwrap();
        assert!(json["lifecycle"].get("keepaliveIntervalSecs").is_some());
        assert!(json["instanceDefaults"].get("typingDelayMin").is_some());
        assert!(json["server"].get("adminToken").is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let s: WagateSettings = serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.transcription.language, "pt");
    }

    #[test]
    fn inverted_typing_delay_fails_validation() {
        let mut s = WagateSettings::default();
        s.instance_defaults.typing_delay_min = 5000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn oversized_typing_delay_fails_validation() {
        let mut s = WagateSettings::default();
        s.instance_defaults.typing_delay_max = MAX_TYPING_DELAY_MS + 1;
        assert!(s.validate().is_err());
        s.instance_defaults.typing_delay_max = MAX_TYPING_DELAY_MS;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let mut s = WagateSettings::default();
        s.lifecycle.subscriber_capacity = 0;
        assert!(s.validate().is_err());
    }
}
