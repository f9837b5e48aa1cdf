//! # wagate-settings
//!
//! Settings are loaded from layered sources, lowest priority first:
//! 1. **Compiled defaults** ([`WagateSettings::default()`])
//! 2. **User file** `~/.wagate/settings.json`, deep-merged over the defaults
//! 3. **`.env` file and environment variables** (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
