//! # switchboard-settings
//!
//! Layered configuration for a switchboard node.
//!
//! Settings are resolved in priority order:
//! 1. **Compiled defaults**: [`SwitchboardSettings::default()`]
//! 2. **Settings file**: `~/.switchboard/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `SWITCHBOARD_*` overrides
//!
//! The binary applies CLI flags on top of the loaded value and then calls
//! [`SwitchboardSettings::validate`].

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
