//! # delio-settings
//!
//! Kernel configuration loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`DelioSettings::default()`]
//! 2. **User file** - `~/.delio/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `DELIO_*` overrides (highest priority)
//!
//! ```no_run
//! use delio_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("cycle deadline: {}ms", settings.cycle.timeout_ms);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
