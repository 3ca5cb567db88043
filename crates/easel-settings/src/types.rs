//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may be partial: missing fields keep their compiled default.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the easel server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EaselSettings {
    pub server: ServerSettings,
    pub limits: LimitSettings,
    pub permissions: PermissionSettings,
    pub logging: LoggingSettings,
}

impl EaselSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if !(1..=255).contains(&limits.user_limit) {
            return Err(SettingsError::InvalidValue(format!(
                "userLimit must be within 1..=255, got {}",
                limits.user_limit
            )));
        }
        if !(1..=255).contains(&limits.session_limit) {
            return Err(SettingsError::InvalidValue(format!(
                "sessionLimit must be within 1..=255, got {}",
                limits.session_limit
            )));
        }
        if !(1..=255).contains(&limits.subscription_limit) {
            return Err(SettingsError::InvalidValue(format!(
                "subscriptionLimit must be within 1..=255, got {}",
                limits.subscription_limit
            )));
        }
        if limits.output_buffer_bytes > limits.max_output_buffer_bytes {
            return Err(SettingsError::InvalidValue(format!(
                "outputBufferBytes ({}) exceeds maxOutputBufferBytes ({})",
                limits.output_buffer_bytes, limits.max_output_buffer_bytes
            )));
        }
        if limits.max_queued_messages == 0 {
            return Err(SettingsError::InvalidValue(
                "maxQueuedMessages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Network settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Drawing protocol TCP port.
    pub port: u16,
    /// Health/stats HTTP port.
    pub health_port: u16,
    /// Extensions the server is willing to negotiate.
    pub extensions: ExtensionSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 27750,
            health_port: 27751,
            extensions: ExtensionSettings::default(),
        }
    }
}

/// Server side of extension negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionSettings {
    pub deflate: bool,
    pub chat: bool,
    pub palette: bool,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            deflate: false,
            chat: true,
            palette: true,
        }
    }
}

/// Server limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Maximum concurrent connections.
    pub user_limit: usize,
    /// Maximum concurrent sessions.
    pub session_limit: usize,
    /// Maximum sessions one connection may join.
    pub subscription_limit: usize,
    /// Disconnect connections idle for longer than this.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub cleanup_interval_secs: u64,
    /// Initial output buffer capacity per connection.
    pub output_buffer_bytes: usize,
    /// Upper bound on unsent output plus the frame being written. Larger
    /// backlogs wait in the queue until the writer drains.
    pub max_output_buffer_bytes: usize,
    /// Outbound queue length at which a connection that is not reading is
    /// closed.
    pub max_queued_messages: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            user_limit: 10,
            session_limit: 1,
            subscription_limit: 5,
            idle_timeout_secs: 180,
            cleanup_interval_secs: 30,
            output_buffer_bytes: 4096,
            max_output_buffer_bytes: 4 * 1024 * 1024,
            max_queued_messages: 4096,
        }
    }
}

/// Initial permissions and connection admission rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSettings {
    pub allow_draw: bool,
    pub allow_chat: bool,
    /// Accept more than one connection from the same IP address.
    pub allow_duplicate_connections: bool,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            allow_draw: true,
            allow_chat: true,
            allow_duplicate_connections: false,
        }
    }
}

/// Logging output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
