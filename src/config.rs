//! Connection configuration loading.
//!
//! Connection definitions live in a TOML file, one `[connections.<name>]`
//! table per named connection, each a flat property bag with the reserved
//! keys below. A parsed [`DatabaseConfig`] can be installed process-wide
//! so transactions can resolve connections by name alone.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::context::ConnectionContext;
use crate::core::{Result, SqlexError};

/// Reserved property-bag keys consumed by [`ConnectionContext`].
pub mod keys {
    pub const KEY_CONNECTION_NAME: &str = "connection_name";
    pub const KEY_URL: &str = "url";
    pub const KEY_USERNAME: &str = "username";
    pub const KEY_PASSWORD: &str = "password";
    pub const KEY_VENDOR: &str = "vendor";
    pub const KEY_READONLY: &str = "readonly";
    pub const KEY_ISOLATION_LEVEL: &str = "isolation_level";
    pub const KEY_LOGIN_TIMEOUT: &str = "login_timeout";
    pub const KEY_BEFORE_CONNECT: &str = "before_connect";
    pub const KEY_AFTER_CONNECT: &str = "after_connect";
}

/// Connection name used when no default is configured.
pub const FALLBACK_CONNECTION_NAME: &str = "default";

#[derive(Debug, Deserialize)]
struct RawConfig {
    default_connection: Option<String>,
    #[serde(default)]
    connections: HashMap<String, toml::Value>,
}

/// Named connection contexts plus the default connection name.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    default_connection_name: String,
    contexts: HashMap<String, ConnectionContext>,
}

impl DatabaseConfig {
    /// Parses a TOML document into validated connection contexts.
    pub fn from_str(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| SqlexError::Configuration(format!("failed to parse config: {}", e)))?;

        let mut contexts = HashMap::new();
        for (name, value) in raw.connections {
            let table = value.as_table().ok_or_else(|| {
                SqlexError::Configuration(format!("connection '{}' is not a table", name))
            })?;

            let mut properties = HashMap::new();
            let mut roles = HashMap::new();
            properties.insert(keys::KEY_CONNECTION_NAME.to_string(), name.clone());
            for (key, entry) in table {
                if key == "roles" {
                    if let Some(role_table) = entry.as_table() {
                        for (role, credential) in role_table {
                            roles.insert(role.clone(), scalar_to_string(credential, role)?);
                        }
                    }
                    continue;
                }
                properties.insert(key.clone(), scalar_to_string(entry, key)?);
            }

            let mut context = ConnectionContext::from_properties(properties)?;
            context.set_roles(roles);
            contexts.insert(name, context);
        }

        Ok(DatabaseConfig {
            default_connection_name: raw
                .default_connection
                .unwrap_or_else(|| FALLBACK_CONNECTION_NAME.to_string()),
            contexts,
        })
    }

    /// Loads and parses a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        DatabaseConfig::from_str(&content)
    }

    pub fn default_connection_name(&self) -> &str {
        &self.default_connection_name
    }

    pub fn context(&self, name: &str) -> Option<&ConnectionContext> {
        self.contexts.get(name)
    }

    pub fn connection_names(&self) -> Vec<&str> {
        self.contexts.keys().map(String::as_str).collect()
    }
}

fn scalar_to_string(value: &toml::Value, key: &str) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        other => Err(SqlexError::Configuration(format!(
            "unsupported value for connection property '{}': {}",
            key, other
        ))),
    }
}

/// Process-wide installed configuration.
static INSTALLED_CONFIG: Lazy<RwLock<Option<DatabaseConfig>>> = Lazy::new(|| RwLock::new(None));

/// Installs a configuration for name-based connection resolution,
/// replacing any prior one.
pub fn install(config: DatabaseConfig) {
    *INSTALLED_CONFIG.write().expect("config lock poisoned") = Some(config);
}

/// Looks up a named context in the installed configuration.
pub fn installed_context(name: &str) -> Option<ConnectionContext> {
    INSTALLED_CONFIG
        .read()
        .expect("config lock poisoned")
        .as_ref()
        .and_then(|c| c.context(name))
        .cloned()
}

/// Default connection name of the installed configuration, or the
/// fallback when nothing is installed.
pub fn default_connection_name() -> String {
    INSTALLED_CONFIG
        .read()
        .expect("config lock poisoned")
        .as_ref()
        .map(|c| c.default_connection_name().to_string())
        .unwrap_or_else(|| FALLBACK_CONNECTION_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IsolationLevel;
    use crate::vendor::Vendor;

    const SAMPLE_CONFIG: &str = r#"
default_connection = "orders"

[connections.orders]
url = "sqlite:orders.db"
username = "app"
password = "secret"
readonly = false
isolation_level = "SERIALIZABLE"
login_timeout = 30

[connections.orders.roles]
reporting = "report_pw"

[connections.audit]
url = "sqlite::memory:"
readonly = true
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = DatabaseConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.default_connection_name(), "orders");

        let orders = config.context("orders").unwrap();
        assert_eq!(orders.connection_name(), "orders");
        assert_eq!(orders.vendor(), Some(Vendor::Sqlite));
        assert_eq!(orders.username(), Some("app"));
        assert_eq!(orders.isolation_level(), Some(IsolationLevel::Serializable));
        assert_eq!(orders.login_timeout(), Some(30));
        assert_eq!(
            orders.roles().get("reporting").map(String::as_str),
            Some("report_pw")
        );

        let audit = config.context("audit").unwrap();
        assert!(audit.is_readonly());
    }

    #[test]
    fn test_invalid_isolation_level_propagates() {
        let text = r#"
[connections.bad]
url = "sqlite:x.db"
isolation_level = "DIRTY"
"#;
        assert!(matches!(
            DatabaseConfig::from_str(text),
            Err(SqlexError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_default_falls_back() {
        let config = DatabaseConfig::from_str("[connections.a]\nurl = \"sqlite:a.db\"\n").unwrap();
        assert_eq!(config.default_connection_name(), FALLBACK_CONNECTION_NAME);
    }

    #[test]
    fn test_install_and_lookup() {
        let config = DatabaseConfig::from_str(SAMPLE_CONFIG).unwrap();
        install(config);

        assert_eq!(default_connection_name(), "orders");
        let ctx = installed_context("audit").unwrap();
        assert_eq!(ctx.connection_name(), "audit");
        assert!(installed_context("missing").is_none());
    }
}
