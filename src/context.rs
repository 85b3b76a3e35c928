//! Validated connection configuration.
//!
//! A [`ConnectionContext`] is pure configuration: it describes how to
//! obtain one named database connection and performs no I/O itself.
//! Construction validates the property bag up front; a bad isolation
//! level, timeout or hook identifier is rejected immediately rather than
//! silently coerced later.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::config::keys;
use crate::core::{Result, SqlexError};
use crate::vendor::{Vendor, BUILTIN_VENDORS};

/// Transaction isolation level, validated against the recognized names.
/// Absent means the database default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = SqlexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(SqlexError::Configuration(format!(
                "transaction isolation level specified is not valid: \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        write!(f, "{}", name)
    }
}

/// A connect-lifecycle hook identifier in `qualified.name.method` form,
/// split at the last dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookName {
    qualifier: String,
    method: String,
}

impl HookName {
    fn parse(raw: &str) -> Result<Self> {
        let (qualifier, method) = raw.rsplit_once('.').ok_or_else(|| {
            SqlexError::Configuration(format!("failed to parse connect hook: {}", raw))
        })?;
        if qualifier.is_empty() || method.is_empty() {
            return Err(SqlexError::Configuration(format!(
                "failed to parse connect hook: {}",
                raw
            )));
        }
        Ok(HookName {
            qualifier: qualifier.to_string(),
            method: method.to_string(),
        })
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The full `qualifier.method` identifier, the hook registry key.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.qualifier, self.method)
    }
}

/// Detects a vendor from a driver name, connection URL or connection
/// name: first vendor in the built-in list whose tag appears
/// case-insensitively as a substring wins. Ambiguous inputs resolve by
/// list order, not specificity.
pub fn check_vendor(input: &str) -> Option<Vendor> {
    let upper = input.to_uppercase();
    BUILTIN_VENDORS
        .iter()
        .copied()
        .find(|v| upper.contains(&v.tag().to_uppercase()))
}

/// Validated, immutable configuration for one named database connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection_name: String,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    vendor: Option<Vendor>,
    readonly: bool,
    isolation_level: Option<IsolationLevel>,
    login_timeout: Option<i64>,
    before_connect: Option<HookName>,
    after_connect: Option<HookName>,
    properties: HashMap<String, String>,
    roles: HashMap<String, String>,
}

impl ConnectionContext {
    /// Builds a context from a flat property bag, validating every
    /// recognized key. The connection name is mandatory.
    pub fn from_properties(properties: HashMap<String, String>) -> Result<Self> {
        let connection_name = properties
            .get(keys::KEY_CONNECTION_NAME)
            .filter(|n| !n.is_empty())
            .cloned()
            .ok_or_else(|| {
                SqlexError::Configuration("database connection name not found in properties".to_string())
            })?;

        let url = properties.get(keys::KEY_URL).cloned();
        let username = properties.get(keys::KEY_USERNAME).cloned();
        let password = properties.get(keys::KEY_PASSWORD).cloned();

        let readonly = properties
            .get(keys::KEY_READONLY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let isolation_level = match properties.get(keys::KEY_ISOLATION_LEVEL) {
            Some(raw) => Some(raw.parse::<IsolationLevel>()?),
            None => None,
        };

        let login_timeout = match properties.get(keys::KEY_LOGIN_TIMEOUT) {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                SqlexError::Configuration(format!("failed to parse login timeout: {}", raw))
            })?),
            None => None,
        };

        let before_connect = match properties.get(keys::KEY_BEFORE_CONNECT) {
            Some(raw) => Some(HookName::parse(raw)?),
            None => None,
        };
        let after_connect = match properties.get(keys::KEY_AFTER_CONNECT) {
            Some(raw) => Some(HookName::parse(raw)?),
            None => None,
        };

        let vendor = match properties.get(keys::KEY_VENDOR) {
            Some(tag) => Some(Vendor::from_tag(tag).ok_or_else(|| {
                SqlexError::Configuration(format!("unknown database vendor: {}", tag))
            })?),
            None => url
                .as_deref()
                .and_then(check_vendor)
                .or_else(|| check_vendor(&connection_name)),
        };

        Ok(ConnectionContext {
            connection_name,
            url,
            username,
            password,
            vendor,
            readonly,
            isolation_level,
            login_timeout,
            before_connect,
            after_connect,
            properties,
            roles: HashMap::new(),
        })
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn vendor(&self) -> Option<Vendor> {
        self.vendor
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn has_specified_isolation_level(&self) -> bool {
        self.isolation_level.is_some()
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    /// Maximum time in seconds to wait while attempting to connect.
    pub fn login_timeout(&self) -> Option<i64> {
        self.login_timeout
    }

    pub fn before_connect(&self) -> Option<&HookName> {
        self.before_connect.as_ref()
    }

    pub fn after_connect(&self) -> Option<&HookName> {
        self.after_connect.as_ref()
    }

    /// The full property bag the context was built from.
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Role name/credential pairs for connections that switch roles.
    pub fn roles(&self) -> &HashMap<String, String> {
        &self.roles
    }

    pub fn set_roles(&mut self, roles: HashMap<String, String>) {
        self.roles = roles;
    }
}
