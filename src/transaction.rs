//! Transaction-scoped connection ownership.
//!
//! A [`ResourceRegistry`] owns every connection opened for one logical
//! unit of work: connections are created lazily on first request, cached
//! by name, and released exactly once in registration order. The
//! [`Transaction`] trait layers commit/rollback semantics on top; the
//! registry itself only manages resource lifetime.
//!
//! A registry belongs to exactly one unit of work and holds no internal
//! locking; it must not be shared across concurrent units.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::config;
use crate::context::{ConnectionContext, HookName, IsolationLevel};
use crate::core::{Result, SqlexError};
use crate::vendor::Vendor;

/// A live database connection plus its originating connection name and
/// vendor. Owned by exactly one registry at a time.
#[derive(Debug)]
pub struct UserConnection {
    name: String,
    vendor: Vendor,
    conn: Connection,
}

impl UserConnection {
    pub fn new(name: impl Into<String>, vendor: Vendor, conn: Connection) -> Self {
        UserConnection {
            name: name.into(),
            vendor,
            conn,
        }
    }

    pub fn connection_name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Closes the underlying connection. On failure the handle is given
    /// back so the caller can retry.
    pub fn close(self) -> std::result::Result<(), (UserConnection, rusqlite::Error)> {
        let UserConnection { name, vendor, conn } = self;
        match conn.close() {
            Ok(()) => Ok(()),
            Err((conn, source)) => Err((UserConnection { name, vendor, conn }, source)),
        }
    }
}

/// A connect-lifecycle callback: `Before` runs before the connection is
/// opened, `After` runs against the fresh connection.
pub enum ConnectHook {
    Before(fn() -> Result<()>),
    After(fn(&Connection) -> Result<()>),
}

static CONNECT_HOOKS: Lazy<RwLock<HashMap<String, ConnectHook>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a connect hook under its `qualified.name.method` identifier.
pub fn register_connect_hook(name: &str, hook: ConnectHook) {
    CONNECT_HOOKS
        .write()
        .expect("hook registry poisoned")
        .insert(name.to_string(), hook);
}

fn run_before_hook(name: &HookName) -> Result<()> {
    match CONNECT_HOOKS
        .read()
        .expect("hook registry poisoned")
        .get(&name.full_name())
    {
        Some(ConnectHook::Before(hook)) => hook(),
        _ => {
            warn!(hook = %name.full_name(), "before-connect hook not registered");
            Ok(())
        }
    }
}

fn run_after_hook(name: &HookName, conn: &Connection) -> Result<()> {
    match CONNECT_HOOKS
        .read()
        .expect("hook registry poisoned")
        .get(&name.full_name())
    {
        Some(ConnectHook::After(hook)) => hook(conn),
        _ => {
            warn!(hook = %name.full_name(), "after-connect hook not registered");
            Ok(())
        }
    }
}

/// Opens connections described by a [`ConnectionContext`].
pub struct ConnectionFactory;

impl ConnectionFactory {
    /// Opens a connection for the context's vendor, applying read-only
    /// mode, busy timeout, isolation pragma and connect hooks.
    pub fn create(ctx: &ConnectionContext) -> Result<UserConnection> {
        let vendor = ctx.vendor().ok_or_else(|| {
            SqlexError::Configuration(format!(
                "no vendor resolved for connection '{}'",
                ctx.connection_name()
            ))
        })?;
        if vendor != Vendor::Sqlite {
            return Err(SqlexError::Configuration(format!(
                "no connection support for vendor '{}'",
                vendor.tag()
            )));
        }

        if let Some(hook) = ctx.before_connect() {
            run_before_hook(hook)?;
        }

        let path = ctx
            .url()
            .map(|url| url.strip_prefix("sqlite:").unwrap_or(url))
            .unwrap_or(":memory:");

        let conn = if ctx.is_readonly() {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            Connection::open(path)
        }
        .map_err(SqlexError::Execution)?;

        if let Some(timeout) = ctx.login_timeout() {
            conn.busy_timeout(Duration::from_secs(timeout.max(0) as u64))
                .map_err(SqlexError::Execution)?;
        }
        if ctx.isolation_level() == Some(IsolationLevel::ReadUncommitted) {
            conn.execute_batch("PRAGMA read_uncommitted = 1;")
                .map_err(SqlexError::Execution)?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(SqlexError::Execution)?;

        if let Some(hook) = ctx.after_connect() {
            run_after_hook(hook, &conn)?;
        }

        debug!(connection = %ctx.connection_name(), path = %path, "connection opened");
        Ok(UserConnection::new(ctx.connection_name(), vendor, conn))
    }

    /// Opens a connection by name from the installed configuration.
    pub fn create_named(name: &str) -> Result<UserConnection> {
        let ctx = config::installed_context(name).ok_or_else(|| {
            SqlexError::Configuration(format!("no connection '{}' in installed configuration", name))
        })?;
        ConnectionFactory::create(&ctx)
    }
}

/// Per-unit-of-work owner of named live connections.
///
/// State machine: `begin()` flips `started`; the first
/// `release_resources()` marks the registry ended, closes every
/// connection in registration order, clears both structures and sets
/// `all_resources_released`. Repeated release calls are no-ops.
#[derive(Default)]
pub struct ResourceRegistry {
    name_conn_map: HashMap<String, UserConnection>,
    conn_order: Vec<String>,
    started: bool,
    ended: bool,
    all_resources_released: bool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        ResourceRegistry::default()
    }

    pub fn begin(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_all_resources_released(&self) -> bool {
        self.all_resources_released
    }

    /// Registers a connection under `name`. The first registration wins:
    /// a handle offered for an already-registered name is returned to the
    /// caller untouched.
    pub fn register_resource(&mut self, name: &str, conn: UserConnection) -> Option<UserConnection> {
        if self.name_conn_map.contains_key(name) {
            return Some(conn);
        }
        self.conn_order.push(name.to_string());
        self.name_conn_map.insert(name.to_string(), conn);
        None
    }

    /// Removes and returns the connection registered under `name`.
    /// Silently a no-op when the name is absent.
    pub fn deregister_resource(&mut self, name: &str) -> Option<UserConnection> {
        let conn = self.name_conn_map.remove(name)?;
        self.conn_order.retain(|n| n != name);
        Some(conn)
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.name_conn_map.contains_key(name)
    }

    pub fn cached_connection(&self, name: &str) -> Option<&UserConnection> {
        self.name_conn_map.get(name)
    }

    /// Names of the registered connections, in registration order.
    pub fn connection_names(&self) -> &[String] {
        &self.conn_order
    }

    /// Returns the cached connection for `name`, creating and registering
    /// one from the installed configuration on first request. At most one
    /// live connection exists per name per registry.
    pub fn get_connection(&mut self, name: &str) -> Result<&UserConnection> {
        if !self.name_conn_map.contains_key(name) {
            let conn = ConnectionFactory::create_named(name)?;
            self.register_resource(name, conn);
        }
        Ok(self.name_conn_map.get(name).expect("connection just registered"))
    }

    /// Like [`get_connection`](Self::get_connection), creating from an
    /// explicit context instead of the installed configuration.
    pub fn get_connection_with_context(
        &mut self,
        ctx: &ConnectionContext,
    ) -> Result<&UserConnection> {
        let name = ctx.connection_name();
        if !self.name_conn_map.contains_key(name) {
            let conn = ConnectionFactory::create(ctx)?;
            self.register_resource(name, conn);
        }
        Ok(self.name_conn_map.get(name).expect("connection just registered"))
    }

    /// The connection named by the installed configuration's default.
    pub fn get_default_connection(&mut self) -> Result<&UserConnection> {
        let name = config::default_connection_name();
        self.get_connection(&name)
    }

    /// Releases every registered connection in registration order.
    /// Idempotent: a second call after success is a no-op. A close
    /// failure keeps the failed connection (and everything after it)
    /// registered, leaves the released flag unset, and surfaces as
    /// [`SqlexError::ResourceRelease`] so release can be retried.
    pub fn release_resources(&mut self) -> Result<()> {
        if self.all_resources_released {
            return Ok(());
        }
        self.ended = true;

        while let Some(name) = self.conn_order.first().cloned() {
            let conn = match self.name_conn_map.remove(&name) {
                Some(conn) => conn,
                None => {
                    self.conn_order.remove(0);
                    continue;
                }
            };
            match conn.close() {
                Ok(()) => {
                    self.conn_order.remove(0);
                    debug!(connection = %name, "connection released");
                }
                Err((conn, source)) => {
                    self.name_conn_map.insert(name.clone(), conn);
                    return Err(SqlexError::ResourceRelease {
                        connection: name,
                        source,
                    });
                }
            }
        }

        self.name_conn_map.clear();
        self.conn_order.clear();
        self.all_resources_released = true;
        Ok(())
    }
}

/// One logical unit of work. The registry manages resource lifetime;
/// implementations supply the commit protocol.
pub trait Transaction {
    fn transaction_type(&self) -> &'static str;

    fn registry(&self) -> &ResourceRegistry;

    fn registry_mut(&mut self) -> &mut ResourceRegistry;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn release_resources(&mut self) -> Result<()> {
        self.registry_mut().release_resources()
    }

    fn is_started(&self) -> bool {
        self.registry().is_started()
    }

    fn is_ended(&self) -> bool {
        self.registry().is_ended()
    }

    fn is_all_resources_released(&self) -> bool {
        self.registry().is_all_resources_released()
    }
}

/// Autocommit-style transaction: commit and rollback are no-ops, the
/// database applies each statement as it executes.
#[derive(Default)]
pub struct LocalTransaction {
    registry: ResourceRegistry,
}

impl LocalTransaction {
    pub fn new() -> Self {
        LocalTransaction::default()
    }

    pub fn get_connection(&mut self, name: &str) -> Result<&UserConnection> {
        self.registry.get_connection(name)
    }

    pub fn get_connection_with_context(
        &mut self,
        ctx: &ConnectionContext,
    ) -> Result<&UserConnection> {
        self.registry.get_connection_with_context(ctx)
    }
}

impl Transaction for LocalTransaction {
    fn transaction_type(&self) -> &'static str {
        "local"
    }

    fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    fn begin(&mut self) -> Result<()> {
        self.registry.begin();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transaction that drives an explicit SQL transaction on every owned
/// connection: `BEGIN DEFERRED` as each connection joins, then
/// `COMMIT`/`ROLLBACK` across all of them in registration order.
#[derive(Default)]
pub struct SqlTransaction {
    registry: ResourceRegistry,
}

impl SqlTransaction {
    pub fn new() -> Self {
        SqlTransaction::default()
    }

    pub fn get_connection(&mut self, name: &str) -> Result<&UserConnection> {
        let fresh = !self.registry.has_connection(name);
        let started = self.registry.is_started();
        let conn = self.registry.get_connection(name)?;
        if fresh && started {
            conn.connection()
                .execute_batch("BEGIN DEFERRED")
                .map_err(SqlexError::Execution)?;
        }
        Ok(conn)
    }

    pub fn get_connection_with_context(
        &mut self,
        ctx: &ConnectionContext,
    ) -> Result<&UserConnection> {
        let fresh = !self.registry.has_connection(ctx.connection_name());
        let started = self.registry.is_started();
        let conn = self.registry.get_connection_with_context(ctx)?;
        if fresh && started {
            conn.connection()
                .execute_batch("BEGIN DEFERRED")
                .map_err(SqlexError::Execution)?;
        }
        Ok(conn)
    }

    fn for_each_connection(&self, sql: &str) -> Result<()> {
        for name in self.registry.connection_names() {
            if let Some(conn) = self.registry.cached_connection(name) {
                conn.connection()
                    .execute_batch(sql)
                    .map_err(SqlexError::Execution)?;
            }
        }
        Ok(())
    }
}

impl Transaction for SqlTransaction {
    fn transaction_type(&self) -> &'static str {
        "sql"
    }

    fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    fn begin(&mut self) -> Result<()> {
        self.registry.begin();
        self.for_each_connection("BEGIN DEFERRED")
    }

    fn commit(&mut self) -> Result<()> {
        if !self.registry.is_started() || self.registry.is_ended() {
            return Ok(());
        }
        self.for_each_connection("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.registry.is_started() || self.registry.is_ended() {
            return Ok(());
        }
        self.for_each_connection("ROLLBACK")
    }
}
