//! Vendor tags and the database adapter seam.
//!
//! The engine stays vendor-neutral by delegating vendor-specific behavior
//! to a [`DbAdapter`]: overriding how a value binds into a statement slot,
//! reading cursor cells, rewriting a statement for page-limited retrieval
//! and fetching generated keys. SQLite is the adapter shipped here.

use rusqlite::{Connection, Row, Statement};

use crate::core::{Result, SqlexError};
use crate::engine::{DEFAULT_PAGINATION_LIMIT, KEY_RECORDS_LIMIT, KEY_RECORDS_OFFSET, PAGINATION_META_PREFIX};
use crate::statement::{Parameter, SqlType};
use crate::value::{get_int_value, InputMap, OutputFilter, Value};

/// Known database vendors. [`BUILTIN_VENDORS`] fixes the detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    H2,
    Hsqldb,
    Mysql,
    Oracle,
    Postgresql,
    Sqlite,
    SqlServer,
    Sybase,
}

/// Built-in vendor list. Substring detection walks this list in order and
/// the first match wins, so the order is part of the observable contract.
pub const BUILTIN_VENDORS: [Vendor; 8] = [
    Vendor::H2,
    Vendor::Hsqldb,
    Vendor::Mysql,
    Vendor::Oracle,
    Vendor::Postgresql,
    Vendor::Sqlite,
    Vendor::SqlServer,
    Vendor::Sybase,
];

impl Vendor {
    /// The identifier matched against driver names, URLs and connection
    /// names during detection.
    pub fn tag(&self) -> &'static str {
        match self {
            Vendor::H2 => "h2",
            Vendor::Hsqldb => "hsqldb",
            Vendor::Mysql => "mysql",
            Vendor::Oracle => "oracle",
            Vendor::Postgresql => "postgresql",
            Vendor::Sqlite => "sqlite",
            Vendor::SqlServer => "sqlserver",
            Vendor::Sybase => "sybase",
        }
    }

    /// Resolves an explicit vendor tag, case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Vendor> {
        let lower = tag.trim().to_lowercase();
        BUILTIN_VENDORS.iter().copied().find(|v| v.tag() == lower)
    }
}

/// Vendor-specific behavior consumed by the execution engine.
pub trait DbAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Whether the driver exposes introspectable parameter metadata. When
    /// false the engine falls back to parsing the statement text.
    fn supports_parameter_metadata(&self) -> bool {
        false
    }

    /// Whether mutations can report a generated key.
    fn supports_generated_keys(&self) -> bool {
        false
    }

    /// Vendor override for binding one value. Returning `false` hands the
    /// value to the engine's type-directed bind path.
    fn bind_value(
        &self,
        stmt: &mut Statement<'_>,
        param: &Parameter,
        value: &Value,
        inputs: &InputMap,
    ) -> Result<bool>;

    /// Reads one cursor cell as a neutral [`Value`], guided by the
    /// column's declared type where the vendor needs it.
    fn read_cell(&self, row: &Row<'_>, index: usize, sql_type: SqlType) -> Result<Value>;

    /// Rewrites a statement for page-limited retrieval and records
    /// pagination metadata in the fresh output filter.
    fn prepare_pagination_sql(&self, sql: &str, inputs: &InputMap, filter: &mut OutputFilter) -> String;

    /// Fetches the generated key for the statement just executed, or
    /// `None` when the feature does not apply. Failures are swallowed as
    /// "unsupported", never surfaced.
    fn generated_key(&self, conn: &Connection, sql: &str) -> Option<i64>;
}

/// SQLite adapter over rusqlite.
pub struct SqliteAdapter;

impl DbAdapter for SqliteAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Sqlite
    }

    // SQLite reports parameter names but no declared types, so the text
    // parser is the metadata source here.
    fn supports_parameter_metadata(&self) -> bool {
        false
    }

    fn supports_generated_keys(&self) -> bool {
        true
    }

    fn bind_value(
        &self,
        _stmt: &mut Statement<'_>,
        _param: &Parameter,
        _value: &Value,
        _inputs: &InputMap,
    ) -> Result<bool> {
        // no SQLite-specific overrides; the type-directed path handles
        // every storage class
        Ok(false)
    }

    fn read_cell(&self, row: &Row<'_>, index: usize, _sql_type: SqlType) -> Result<Value> {
        let cell = row.get_ref(index).map_err(SqlexError::Execution)?;
        Ok(Value::from_value_ref(cell))
    }

    fn prepare_pagination_sql(&self, sql: &str, inputs: &InputMap, filter: &mut OutputFilter) -> String {
        let limit = get_int_value(inputs, KEY_RECORDS_LIMIT, DEFAULT_PAGINATION_LIMIT);
        let offset = get_int_value(inputs, KEY_RECORDS_OFFSET, 0);

        let upper = sql.to_uppercase();
        let rewritten = if let Some(idx) = upper.rfind(" LIMIT ") {
            // replace an existing trailing LIMIT clause
            format!("{} LIMIT {} OFFSET {}", &sql[..idx], limit, offset)
        } else {
            format!("{} LIMIT {} OFFSET {}", sql, limit, offset)
        };

        filter.insert(format!("{}limit", PAGINATION_META_PREFIX), limit.to_string());
        filter.insert(format!("{}offset", PAGINATION_META_PREFIX), offset.to_string());
        rewritten
    }

    fn generated_key(&self, conn: &Connection, sql: &str) -> Option<i64> {
        // only one auto-generated primary key column is supported, and
        // last_insert_rowid is only meaningful after an INSERT
        if !sql.trim_start().to_uppercase().starts_with("INSERT") {
            return None;
        }
        let rowid = conn.last_insert_rowid();
        if rowid != 0 {
            Some(rowid)
        } else {
            None
        }
    }
}

static SQLITE_ADAPTER: SqliteAdapter = SqliteAdapter;

/// Returns the adapter registered for a vendor.
pub fn adapter_for(vendor: Vendor) -> Result<&'static dyn DbAdapter> {
    match vendor {
        Vendor::Sqlite => Ok(&SQLITE_ADAPTER),
        other => Err(SqlexError::Configuration(format!(
            "no database adapter registered for vendor '{}'",
            other.tag()
        ))),
    }
}
