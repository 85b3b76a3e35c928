//! Statement definitions and the process-wide statement store.
//!
//! A [`StatementDefinition`] is the immutable-after-discovery description
//! of one named SQL statement: its raw text, the executable text with
//! markers rewritten to driver syntax, its kind, and the ordered parameter
//! list. Parameter metadata is installed exactly once per definition;
//! concurrent first executions race safely through a `OnceCell`.
//!
//! ## Raw statement micro-syntax
//!
//! - `?name` and `?name:VARCHAR` declare a named parameter (with an
//!   optional declared-type hint); the executable form is `:name`.
//! - `?@key` declares an auto-fill dependency: the statement named `key`
//!   runs first and its first scalar becomes input `@key`. Executable
//!   form is `@key`.
//! - A bare `?` is a positional parameter named by its ordinal.
//!
//! Marker tokens are delimited by whitespace and the literal characters
//! `,><=(){}`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::{Lazy, OnceCell};
use serde::Serialize;

use crate::core::{Result, SqlexError};

/// Declared SQL type of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SqlType {
    Char,
    Varchar,
    LongVarchar,
    Clob,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Decimal,
    Real,
    Double,
    Float,
    Date,
    Time,
    Timestamp,
    Boolean,
    Blob,
    Unknown,
}

impl SqlType {
    /// Parses a declared-type string such as `VARCHAR(40)` or `integer`.
    pub fn from_decl(decl: &str) -> SqlType {
        let base: String = decl
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_uppercase();
        match base.as_str() {
            "CHAR" | "CHARACTER" | "NCHAR" => SqlType::Char,
            "VARCHAR" | "NVARCHAR" | "TEXT" => SqlType::Varchar,
            "LONGVARCHAR" => SqlType::LongVarchar,
            "CLOB" => SqlType::Clob,
            "TINYINT" | "SMALLINT" => SqlType::SmallInt,
            "INT" | "INTEGER" | "MEDIUMINT" => SqlType::Integer,
            "BIGINT" => SqlType::BigInt,
            "NUMERIC" => SqlType::Numeric,
            "DECIMAL" => SqlType::Decimal,
            "REAL" => SqlType::Real,
            "DOUBLE" => SqlType::Double,
            "FLOAT" => SqlType::Float,
            "DATE" => SqlType::Date,
            "TIME" => SqlType::Time,
            "TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
            "BOOLEAN" | "BOOL" => SqlType::Boolean,
            "BLOB" => SqlType::Blob,
            _ => SqlType::Unknown,
        }
    }

    /// The character family: blank text still binds as text for these,
    /// while every other declared type turns blank text into SQL NULL.
    pub fn is_character(&self) -> bool {
        matches!(self, SqlType::Char | SqlType::Varchar | SqlType::LongVarchar)
    }
}

/// Parameter direction. Only `In` parameters are bound by the engine;
/// the other directions model procedural statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    In,
    Out,
    InOut,
    Return,
}

/// One declared statement parameter. Order of the parameter list defines
/// bind order; `index` is the 1-based driver ordinal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    name: String,
    index: usize,
    direction: Direction,
    sql_type: SqlType,
}

impl Parameter {
    pub fn new(name: impl Into<String>, index: usize, direction: Direction, sql_type: SqlType) -> Self {
        Parameter {
            name: name.into(),
            index,
            direction,
            sql_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }
}

/// Statement kind: does execution produce a cursor or an update count?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Query,
    Mutation,
}

impl StatementKind {
    /// Classifies a statement from its leading keyword. Anything that is
    /// not row-producing counts as a mutation.
    pub fn from_sql(sql: &str) -> Self {
        let upper = sql.trim_start().to_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") || upper.starts_with("VALUES") {
            StatementKind::Query
        } else {
            StatementKind::Mutation
        }
    }
}

/// Named, reusable description of one parameterized SQL statement.
#[derive(Debug)]
pub struct StatementDefinition {
    name: String,
    raw_sql: String,
    executable_sql: String,
    kind: StatementKind,
    parameters: OnceCell<Vec<Parameter>>,
}

impl StatementDefinition {
    /// Builds a definition, rewriting raw markers into executable driver
    /// syntax. Parameter metadata is left for lazy discovery.
    pub fn new(name: impl Into<String>, raw_sql: impl Into<String>) -> Self {
        let raw_sql = raw_sql.into();
        let executable_sql = rewrite_markers(&raw_sql);
        let kind = StatementKind::from_sql(&raw_sql);
        StatementDefinition {
            name: name.into(),
            raw_sql,
            executable_sql,
            kind,
            parameters: OnceCell::new(),
        }
    }

    /// Builds a definition with explicitly registered parameters, skipping
    /// discovery entirely.
    pub fn with_parameters(
        name: impl Into<String>,
        raw_sql: impl Into<String>,
        parameters: Vec<Parameter>,
    ) -> Self {
        let st = StatementDefinition::new(name, raw_sql);
        let _ = st.parameters.set(parameters);
        st
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_sql(&self) -> &str {
        &self.raw_sql
    }

    pub fn executable_sql(&self) -> &str {
        &self.executable_sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_query(&self) -> bool {
        self.kind == StatementKind::Query
    }

    /// Whether parameter metadata has been installed.
    pub fn has_loaded_parameter_metadata(&self) -> bool {
        self.parameters.get().is_some()
    }

    /// Installs discovered parameters. First install wins; later calls
    /// return the already-installed list unchanged.
    pub fn install_parameters(&self, parameters: Vec<Parameter>) -> &[Parameter] {
        self.parameters.get_or_init(|| parameters)
    }

    /// The declared parameter list, empty until installed.
    pub fn parameters(&self) -> &[Parameter] {
        self.parameters.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

const MARKER_DELIMITERS: &str = " \t\r\n,><=(){}";

fn is_marker_delimiter(c: char) -> bool {
    MARKER_DELIMITERS.contains(c)
}

/// Rewrites raw parameter markers into the driver's named-parameter
/// syntax: `?name` and `?name:TYPE` become `:name`, `?@key` becomes
/// `@key`, bare `?` stays as is.
fn rewrite_markers(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut token = String::new();
    for c in raw.chars() {
        if is_marker_delimiter(c) {
            push_rewritten(&mut out, &token);
            token.clear();
            out.push(c);
        } else {
            token.push(c);
        }
    }
    push_rewritten(&mut out, &token);
    out
}

fn push_rewritten(out: &mut String, token: &str) {
    if let Some(key) = token.strip_prefix("?@") {
        if !key.is_empty() {
            out.push('@');
            out.push_str(key);
            return;
        }
    } else if let Some(rest) = token.strip_prefix('?') {
        if !rest.is_empty() {
            let name = rest.splitn(2, ':').next().unwrap_or(rest);
            out.push(':');
            out.push_str(name);
            return;
        }
    }
    out.push_str(token);
}

/// Parses the raw statement text into an ordered parameter list: one
/// parameter per distinct marker, in first-appearance order, matching the
/// driver's named-parameter numbering.
pub fn parse_parameters(raw: &str) -> Vec<Parameter> {
    let mut parameters: Vec<Parameter> = Vec::new();
    for token in raw.split(is_marker_delimiter).filter(|t| !t.is_empty()) {
        if let Some(key) = token.strip_prefix("?@") {
            if !key.is_empty() {
                push_unique(&mut parameters, format!("@{}", key), SqlType::Unknown);
            }
        } else if let Some(rest) = token.strip_prefix('?') {
            if rest.is_empty() {
                // bare positional marker, named by ordinal
                let ordinal = parameters.len() + 1;
                parameters.push(Parameter::new(
                    ordinal.to_string(),
                    ordinal,
                    Direction::In,
                    SqlType::Unknown,
                ));
            } else {
                let mut parts = rest.splitn(2, ':');
                let name = parts.next().unwrap_or(rest).to_string();
                let sql_type = parts.next().map(SqlType::from_decl).unwrap_or(SqlType::Unknown);
                push_unique(&mut parameters, name, sql_type);
            }
        }
    }
    parameters
}

/// Collects `?@key` auto-fill keys from the raw statement text, one entry
/// per token occurrence, in order.
pub fn auto_fill_keys(raw: &str) -> Vec<String> {
    raw.split(is_marker_delimiter)
        .filter_map(|token| token.strip_prefix("?@"))
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn push_unique(parameters: &mut Vec<Parameter>, name: String, sql_type: SqlType) {
    if parameters.iter().any(|p| p.name() == name) {
        return;
    }
    let index = parameters.len() + 1;
    parameters.push(Parameter::new(name, index, Direction::In, sql_type));
}

/// Loads parameter metadata from a prepared statement, for adapters whose
/// driver exposes it. Declared types stay unknown; SQLite reports names
/// and count only.
pub fn load_parameters_from_statement(stmt: &rusqlite::Statement<'_>) -> Vec<Parameter> {
    let count = stmt.parameter_count();
    (1..=count)
        .map(|i| {
            let name = match stmt.parameter_name(i) {
                Some(n) => match n.strip_prefix(':') {
                    Some(stripped) => stripped.to_string(),
                    // '@key' markers keep their prefix to match input keys
                    None => n.to_string(),
                },
                None => i.to_string(),
            };
            Parameter::new(name, i, Direction::In, SqlType::Unknown)
        })
        .collect()
}

/// Process-wide statement store, keyed by statement name. Definitions
/// live for the process lifetime unless explicitly invalidated.
static STATEMENT_STORE: Lazy<RwLock<HashMap<String, Arc<StatementDefinition>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a statement under `name`, replacing any prior definition.
pub fn register_statement(name: &str, raw_sql: &str) -> Arc<StatementDefinition> {
    let st = Arc::new(StatementDefinition::new(name, raw_sql));
    STATEMENT_STORE
        .write()
        .expect("statement store poisoned")
        .insert(name.to_string(), Arc::clone(&st));
    st
}

/// Registers a statement with explicit parameters, replacing any prior
/// definition.
pub fn register_statement_with_parameters(
    name: &str,
    raw_sql: &str,
    parameters: Vec<Parameter>,
) -> Arc<StatementDefinition> {
    let st = Arc::new(StatementDefinition::with_parameters(name, raw_sql, parameters));
    STATEMENT_STORE
        .write()
        .expect("statement store poisoned")
        .insert(name.to_string(), Arc::clone(&st));
    st
}

/// Looks a statement up by name.
pub fn find_statement(name: &str) -> Option<Arc<StatementDefinition>> {
    STATEMENT_STORE
        .read()
        .expect("statement store poisoned")
        .get(name)
        .cloned()
}

/// Looks a statement up by name, failing if it was never registered.
pub fn resolve_statement(name: &str) -> Result<Arc<StatementDefinition>> {
    find_statement(name)
        .ok_or_else(|| SqlexError::Statement(format!("no statement registered under '{}'", name)))
}

/// Resolves a definition for statement text produced at run time, such as
/// a pagination rewrite. The text itself is the cache key, so repeated
/// rewrites of the same statement reuse one definition.
pub fn find_or_discover(sql_text: &str) -> Arc<StatementDefinition> {
    if let Some(st) = find_statement(sql_text) {
        return st;
    }
    register_statement(sql_text, sql_text)
}

/// Drops one cached definition.
pub fn invalidate_statement(name: &str) {
    STATEMENT_STORE
        .write()
        .expect("statement store poisoned")
        .remove(name);
}

/// Drops every cached definition.
pub fn clear_statements() {
    STATEMENT_STORE
        .write()
        .expect("statement store poisoned")
        .clear();
}
