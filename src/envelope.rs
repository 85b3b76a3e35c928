//! Generic result model: envelope, table, row.
//!
//! One execution produces a [`ResultEnvelope`]: scalar outputs (update
//! count, generated key, procedural return code/message), zero or more
//! named tables, and child envelopes for statements that fan out into
//! sub-results. Table keys are upper-cased on insert so lookup is
//! case-insensitive.

use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::Result;
use crate::statement::SqlType;
use crate::value::Value;

/// Reserved scalar keys.
pub const KEY_UPDATED_ROW_COUNT: &str = "UPDATED_ROW_COUNT";
pub const KEY_GENERATED_KEY: &str = "GENERATED_KEY";
pub const KEY_RETURN_CODE: &str = "RETURN_CODE";
pub const KEY_RETURN_MESSAGE: &str = "RETURN_MESSAGE";
pub const KEY_NEW_UPDATE_DATE: &str = "NEW_UPDATE_DATE";
pub const KEY_RETURN_VALUE: &str = "RETURN_VALUE";

/// Sentinel for "not applicable / unsupported". Distinct from zero: an
/// update touching no rows reports 0, a query reports -1.
pub const NOT_APPLICABLE: i64 = -1;

/// One result column: name, declared SQL type and the declared host type
/// string as the driver reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    name: String,
    sql_type: SqlType,
    declared: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: SqlType, declared: Option<String>) -> Self {
        ColumnInfo {
            name: name.into(),
            sql_type,
            declared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn declared(&self) -> Option<&str> {
        self.declared.as_deref()
    }
}

/// Ordered column header shared by every row of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RowInfo {
    columns: Vec<ColumnInfo>,
}

impl RowInfo {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        RowInfo { columns }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&ColumnInfo> {
        self.columns.get(index)
    }

    /// Case-insensitive column position lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One row of cells, positionally aligned 1:1 with the table header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowData {
    cells: Vec<Value>,
}

impl RowData {
    pub fn new(cells: Vec<Value>) -> Self {
        RowData { cells }
    }

    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.cells.get(index)
    }

    pub fn width(&self) -> usize {
        self.cells.len()
    }
}

/// Vendor-neutral tabular result: a header plus rows in cursor order.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TableData {
    header: RowInfo,
    rows: Vec<RowData>,
}

impl TableData {
    pub fn new(header: RowInfo) -> Self {
        TableData {
            header,
            rows: Vec::new(),
        }
    }

    pub fn header(&self) -> &RowInfo {
        &self.header
    }

    /// Appends a row. Rows are kept in insertion (cursor) order; the
    /// caller aligns cells with the header.
    pub fn add_row(&mut self, row: RowData) {
        debug_assert_eq!(row.width(), self.header.width());
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[RowData] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First cell of the first row: the scalar of a single-value query.
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.get(0))
    }

    /// Cell lookup by row position and column name.
    pub fn value_at(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.header.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

/// Generic container for every output of one statement execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultEnvelope {
    statement_name: String,
    scalars: HashMap<String, Value>,
    tables: HashMap<String, TableData>,
    children: Vec<ResultEnvelope>,
    named_children: HashMap<String, ResultEnvelope>,
}

impl ResultEnvelope {
    pub fn new(statement_name: impl Into<String>) -> Self {
        ResultEnvelope {
            statement_name: statement_name.into(),
            ..Default::default()
        }
    }

    /// Name of the statement that produced this envelope.
    pub fn statement_name(&self) -> &str {
        &self.statement_name
    }

    /// Adds a (name, value) pair to the scalar output bag.
    pub fn add_named_value(&mut self, name: impl Into<String>, value: Value) {
        self.scalars.insert(name.into(), value);
    }

    pub fn named_value(&self, name: &str) -> Option<&Value> {
        self.scalars.get(name)
    }

    /// Rows affected by a mutation; [`NOT_APPLICABLE`] for queries and
    /// drivers that cannot report a count.
    pub fn updated_row_count(&self) -> i64 {
        self.scalars
            .get(KEY_UPDATED_ROW_COUNT)
            .and_then(Value::as_i64)
            .unwrap_or(NOT_APPLICABLE)
    }

    pub fn set_updated_row_count(&mut self, count: i64) {
        self.scalars
            .insert(KEY_UPDATED_ROW_COUNT.to_string(), Value::Integer(count));
    }

    /// Generated key of a mutation. Only one auto-generated primary key
    /// column is supported; [`NOT_APPLICABLE`] when the feature does not
    /// apply.
    pub fn generated_key(&self) -> i64 {
        self.scalars
            .get(KEY_GENERATED_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(NOT_APPLICABLE)
    }

    pub fn set_generated_key(&mut self, key: i64) {
        self.scalars
            .insert(KEY_GENERATED_KEY.to_string(), Value::Integer(key));
    }

    /// Return code of a procedural call. Absent for plain statements.
    pub fn return_code(&self) -> Option<String> {
        self.scalars.get(KEY_RETURN_CODE).map(Value::to_string)
    }

    /// Return message of a procedural call. Absent for plain statements.
    pub fn return_message(&self) -> Option<String> {
        self.scalars.get(KEY_RETURN_MESSAGE).map(Value::to_string)
    }

    /// Update timestamp reported by a procedural call, when present.
    pub fn new_update_date(&self) -> Option<NaiveDateTime> {
        let raw = self.scalars.get(KEY_NEW_UPDATE_DATE)?;
        NaiveDateTime::parse_from_str(&raw.to_string(), "%Y-%m-%d %H:%M:%S").ok()
    }

    /// Result of a database function call, when present.
    pub fn function_call_result(&self) -> Option<&Value> {
        self.scalars.get(KEY_RETURN_VALUE)
    }

    /// Stores a table under the case-normalized key, overwriting any
    /// prior table at that key.
    pub fn add_table_data(&mut self, key: &str, table: TableData) {
        self.tables.insert(key.to_uppercase(), table);
    }

    /// Case-insensitive table lookup.
    pub fn get_table_data(&self, key: &str) -> Option<&TableData> {
        self.tables.get(&key.to_uppercase())
    }

    pub fn tables(&self) -> &HashMap<String, TableData> {
        &self.tables
    }

    pub fn add_child(&mut self, child: ResultEnvelope) {
        self.children.push(child);
    }

    pub fn child(&self, index: usize) -> Option<&ResultEnvelope> {
        self.children.get(index)
    }

    pub fn children(&self) -> &[ResultEnvelope] {
        &self.children
    }

    pub fn add_named_child(&mut self, key: &str, child: ResultEnvelope) {
        self.named_children.insert(key.to_uppercase(), child);
    }

    /// Case-insensitive named-child lookup.
    pub fn named_child(&self, key: &str) -> Option<&ResultEnvelope> {
        self.named_children.get(&key.to_uppercase())
    }

    pub fn named_children(&self) -> &HashMap<String, ResultEnvelope> {
        &self.named_children
    }

    /// Serializes the whole envelope, tables and children included.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for ResultEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "statement = {}", self.statement_name)?;
        writeln!(f, "updatedRowCount = {}", self.updated_row_count())?;
        writeln!(f, "generatedKey = {}", self.generated_key())?;
        if let Some(code) = self.return_code() {
            writeln!(f, "returnCode = {}", code)?;
        }
        if let Some(message) = self.return_message() {
            writeln!(f, "returnMessage = {}", message)?;
        }
        for (key, table) in &self.tables {
            writeln!(f, "table {} ({} rows):", key, table.row_count())?;
            writeln!(f, "  {}", table.header().column_names().join(" | "))?;
            for row in table.rows() {
                let cells: Vec<String> = row.cells().iter().map(Value::to_string).collect();
                writeln!(f, "  {}", cells.join(" | "))?;
            }
        }
        for (index, child) in self.children.iter().enumerate() {
            writeln!(f, "child[{}]:", index)?;
            write!(f, "{}", child)?;
        }
        for (key, child) in &self.named_children {
            writeln!(f, "child[{}]:", key)?;
            write!(f, "{}", child)?;
        }
        Ok(())
    }
}
