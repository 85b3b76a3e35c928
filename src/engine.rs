//! Dynamic statement execution engine.
//!
//! [`StatementProcessor::execute`] turns a statement definition, a live
//! connection and an input map into a [`ResultEnvelope`]. The steps run
//! in a fixed order: auto-fill dependent sub-statements, decide on
//! pagination rewriting, splice replacement markers, resolve parameter
//! metadata, bind in declared order, dispatch, capture. Prepared
//! statements and cursors are released on every exit path by drop
//! scoping; the engine never retries.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Statement;
use tracing::debug;

use crate::core::{Result, SqlexError};
use crate::envelope::{ColumnInfo, ResultEnvelope, RowData, RowInfo, TableData};
use crate::statement::{self, Direction, Parameter, SqlType, StatementDefinition};
use crate::transaction::UserConnection;
use crate::value::{get_bool_value, get_int_value, InputMap, OutputFilter, Value};
use crate::vendor::{adapter_for, DbAdapter};

/// Input keys steering pagination.
pub const KEY_USE_PAGINATION: &str = "use_pagination";
pub const KEY_RECORDS_LIMIT: &str = "records_limit";
pub const KEY_RECORDS_OFFSET: &str = "records_offset";
pub const KEY_RECORDS_FIXED: &str = "records_fixed";

/// "No row limit requested."
pub const NO_ROW_LIMIT: i64 = -1;

/// Page size used when pagination is requested without an explicit limit.
pub const DEFAULT_PAGINATION_LIMIT: i64 = 10;

/// Output-filter keys carrying pagination metadata start with this prefix
/// and never name allowed columns.
pub const PAGINATION_META_PREFIX: &str = "page.";

/// Replacement marker delimiters, matched literally in the statement text.
pub const REPLACE_PART_START: char = '{';
pub const REPLACE_PART_END: char = '}';

/// Executes one named statement against a live connection.
pub struct StatementProcessor {
    st: Arc<StatementDefinition>,
}

impl StatementProcessor {
    pub fn new(st: Arc<StatementDefinition>) -> Self {
        StatementProcessor { st }
    }

    /// Resolves the named statement from the process-wide store.
    pub fn for_statement(name: &str) -> Result<Self> {
        Ok(StatementProcessor::new(statement::resolve_statement(name)?))
    }

    /// Binds the input map, executes and captures results.
    ///
    /// # Errors
    ///
    /// `MissingParameter` / `MissingReplacement` when the input map is
    /// incomplete, `Execution` for any driver failure during
    /// prepare/bind/execute. Failures abort the whole call.
    pub fn execute(
        &self,
        udc: &UserConnection,
        inputs: &mut InputMap,
        output_filter: Option<&OutputFilter>,
    ) -> Result<ResultEnvelope> {
        let dba = adapter_for(udc.vendor())?;
        let st_name = self.st.name().to_string();
        let mut envelope = ResultEnvelope::new(&st_name);

        self.auto_fill(udc, inputs)?;

        // Pagination rewrites produce a new definition cached under the
        // rewritten text; the originally resolved definition stays
        // untouched for concurrent callers.
        let mut st = Arc::clone(&self.st);
        let mut filter: Option<OutputFilter> = output_filter.cloned();
        if check_pagination(&st, inputs) {
            let mut fresh = OutputFilter::new();
            let rewritten = dba.prepare_pagination_sql(st.raw_sql(), inputs, &mut fresh);
            debug!(statement = %st_name, sql = %rewritten, "pagination rewrite");
            st = statement::find_or_discover(&rewritten);
            filter = Some(fresh);
        }

        let executable = auto_replace(st.executable_sql(), inputs)?;
        debug!(statement = %st_name, sql = %executable, "executing");

        let conn = udc.connection();
        let mut pstmt = conn.prepare(&executable).map_err(SqlexError::Execution)?;

        if !st.has_loaded_parameter_metadata() {
            let parameters = if dba.supports_parameter_metadata() {
                statement::load_parameters_from_statement(&pstmt)
            } else {
                statement::parse_parameters(st.raw_sql())
            };
            st.install_parameters(parameters);
        }

        bind_parameters(dba, &mut pstmt, st.parameters(), inputs)?;

        if st.is_query() {
            let header = read_header(&pstmt);
            let allowed = allowed_columns(filter.as_ref());
            let mut rows = pstmt.raw_query();
            match allowed {
                Some(cols) if !cols.is_empty() => {
                    capture_filtered(dba, &st_name, &mut envelope, &header, &mut rows, &cols)?
                }
                _ => capture_all(dba, &st_name, &mut envelope, &header, &mut rows)?,
            }
        } else {
            let count = pstmt.raw_execute().map_err(SqlexError::Execution)?;
            envelope.set_updated_row_count(count as i64);
            if dba.supports_generated_keys() {
                if let Some(key) = dba.generated_key(conn, st.raw_sql()) {
                    envelope.set_generated_key(key);
                }
            }
        }

        Ok(envelope)
    }

    /// Resolves `?@key` dependency tokens: executes the statement named
    /// `key` with the same input map and injects its first scalar under
    /// input key `@key`, so the main statement can bind a value derived
    /// from another statement's output.
    fn auto_fill(&self, udc: &UserConnection, inputs: &mut InputMap) -> Result<()> {
        let raw = self.st.raw_sql();
        if !raw.contains("?@") {
            return Ok(());
        }

        for key in statement::auto_fill_keys(raw) {
            let sub = statement::resolve_statement(&key)?;
            let child = StatementProcessor::new(sub).execute(udc, inputs, None)?;
            let value = child
                .get_table_data(&key)
                .ok_or_else(|| {
                    SqlexError::Statement(format!("auto-fill statement '{}' returned no table", key))
                })?
                .first_value()
                .cloned()
                .unwrap_or(Value::Null);
            debug!(key = %key, value = %value, "auto-fill resolved");
            inputs.insert(format!("@{}", key), value);
        }
        Ok(())
    }
}

/// A query statement paginates when the input map asks for it outright,
/// or when a positive row limit is requested without the fixed-records
/// flag.
pub fn check_pagination(st: &StatementDefinition, inputs: &InputMap) -> bool {
    if !st.is_query() {
        return false;
    }
    let mut use_pagination = get_bool_value(inputs, KEY_USE_PAGINATION, false);
    if !use_pagination {
        let limit = get_int_value(inputs, KEY_RECORDS_LIMIT, NO_ROW_LIMIT);
        let fixed = get_bool_value(inputs, KEY_RECORDS_FIXED, false);
        if limit != NO_ROW_LIMIT && limit > 0 && !fixed {
            use_pagination = true;
        }
    }
    use_pagination
}

/// Splices `{key}` replacement markers with the textual form of the
/// matching input. This is literal text substitution before the statement
/// is prepared, not parameter binding.
pub fn auto_replace(original: &str, inputs: &InputMap) -> Result<String> {
    if !original.contains(REPLACE_PART_START) && !original.contains(REPLACE_PART_END) {
        return Ok(original.to_string());
    }

    let mut markers: Vec<&str> = Vec::new();
    for token in original.split([' ', ',']) {
        if token.len() >= 2
            && token.starts_with(REPLACE_PART_START)
            && token.ends_with(REPLACE_PART_END)
            && !markers.contains(&token)
        {
            markers.push(token);
        }
    }

    let mut replaced = original.to_string();
    for marker in markers {
        let key = &marker[1..marker.len() - 1];
        let text = match inputs.get(key) {
            Some(v) if !v.is_null() => v.to_string(),
            _ => return Err(SqlexError::MissingReplacement(marker.to_string())),
        };
        replaced = replaced.replace(marker, &text);
    }
    Ok(replaced)
}

/// Binds every declared parameter in order. A missing input key fails
/// immediately, naming the key and everything that was supplied.
fn bind_parameters(
    dba: &dyn DbAdapter,
    pstmt: &mut Statement<'_>,
    parameters: &[Parameter],
    inputs: &InputMap,
) -> Result<()> {
    for p in parameters {
        let value = inputs.get(p.name()).ok_or_else(|| {
            let mut supplied: Vec<String> = inputs.keys().cloned().collect();
            supplied.sort();
            SqlexError::MissingParameter {
                key: p.name().to_string(),
                supplied,
            }
        })?;

        if p.direction() != Direction::In {
            continue;
        }

        if value.is_null() || (value.is_blank_text() && !p.sql_type().is_character()) {
            pstmt
                .raw_bind_parameter(p.index(), &Value::Null)
                .map_err(SqlexError::Execution)?;
        } else if !dba.bind_value(pstmt, p, value, inputs)? {
            if p.sql_type() != SqlType::Unknown {
                bind_typed(pstmt, p, value)?;
            } else {
                // unknown declared type: let the driver decide from the
                // value's own storage class
                pstmt
                    .raw_bind_parameter(p.index(), value)
                    .map_err(SqlexError::Execution)?;
            }
        }
    }
    Ok(())
}

fn bind_typed(pstmt: &mut Statement<'_>, p: &Parameter, value: &Value) -> Result<()> {
    let coerced = coerce_to_type(value, p.sql_type()).ok_or_else(|| {
        SqlexError::Statement(format!(
            "cannot bind value '{}' as {:?} for parameter '{}'",
            value,
            p.sql_type(),
            p.name()
        ))
    })?;
    pstmt
        .raw_bind_parameter(p.index(), &coerced)
        .map_err(SqlexError::Execution)
}

fn coerce_to_type(value: &Value, sql_type: SqlType) -> Option<Value> {
    match sql_type {
        SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => value.as_i64().map(Value::Integer),
        SqlType::Boolean => value.as_bool().map(Value::from),
        SqlType::Numeric | SqlType::Decimal | SqlType::Real | SqlType::Double | SqlType::Float => {
            value.as_f64().map(Value::Real)
        }
        SqlType::Char
        | SqlType::Varchar
        | SqlType::LongVarchar
        | SqlType::Clob
        | SqlType::Date
        | SqlType::Time
        | SqlType::Timestamp => Some(Value::Text(value.to_string())),
        SqlType::Blob => match value {
            Value::Blob(_) => Some(value.clone()),
            _ => None,
        },
        SqlType::Unknown => Some(value.clone()),
    }
}

/// The allowed-column set of an output filter: upper-cased filter values,
/// excluding pagination-metadata entries. `None` (and a filter with no
/// column entries) means unfiltered capture.
fn allowed_columns(filter: Option<&OutputFilter>) -> Option<HashSet<String>> {
    filter.map(|f| {
        f.iter()
            .filter(|(key, _)| !key.starts_with(PAGINATION_META_PREFIX))
            .map(|(_, column)| column.to_uppercase())
            .collect()
    })
}

fn read_header(pstmt: &Statement<'_>) -> RowInfo {
    let columns = pstmt
        .columns()
        .iter()
        .map(|c| {
            let declared = c.decl_type().map(|d| d.to_string());
            let sql_type = declared
                .as_deref()
                .map(SqlType::from_decl)
                .unwrap_or(SqlType::Unknown);
            ColumnInfo::new(c.name(), sql_type, declared)
        })
        .collect();
    RowInfo::new(columns)
}

fn capture_all(
    dba: &dyn DbAdapter,
    key: &str,
    envelope: &mut ResultEnvelope,
    header: &RowInfo,
    rows: &mut rusqlite::Rows<'_>,
) -> Result<()> {
    let width = header.width();
    let mut table = TableData::new(header.clone());
    while let Some(row) = rows.next().map_err(SqlexError::Execution)? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            let sql_type = header.column(i).map(ColumnInfo::sql_type).unwrap_or(SqlType::Unknown);
            cells.push(dba.read_cell(row, i, sql_type)?);
        }
        table.add_row(RowData::new(cells));
    }
    envelope.add_table_data(key, table);
    Ok(())
}

fn capture_filtered(
    dba: &dyn DbAdapter,
    key: &str,
    envelope: &mut ResultEnvelope,
    header: &RowInfo,
    rows: &mut rusqlite::Rows<'_>,
    allowed: &HashSet<String>,
) -> Result<()> {
    // reduced header keeps allowed columns in cursor order
    let keep: Vec<usize> = (0..header.width())
        .filter(|&i| {
            header
                .column(i)
                .map(|c| allowed.contains(&c.name().to_uppercase()))
                .unwrap_or(false)
        })
        .collect();
    let reduced = RowInfo::new(
        keep.iter()
            .filter_map(|&i| header.column(i).cloned())
            .collect(),
    );

    let mut table = TableData::new(reduced);
    while let Some(row) = rows.next().map_err(SqlexError::Execution)? {
        let mut cells = Vec::with_capacity(keep.len());
        for &i in &keep {
            let sql_type = header.column(i).map(ColumnInfo::sql_type).unwrap_or(SqlType::Unknown);
            cells.push(dba.read_cell(row, i, sql_type)?);
        }
        // guards pathological filters that match no column
        if !cells.is_empty() {
            table.add_row(RowData::new(cells));
        }
    }
    envelope.add_table_data(key, table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_pagination_rules() {
        let query = StatementDefinition::new("q", "SELECT * FROM t");
        let mutation = StatementDefinition::new("m", "DELETE FROM t");

        let mut inputs = InputMap::new();
        assert!(!check_pagination(&query, &inputs));

        inputs.insert(KEY_RECORDS_LIMIT.to_string(), Value::Integer(10));
        assert!(check_pagination(&query, &inputs));
        assert!(!check_pagination(&mutation, &inputs));

        inputs.insert(KEY_RECORDS_FIXED.to_string(), Value::from(true));
        assert!(!check_pagination(&query, &inputs));

        inputs.insert(KEY_USE_PAGINATION.to_string(), Value::from(true));
        assert!(check_pagination(&query, &inputs));

        let mut zero = InputMap::new();
        zero.insert(KEY_RECORDS_LIMIT.to_string(), Value::Integer(0));
        assert!(!check_pagination(&query, &zero));
    }

    #[test]
    fn test_auto_replace_splices_text() {
        let mut inputs = InputMap::new();
        inputs.insert("order_by".to_string(), Value::from("name DESC"));
        inputs.insert("tbl".to_string(), Value::from("users"));

        let sql = auto_replace("SELECT * FROM {tbl} ORDER BY {order_by}", &inputs).unwrap();
        assert_eq!(sql, "SELECT * FROM users ORDER BY name DESC");
    }

    #[test]
    fn test_auto_replace_without_markers_is_identity() {
        let inputs = InputMap::new();
        let sql = auto_replace("SELECT 1", &inputs).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn test_auto_replace_missing_key_fails() {
        let inputs = InputMap::new();
        let result = auto_replace("SELECT * FROM {tbl}", &inputs);
        match result {
            Err(SqlexError::MissingReplacement(marker)) => assert_eq!(marker, "{tbl}"),
            other => panic!("expected MissingReplacement, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_replace_null_counts_as_missing() {
        let mut inputs = InputMap::new();
        inputs.insert("tbl".to_string(), Value::Null);
        assert!(matches!(
            auto_replace("SELECT * FROM {tbl}", &inputs),
            Err(SqlexError::MissingReplacement(_))
        ));
    }

    #[test]
    fn test_allowed_columns_skips_pagination_metadata() {
        let mut filter = OutputFilter::new();
        filter.insert("page.limit".to_string(), "10".to_string());
        filter.insert("out".to_string(), "id".to_string());

        let allowed = allowed_columns(Some(&filter)).unwrap();
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains("ID"));

        let mut meta_only = OutputFilter::new();
        meta_only.insert("page.offset".to_string(), "0".to_string());
        assert!(allowed_columns(Some(&meta_only)).unwrap().is_empty());

        assert!(allowed_columns(None).is_none());
    }

    #[test]
    fn test_coercion_by_declared_type() {
        assert_eq!(
            coerce_to_type(&Value::from("42"), SqlType::Integer),
            Some(Value::Integer(42))
        );
        assert_eq!(
            coerce_to_type(&Value::Integer(5), SqlType::Varchar),
            Some(Value::from("5"))
        );
        assert_eq!(coerce_to_type(&Value::from("abc"), SqlType::Integer), None);
        assert_eq!(
            coerce_to_type(&Value::from("true"), SqlType::Boolean),
            Some(Value::Integer(1))
        );
        assert_eq!(coerce_to_type(&Value::from("x"), SqlType::Blob), None);
    }
}
