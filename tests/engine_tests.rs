use std::sync::Once;

use rusqlite::Connection;
use sqlex::core::SqlexError;
use sqlex::engine::{
    StatementProcessor, KEY_RECORDS_FIXED, KEY_RECORDS_LIMIT, KEY_RECORDS_OFFSET,
    KEY_USE_PAGINATION,
};
use sqlex::envelope::NOT_APPLICABLE;
use sqlex::statement::{self, Direction, Parameter, SqlType};
use sqlex::transaction::UserConnection;
use sqlex::value::{InputMap, OutputFilter, Value};
use sqlex::vendor::Vendor;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn people_connection() -> UserConnection {
    init_tracing();
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "
        CREATE TABLE people (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            score REAL,
            age INTEGER
        );
        INSERT INTO people (name, score, age) VALUES ('Alice', 12.5, 34);
        INSERT INTO people (name, score, age) VALUES ('Bob', 7.25, 41);
        INSERT INTO people (name, score, age) VALUES ('Cleo', 99.0, 28);
    ",
    )
    .unwrap();
    UserConnection::new("people", Vendor::Sqlite, conn)
}

#[test]
fn query_round_trip_preserves_cells_and_order() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_round_trip",
        "SELECT id, name, score FROM people WHERE id <= 2 ORDER BY id",
    );

    let mut inputs = InputMap::new();
    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    // queries report the sentinel, not a zero count
    assert_eq!(envelope.updated_row_count(), NOT_APPLICABLE);
    assert_eq!(envelope.generated_key(), NOT_APPLICABLE);

    let table = envelope.get_table_data("people_round_trip").unwrap();
    assert_eq!(table.header().column_names(), ["id", "name", "score"]);
    assert_eq!(table.row_count(), 2);

    let first = &table.rows()[0];
    assert_eq!(first.get(0), Some(&Value::Integer(1)));
    assert_eq!(first.get(1), Some(&Value::from("Alice")));
    assert_eq!(first.get(2), Some(&Value::Real(12.5)));

    let second = &table.rows()[1];
    assert_eq!(second.get(0), Some(&Value::Integer(2)));
    assert_eq!(second.get(1), Some(&Value::from("Bob")));
    assert_eq!(second.get(2), Some(&Value::Real(7.25)));
}

#[test]
fn missing_parameter_names_key_and_supplied_keys() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_by_id",
        "SELECT name FROM people WHERE id = ?id",
    );

    let mut inputs = InputMap::new();
    inputs.insert("unrelated".to_string(), Value::Integer(9));

    let err = StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap_err();
    match err {
        SqlexError::MissingParameter { key, supplied } => {
            assert_eq!(key, "id");
            assert_eq!(supplied, vec!["unrelated".to_string()]);
        }
        other => panic!("expected MissingParameter, got {:?}", other),
    }
}

#[test]
fn named_parameter_binds_and_caches_metadata() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_by_id_bound",
        "SELECT name FROM people WHERE id = ?id",
    );

    let processor = StatementProcessor::new(st.clone());
    let mut inputs = InputMap::new();
    inputs.insert("id".to_string(), Value::Integer(2));
    let envelope = processor.execute(&udc, &mut inputs, None).unwrap();
    assert_eq!(
        envelope
            .get_table_data("people_by_id_bound")
            .unwrap()
            .first_value(),
        Some(&Value::from("Bob"))
    );

    // metadata was installed by the first call and survives the second
    assert!(st.has_loaded_parameter_metadata());
    assert_eq!(st.parameters().len(), 1);
    let envelope = processor.execute(&udc, &mut inputs, None).unwrap();
    assert_eq!(
        envelope
            .get_table_data("people_by_id_bound")
            .unwrap()
            .row_count(),
        1
    );
}

#[test]
fn blank_input_binds_null_for_non_character_types() {
    let udc = people_connection();
    let st = statement::register_statement(
        "insert_person_typed",
        "INSERT INTO people (name, age) VALUES (?name:VARCHAR, ?age:INTEGER)",
    );

    let mut inputs = InputMap::new();
    inputs.insert("name".to_string(), Value::from("Zed"));
    inputs.insert("age".to_string(), Value::from("   "));
    StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    let count: i64 = udc
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM people WHERE name = 'Zed' AND age IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn blank_input_stays_text_for_character_types() {
    let udc = people_connection();
    let st = statement::register_statement(
        "insert_person_blank_name",
        "INSERT INTO people (name, age) VALUES (?name:VARCHAR, ?age:INTEGER)",
    );

    let mut inputs = InputMap::new();
    inputs.insert("name".to_string(), Value::from(""));
    inputs.insert("age".to_string(), Value::Integer(50));
    StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    let count: i64 = udc
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM people WHERE name = '' AND age = 50",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn null_input_binds_null_even_for_character_types() {
    let udc = people_connection();
    let st = statement::register_statement_with_parameters(
        "insert_person_null_name",
        "INSERT INTO people (name, age) VALUES (?name, ?age)",
        vec![
            Parameter::new("name", 1, Direction::In, SqlType::Varchar),
            Parameter::new("age", 2, Direction::In, SqlType::Integer),
        ],
    );

    let mut inputs = InputMap::new();
    inputs.insert("name".to_string(), Value::Null);
    inputs.insert("age".to_string(), Value::Integer(61));
    StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    let count: i64 = udc
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM people WHERE name IS NULL AND age = 61",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn mutation_reports_count_and_generated_key() {
    let udc = people_connection();
    let insert = statement::register_statement(
        "insert_person_keyed",
        "INSERT INTO people (name, age) VALUES (?name, ?age)",
    );

    let mut inputs = InputMap::new();
    inputs.insert("name".to_string(), Value::from("Dana"));
    inputs.insert("age".to_string(), Value::Integer(23));
    let envelope = StatementProcessor::new(insert)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    assert_eq!(envelope.updated_row_count(), 1);
    // three seeded rows, so the generated key is the fourth rowid
    assert_eq!(envelope.generated_key(), 4);

    let update = statement::register_statement(
        "age_everyone",
        "UPDATE people SET age = age + 1",
    );
    let envelope = StatementProcessor::new(update)
        .execute(&udc, &mut InputMap::new(), None)
        .unwrap();
    assert_eq!(envelope.updated_row_count(), 4);
    assert_eq!(envelope.generated_key(), NOT_APPLICABLE);
}

#[test]
fn filtered_capture_keeps_subset_in_cursor_order() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_filtered",
        "SELECT id, name, score FROM people ORDER BY id",
    );

    // filter values name the columns; insertion order must not matter
    let mut filter = OutputFilter::new();
    filter.insert("second".to_string(), "SCORE".to_string());
    filter.insert("first".to_string(), "id".to_string());

    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut InputMap::new(), Some(&filter))
        .unwrap();

    let table = envelope.get_table_data("people_filtered").unwrap();
    assert_eq!(table.header().column_names(), ["id", "score"]);
    assert_eq!(table.row_count(), 3);
    for row in table.rows() {
        assert_eq!(row.width(), 2);
    }
    assert_eq!(table.value_at(2, "score"), Some(&Value::Real(99.0)));
}

#[test]
fn pathological_filter_captures_nothing() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_bad_filter",
        "SELECT id, name FROM people",
    );

    let mut filter = OutputFilter::new();
    filter.insert("out".to_string(), "no_such_column".to_string());

    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut InputMap::new(), Some(&filter))
        .unwrap();

    let table = envelope.get_table_data("people_bad_filter").unwrap();
    assert_eq!(table.header().width(), 0);
    assert_eq!(table.row_count(), 0);
}

#[test]
fn row_limit_without_fixed_flag_triggers_pagination() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_paged",
        "SELECT id FROM people ORDER BY id",
    );
    let processor = StatementProcessor::new(st);

    let mut inputs = InputMap::new();
    inputs.insert(KEY_RECORDS_LIMIT.to_string(), Value::Integer(2));
    inputs.insert(KEY_RECORDS_OFFSET.to_string(), Value::Integer(1));
    let envelope = processor.execute(&udc, &mut inputs, None).unwrap();

    // rewritten query, original table key
    let table = envelope.get_table_data("people_paged").unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.rows()[0].get(0), Some(&Value::Integer(2)));
    assert_eq!(table.rows()[1].get(0), Some(&Value::Integer(3)));
}

#[test]
fn fixed_records_flag_suppresses_pagination() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_fixed",
        "SELECT id FROM people ORDER BY id",
    );

    let mut inputs = InputMap::new();
    inputs.insert(KEY_RECORDS_LIMIT.to_string(), Value::Integer(2));
    inputs.insert(KEY_RECORDS_FIXED.to_string(), Value::from(true));
    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    assert_eq!(envelope.get_table_data("people_fixed").unwrap().row_count(), 3);
}

#[test]
fn explicit_pagination_flag_uses_default_limit() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_explicit_page",
        "SELECT id FROM people ORDER BY id",
    );

    let mut inputs = InputMap::new();
    inputs.insert(KEY_USE_PAGINATION.to_string(), Value::from(true));
    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    // three rows fit well inside the default page
    assert_eq!(
        envelope
            .get_table_data("people_explicit_page")
            .unwrap()
            .row_count(),
        3
    );
}

#[test]
fn auto_fill_runs_dependent_statement_first() {
    let udc = people_connection();
    statement::register_statement("max_person_id", "SELECT MAX(id) FROM people");
    let st = statement::register_statement(
        "latest_person",
        "SELECT name FROM people WHERE id = ?@max_person_id",
    );

    let mut inputs = InputMap::new();
    let envelope = StatementProcessor::new(st)
        .execute(&udc, &mut inputs, None)
        .unwrap();

    // the derived input is visible to the caller afterwards
    assert_eq!(inputs.get("@max_person_id"), Some(&Value::Integer(3)));
    assert_eq!(
        envelope.get_table_data("latest_person").unwrap().first_value(),
        Some(&Value::from("Cleo"))
    );
}

#[test]
fn auto_fill_with_unregistered_statement_fails() {
    let udc = people_connection();
    let st = statement::register_statement(
        "needs_missing_dependency",
        "SELECT name FROM people WHERE id = ?@never_registered",
    );

    let err = StatementProcessor::new(st)
        .execute(&udc, &mut InputMap::new(), None)
        .unwrap_err();
    assert!(matches!(err, SqlexError::Statement(_)));
}

#[test]
fn replacement_marker_splices_before_prepare() {
    let udc = people_connection();
    let st = statement::register_statement(
        "people_ordered_by_marker",
        "SELECT id FROM people ORDER BY {order_col} DESC",
    );
    let processor = StatementProcessor::new(st);

    let mut inputs = InputMap::new();
    inputs.insert("order_col".to_string(), Value::from("id"));
    let envelope = processor.execute(&udc, &mut inputs, None).unwrap();
    assert_eq!(
        envelope
            .get_table_data("people_ordered_by_marker")
            .unwrap()
            .rows()[0]
            .get(0),
        Some(&Value::Integer(3))
    );

    let err = processor
        .execute(&udc, &mut InputMap::new(), None)
        .unwrap_err();
    match err {
        SqlexError::MissingReplacement(marker) => assert_eq!(marker, "{order_col}"),
        other => panic!("expected MissingReplacement, got {:?}", other),
    }
}

#[test]
fn driver_failure_surfaces_as_execution_error() {
    let udc = people_connection();
    let st = statement::register_statement(
        "broken_query",
        "SELECT * FROM no_such_table",
    );

    let err = StatementProcessor::new(st)
        .execute(&udc, &mut InputMap::new(), None)
        .unwrap_err();
    assert!(matches!(err, SqlexError::Execution(_)));
}
