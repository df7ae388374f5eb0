//! The in-memory query executor and the SQL translation must agree:
//! for every translatable query, filtering cached rows yields the same
//! set (and, when ordered, the same sequence) as running the generated
//! SQL against the same rows loaded into the workspace.

use tdtp_core::codec::encode_row;
use tdtp_core::config::WorkspaceConfig;
use tdtp_core::generator::generate_reference;
use tdtp_core::packet::{Field, Row, Schema};
use tdtp_core::query::{executor, parse, sqlgen};
use tdtp_core::types::FieldType;
use tdtp_engine::Workspace;

fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", FieldType::Integer).key(),
        Field::new("name", FieldType::Text),
        Field::new("age", FieldType::Integer),
        Field::new("city", FieldType::Text),
    ])
}

fn users_rows() -> Vec<Row> {
    [
        (1, "Alice", Some(25), Some("Berlin")),
        (2, "Bob", Some(30), Some("Paris")),
        (3, "Charlie", Some(35), None),
        (4, "David", Some(40), Some("Berlin")),
        (5, "Eve", None, Some("Lima")),
        (6, "Mallory", Some(30), Some("Paris")),
    ]
    .iter()
    .map(|(id, name, age, city)| {
        Row::new(encode_row(&[
            Some(id.to_string()),
            Some(name.to_string()),
            age.map(|a| a.to_string()),
            city.map(|c| c.to_string()),
        ]))
    })
    .collect()
}

async fn workspace_with_users() -> Workspace {
    let ws = Workspace::open(&WorkspaceConfig::default()).await.unwrap();
    let packet = generate_reference("users", &users_schema(), users_rows()).remove(0);
    ws.create_table("users", &packet.schema).await.unwrap();
    ws.load_data("users", &packet).await.unwrap();
    ws
}

async fn both_paths(query_text: &str) -> (Vec<String>, Vec<String>) {
    let query = parse(query_text).unwrap();
    assert!(sqlgen::can_translate(&query));

    let outcome = executor::execute(&query, &users_rows(), &users_schema()).unwrap();
    let in_memory: Vec<String> = outcome.rows.iter().map(|r| r.value.clone()).collect();

    let ws = workspace_with_users().await;
    let sql = sqlgen::to_sql(&query);
    let packet = ws.execute_sql(&sql, "result").await.unwrap();
    let pushed: Vec<String> = packet.data.rows.iter().map(|r| r.value.clone()).collect();
    (in_memory, pushed)
}

#[tokio::test]
async fn ordered_queries_agree_on_sequence() {
    for query in [
        "SELECT * FROM users WHERE age > 30 ORDER BY id",
        "SELECT * FROM users WHERE age >= 30 AND city = 'Paris' ORDER BY id",
        "SELECT * FROM users WHERE city = 'Berlin' OR age < 30 ORDER BY id DESC",
        "SELECT * FROM users WHERE id IN (1, 3, 5) ORDER BY id",
        "SELECT * FROM users WHERE age BETWEEN 30 AND 35 ORDER BY id",
        "SELECT * FROM users WHERE name LIKE '%a%' ORDER BY id",
        "SELECT * FROM users WHERE city IS NULL ORDER BY id",
        "SELECT * FROM users WHERE city IS NOT NULL AND NOT name = 'Bob' ORDER BY id",
        "SELECT * FROM users ORDER BY id LIMIT 2 OFFSET 1",
    ] {
        let (in_memory, pushed) = both_paths(query).await;
        assert_eq!(in_memory, pushed, "sequence mismatch for {query}");
    }
}

#[tokio::test]
async fn unordered_queries_agree_on_set() {
    for query in [
        "SELECT * FROM users WHERE age > 25",
        "SELECT * FROM users WHERE name NOT LIKE 'A%'",
        "SELECT * FROM users WHERE id NOT IN (2, 4)",
    ] {
        let (mut in_memory, mut pushed) = both_paths(query).await;
        in_memory.sort();
        pushed.sort();
        assert_eq!(in_memory, pushed, "set mismatch for {query}");
    }
}

#[tokio::test]
async fn execution_statistics_match_the_data() {
    let query = parse("SELECT * FROM users LIMIT 2 OFFSET 1").unwrap();
    let outcome = executor::execute(&query, &users_rows(), &users_schema()).unwrap();
    assert_eq!(outcome.returned_rows, 2);
    assert!(outcome.more_available);
    assert_eq!(outcome.next_offset, 3);
    assert_eq!(outcome.query_context.results.total_records_in_table, 6);
    assert_eq!(outcome.query_context.results.records_after_filters, 6);
}
