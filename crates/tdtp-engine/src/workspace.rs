//! The embedded SQL workspace.
//!
//! An ephemeral SQLite database (in memory or on disk) the loader
//! populates and the transformation SQL runs against. The connection is
//! driven through `spawn_blocking`; the streaming path hands rows to a
//! bounded channel so results never accumulate in memory.

use std::sync::{Arc, Mutex};

use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tdtp_core::codec::decode_row;
use tdtp_core::config::WorkspaceConfig;
use tdtp_core::packet::{Field, Packet, Row, Schema};
use tdtp_core::types::{parse_value, FieldType, TypedValue};
use tdtp_core::TdtpError;
use tdtp_io::adapter_common::single_reference_packet;
use tdtp_io::dialect::{self, Dialect};

/// SQLite's bound-parameter ceiling.
const MAX_PARAMS: usize = 999;

/// Streaming row channel depth.
const STREAM_BUFFER: usize = 100;

pub struct Workspace {
    conn: Arc<Mutex<Connection>>,
}

/// Streaming result: the schema up front, rows over a bounded channel,
/// and at most one terminal error on a separate channel. The producer
/// closing the row channel is the graceful end.
pub struct SqlStream {
    pub table: String,
    pub schema: Schema,
    pub rows: mpsc::Receiver<Vec<Option<String>>>,
    pub errors: mpsc::Receiver<TdtpError>,
}

impl Workspace {
    /// Open the workspace and apply the performance pragmas.
    pub async fn open(config: &WorkspaceConfig) -> Result<Self, TdtpError> {
        let mode = config.mode.clone();
        let is_memory = config.is_memory();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, TdtpError> {
            let conn = if is_memory {
                Connection::open_in_memory()
            } else {
                Connection::open(&mode)
            }
            .map_err(ws_err)?;
            // case_sensitive_like keeps SQL-pushed LIKE in agreement
            // with the in-memory query executor
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; \
                 PRAGMA synchronous = NORMAL; \
                 PRAGMA cache_size = -65536; \
                 PRAGMA temp_store = MEMORY; \
                 PRAGMA auto_vacuum = NONE; \
                 PRAGMA case_sensitive_like = ON;",
            )
            .map_err(ws_err)?;
            Ok(conn)
        })
        .await
        .map_err(join_err)??;
        info!(memory = is_memory, "workspace open");
        Ok(Workspace {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a table for a packet schema, replacing any previous one.
    pub async fn create_table(&self, name: &str, schema: &Schema) -> Result<(), TdtpError> {
        let conn = Arc::clone(&self.conn);
        let drop_sql = format!("DROP TABLE IF EXISTS {}", Dialect::Sqlite.quote(name));
        let create_sql = dialect::create_table_sql(Dialect::Sqlite, name, schema, false);
        tokio::task::spawn_blocking(move || -> Result<(), TdtpError> {
            let conn = lock(&conn);
            conn.execute_batch(&format!("{drop_sql}; {create_sql};"))
                .map_err(ws_err)
        })
        .await
        .map_err(join_err)?
    }

    /// Bulk-load a packet's rows. Inserts are batched to stay under the
    /// parameter ceiling and run inside one transaction.
    pub async fn load_data(&self, table: &str, packet: &Packet) -> Result<u64, TdtpError> {
        let schema = packet.schema.clone();
        if schema.is_empty() {
            return Ok(0);
        }
        let mut decoded = Vec::with_capacity(packet.data.rows.len());
        for row in &packet.data.rows {
            let columns = decode_row(&row.value)?;
            if columns.len() != schema.len() {
                return Err(TdtpError::Packet(format!(
                    "table {table}: row has {} columns, schema has {}",
                    columns.len(),
                    schema.len()
                )));
            }
            decoded.push(columns);
        }

        let conn = Arc::clone(&self.conn);
        let table = table.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, TdtpError> {
            let mut conn = lock(&conn);
            let tx = conn.transaction().map_err(ws_err)?;
            let fields = schema.fields();
            let batch = std::cmp::min(500, MAX_PARAMS / fields.len());
            let mut loaded = 0u64;

            for chunk in decoded.chunks(batch) {
                let sql = batch_insert_sql(&table, &schema, chunk.len());
                let mut stmt = tx.prepare_cached(&sql).map_err(ws_err)?;
                let mut params: Vec<Value> = Vec::with_capacity(chunk.len() * fields.len());
                for columns in chunk {
                    for (repr, field) in columns.iter().zip(fields) {
                        params.push(bind_value(repr.as_deref(), field)?);
                    }
                }
                stmt.execute(rusqlite::params_from_iter(params))
                    .map_err(ws_err)?;
                drop(stmt);
                loaded += chunk.len() as u64;
            }
            tx.commit().map_err(ws_err)?;
            Ok(loaded)
        })
        .await
        .map_err(join_err)?
    }

    /// Buffered execution: the whole result as one reference packet.
    pub async fn execute_sql(&self, sql: &str, result_table: &str) -> Result<Packet, TdtpError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let result_table = result_table.to_string();
        tokio::task::spawn_blocking(move || -> Result<Packet, TdtpError> {
            let conn = lock(&conn);
            let mut stmt = conn.prepare(&sql).map_err(transform_err)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let decl_types: Vec<Option<String>> = stmt
                .columns()
                .iter()
                .map(|c| c.decl_type().map(str::to_string))
                .collect();
            let ncols = column_names.len();

            let mut rows = stmt.query([]).map_err(transform_err)?;
            let mut encoded: Vec<Row> = Vec::new();
            let mut value_types: Vec<Option<FieldType>> = vec![None; ncols];
            while let Some(row) = rows.next().map_err(transform_err)? {
                let mut columns = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    let value = row.get_ref(i).map_err(transform_err)?;
                    if value_types[i].is_none() {
                        value_types[i] = value_type_of(value);
                    }
                    columns.push(value_to_string(value));
                }
                encoded.push(Row::new(tdtp_core::codec::encode_row(&columns)));
            }

            let schema = result_schema(&column_names, &decl_types, &value_types);
            debug!(rows = encoded.len(), table = %result_table, "buffered sql result");
            single_reference_packet(&result_table, schema, encoded)
        })
        .await
        .map_err(join_err)?
    }

    /// Streaming execution. Rows flow over a bounded channel; closing
    /// the surrounding context closes the channel and reports the
    /// cancellation on the error channel.
    pub async fn execute_sql_stream(
        &self,
        sql: &str,
        result_table: &str,
        cancel: CancellationToken,
    ) -> Result<SqlStream, TdtpError> {
        let (schema_tx, schema_rx) = oneshot::channel::<Result<Schema, TdtpError>>();
        let (row_tx, row_rx) = mpsc::channel::<Vec<Option<String>>>(STREAM_BUFFER);
        let (err_tx, err_rx) = mpsc::channel::<TdtpError>(1);
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            let mut stmt = match conn.prepare(&sql) {
                Ok(stmt) => stmt,
                Err(e) => {
                    let _ = schema_tx.send(Err(transform_err(e)));
                    return;
                }
            };
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let decl_types: Vec<Option<String>> = stmt
                .columns()
                .iter()
                .map(|c| c.decl_type().map(str::to_string))
                .collect();
            let ncols = column_names.len();
            let schema = result_schema(&column_names, &decl_types, &vec![None; ncols]);
            if schema_tx.send(Ok(schema)).is_err() {
                return;
            }

            let mut rows = match stmt.query([]) {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = err_tx.blocking_send(transform_err(e));
                    return;
                }
            };
            loop {
                if cancel.is_cancelled() {
                    let _ = err_tx.blocking_send(TdtpError::Cancelled(
                        "sql stream cancelled".into(),
                    ));
                    return;
                }
                match rows.next() {
                    Ok(Some(row)) => {
                        let mut columns = Vec::with_capacity(ncols);
                        let mut failed = false;
                        for i in 0..ncols {
                            match row.get_ref(i) {
                                Ok(value) => columns.push(value_to_string(value)),
                                Err(e) => {
                                    let _ = err_tx.blocking_send(transform_err(e));
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        if failed {
                            return;
                        }
                        if row_tx.blocking_send(columns).is_err() {
                            // receiver went away; nothing left to report to
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = err_tx.blocking_send(transform_err(e));
                        return;
                    }
                }
            }
        });

        let schema = schema_rx
            .await
            .map_err(|_| TdtpError::Transform("workspace worker vanished".into()))??;
        Ok(SqlStream {
            table: result_table.to_string(),
            schema,
            rows: row_rx,
            errors: err_rx,
        })
    }

    /// Tables are dropped with the database: memory mode vanishes with
    /// the connection, file mode is removed by the caller.
    pub async fn close(self) -> Result<(), TdtpError> {
        drop(self.conn);
        Ok(())
    }
}

fn batch_insert_sql(table: &str, schema: &Schema, rows: usize) -> String {
    let quote = |s: &str| Dialect::Sqlite.quote(s);
    let columns: Vec<String> = schema.fields().iter().map(|f| quote(&f.name)).collect();
    let row_tuple = format!(
        "({})",
        vec!["?"; schema.len()].join(", ")
    );
    let tuples = vec![row_tuple; rows].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote(table),
        columns.join(", "),
        tuples
    )
}

fn bind_value(repr: Option<&str>, field: &Field) -> Result<Value, TdtpError> {
    let Some(repr) = repr else {
        return Ok(Value::Null);
    };
    Ok(match field.ftype {
        FieldType::Integer => match parse_value(repr, field)? {
            TypedValue::Integer(v) => Value::Integer(v),
            _ => unreachable!(),
        },
        FieldType::Real | FieldType::Decimal => match parse_value(repr, field)? {
            TypedValue::Real(v) | TypedValue::Decimal { value: v, .. } => Value::Real(v),
            _ => unreachable!(),
        },
        FieldType::Boolean => match parse_value(repr, field)? {
            TypedValue::Boolean(v) => Value::Integer(v as i64),
            _ => unreachable!(),
        },
        FieldType::Blob => match parse_value(repr, field)? {
            TypedValue::Blob(bytes, _) => Value::Blob(bytes),
            _ => unreachable!(),
        },
        // temporal values live as ISO-8601 text in the workspace
        FieldType::Text | FieldType::Date | FieldType::Datetime | FieldType::Timestamp => {
            Value::Text(repr.to_string())
        }
    })
}

fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

fn value_type_of(value: ValueRef<'_>) -> Option<FieldType> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some(FieldType::Integer),
        ValueRef::Real(_) => Some(FieldType::Real),
        ValueRef::Text(_) => Some(FieldType::Text),
        ValueRef::Blob(_) => Some(FieldType::Blob),
    }
}

/// Result schema: observed value types win, declared types next, Text
/// as the last resort (expressions carry no declaration).
fn result_schema(
    names: &[String],
    decl_types: &[Option<String>],
    value_types: &[Option<FieldType>],
) -> Schema {
    Schema::new(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let ftype = value_types
                    .get(i)
                    .copied()
                    .flatten()
                    .or_else(|| {
                        decl_types.get(i).and_then(|d| {
                            d.as_ref().map(|d| {
                                dialect::column_to_canonical(Dialect::Sqlite, d).0
                            })
                        })
                    })
                    .unwrap_or(FieldType::Text);
                let mut field = Field::new(name.clone(), ftype);
                if ftype == FieldType::Blob {
                    field.subtype = Some("hex".to_string());
                }
                field
            })
            .collect(),
    )
}

fn lock(conn: &Arc<Mutex<Connection>>) -> std::sync::MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ws_err(e: rusqlite::Error) -> TdtpError {
    TdtpError::Transform(format!("workspace: {e}"))
}

fn transform_err(e: rusqlite::Error) -> TdtpError {
    TdtpError::Transform(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> TdtpError {
    TdtpError::Transform(format!("workspace task: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::config::WorkspaceConfig;
    use tdtp_core::generator::generate_reference;

    fn users_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text),
            Field::new("age", FieldType::Integer),
        ])
    }

    async fn open_memory() -> Workspace {
        Workspace::open(&WorkspaceConfig::default()).await.unwrap()
    }

    fn users_packet() -> Packet {
        generate_reference(
            "users",
            &users_schema(),
            vec![
                Row::new("1|Alice|25"),
                Row::new("2|Bob|30"),
                Row::new("3|Charlie|35"),
                Row::new("4|David|40"),
            ],
        )
        .remove(0)
    }

    #[tokio::test]
    async fn load_and_query() {
        let ws = open_memory().await;
        ws.create_table("users", &users_schema()).await.unwrap();
        let loaded = ws.load_data("users", &users_packet()).await.unwrap();
        assert_eq!(loaded, 4);

        let packet = ws
            .execute_sql("SELECT * FROM users WHERE age > 30 ORDER BY id", "grown")
            .await
            .unwrap();
        assert_eq!(packet.header.table, "grown");
        assert_eq!(
            packet.data.rows,
            vec![Row::new("3|Charlie|35"), Row::new("4|David|40")]
        );
        assert_eq!(packet.schema.fields()[0].ftype, FieldType::Integer);
        assert_eq!(packet.schema.fields()[1].ftype, FieldType::Text);
    }

    #[tokio::test]
    async fn join_across_sources() {
        let ws = open_memory().await;
        ws.create_table("users", &users_schema()).await.unwrap();
        ws.load_data("users", &users_packet()).await.unwrap();

        let orders_schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("user_id", FieldType::Integer),
            Field::new("total", FieldType::Real),
        ]);
        let orders = generate_reference(
            "orders",
            &orders_schema,
            vec![Row::new("1|1|9.5"), Row::new("2|1|20.5"), Row::new("3|2|7")],
        )
        .remove(0);
        ws.create_table("orders", &orders_schema).await.unwrap();
        ws.load_data("orders", &orders).await.unwrap();

        let packet = ws
            .execute_sql(
                "SELECT u.name, COUNT(o.id) AS n, SUM(o.total) AS total \
                 FROM users u JOIN orders o ON o.user_id = u.id \
                 GROUP BY u.name ORDER BY u.name",
                "user_orders",
            )
            .await
            .unwrap();
        assert_eq!(
            packet.data.rows,
            vec![Row::new("Alice|2|30"), Row::new("Bob|1|7")]
        );
    }

    #[tokio::test]
    async fn nulls_and_escapes_survive_the_workspace() {
        let ws = open_memory().await;
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ]);
        ws.create_table("t", &schema).await.unwrap();
        let packet = generate_reference(
            "t",
            &schema,
            vec![Row::new("1|a\\|b"), Row::new("2|")],
        )
        .remove(0);
        ws.load_data("t", &packet).await.unwrap();

        let result = ws.execute_sql("SELECT * FROM t ORDER BY id", "out").await.unwrap();
        assert_eq!(result.data.rows[0].value, "1|a\\|b");
        assert_eq!(result.data.rows[1].value, "2|");
    }

    #[tokio::test]
    async fn batched_inserts_cross_the_parameter_ceiling() {
        let ws = open_memory().await;
        let schema = users_schema();
        ws.create_table("many", &schema).await.unwrap();
        let rows: Vec<Row> = (0..2500)
            .map(|i| Row::new(format!("{i}|user{i}|{}", 20 + (i % 50))))
            .collect();
        let packet = generate_reference("many", &schema, rows).remove(0);
        assert_eq!(ws.load_data("many", &packet).await.unwrap(), 2500);

        let count = ws.execute_sql("SELECT COUNT(*) AS n FROM many", "c").await.unwrap();
        assert_eq!(count.data.rows[0].value, "2500");
    }

    #[tokio::test]
    async fn streaming_delivers_all_rows() {
        let ws = open_memory().await;
        ws.create_table("users", &users_schema()).await.unwrap();
        ws.load_data("users", &users_packet()).await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = ws
            .execute_sql_stream("SELECT * FROM users ORDER BY id", "out", cancel)
            .await
            .unwrap();
        assert_eq!(stream.schema.len(), 3);

        let mut rows = Vec::new();
        while let Some(row) = stream.rows.recv().await {
            rows.push(row);
        }
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][1].as_deref(), Some("Alice"));
        assert!(stream.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn streaming_cancellation_closes_and_reports() {
        let ws = open_memory().await;
        let schema = Schema::new(vec![Field::new("n", FieldType::Integer)]);
        ws.create_table("seed", &schema).await.unwrap();
        let packet = generate_reference(
            "seed",
            &schema,
            (0..10).map(|i| Row::new(i.to_string())).collect(),
        )
        .remove(0);
        ws.load_data("seed", &packet).await.unwrap();

        // cross join inflates this to a million rows
        let cancel = CancellationToken::new();
        let mut stream = ws
            .execute_sql_stream(
                "SELECT a.n FROM seed a, seed b, seed c, seed d, seed e, seed f",
                "big",
                cancel.clone(),
            )
            .await
            .unwrap();

        let mut received = 0;
        while let Some(_row) = stream.rows.recv().await {
            received += 1;
            if received == 100 {
                cancel.cancel();
            }
        }
        assert!(received < 1_000_000, "cancellation did not stop the stream");
        let err = stream.errors.recv().await.expect("cancellation error");
        assert!(err.is_cancelled(), "{err}");
    }

    #[tokio::test]
    async fn transform_error_is_reported() {
        let ws = open_memory().await;
        let err = ws.execute_sql("SELECT * FROM missing", "out").await.unwrap_err();
        assert!(matches!(err, TdtpError::Transform(_)), "{err}");
    }
}
