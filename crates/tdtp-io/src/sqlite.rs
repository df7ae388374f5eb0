//! SQLite adapter.
//!
//! DSNs are passed through unchanged (`sqlite://path`, `sqlite::memory:`
//! or a bare file path). SQLite supports table rename, so the atomic
//! full-snapshot replacement protocol applies directly.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Row as _, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, warn};

use tdtp_core::codec::{decode_row, encode_row};
use tdtp_core::generator::generate_reference;
use tdtp_core::packet::{Field, Packet, Row, Schema};
use tdtp_core::query::SelectStatement;
use tdtp_core::types::FieldType;
use tdtp_core::TdtpError;

use crate::adapter::{
    Adapter, AdapterTx, DataReader, DataWriter, ImportSummary, RawQueryExecutor, SchemaReader,
    TransactionManager, WriteStrategy,
};
use crate::dialect::{self, Dialect};

const DIALECT: Dialect = Dialect::Sqlite;

#[derive(Debug)]
pub struct SqliteAdapter {
    pool: SqlitePool,
    include_read_only: bool,
}

impl SqliteAdapter {
    pub async fn connect(dsn: &str) -> Result<Self, TdtpError> {
        let options = if dsn.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(dsn).map_err(|e| source_err("connect", e))?
        } else {
            SqliteConnectOptions::new().filename(dsn)
        }
        .create_if_missing(true)
        .disable_statement_logging();

        // an in-memory database exists per connection; it must not be
        // spread across a pool
        let is_memory = dsn.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| source_err("connect", e))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| source_err("probe", e))?;
        Ok(SqliteAdapter {
            pool,
            include_read_only: false,
        })
    }

    fn effective_schema(&self, schema: Schema) -> (Schema, Vec<usize>) {
        if self.include_read_only {
            let idx = (0..schema.len()).collect();
            (schema, idx)
        } else {
            schema.without_read_only()
        }
    }

    async fn fetch_rows(&self, sql: &str, schema: &Schema) -> Result<Vec<Row>, TdtpError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| source_err("select", e))?;
        rows.iter()
            .map(|row| {
                let mut columns = Vec::with_capacity(schema.len());
                for (i, field) in schema.fields().iter().enumerate() {
                    columns.push(decode_cell(row, i, field.ftype)?);
                }
                Ok(Row::new(encode_row(&columns)))
            })
            .collect()
    }

    async fn fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        let count: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| source_err("count", e))?;
        Ok(count as u64)
    }

    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let verb = match strategy {
            WriteStrategy::Replace | WriteStrategy::Copy => "INSERT OR REPLACE",
            WriteStrategy::Ignore => "INSERT OR IGNORE",
            WriteStrategy::Fail => "INSERT",
        };
        let sql = insert_sql(verb, table, schema);
        let mut summary = ImportSummary::default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| source_err("begin", e))?;
        for row in rows {
            let columns = decode_row(&row.value)?;
            if columns.len() != schema.len() {
                return Err(TdtpError::Packet(format!(
                    "row has {} columns, schema has {}",
                    columns.len(),
                    schema.len()
                )));
            }
            let mut query = sqlx::query(&sql);
            for (repr, field) in columns.iter().zip(schema.fields()) {
                query = bind_value(query, repr.as_deref(), field)?;
            }
            let result = query.execute(&mut *tx).await.map_err(map_write_err)?;
            if result.rows_affected() == 0 {
                summary.ignored += 1;
            } else {
                summary.inserted += 1;
            }
        }
        tx.commit().await.map_err(|e| source_err("commit", e))?;
        Ok(summary)
    }
}

#[async_trait]
impl SchemaReader for SqliteAdapter {
    async fn table_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("table_names", e))
    }

    async fn view_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| source_err("view_names", e))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, TdtpError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| source_err("table_exists", e))?;
        Ok(count > 0)
    }

    async fn table_schema(&self, table: &str) -> Result<Schema, TdtpError> {
        // hidden: 0 plain, 1 dynamically hidden, 2 virtual generated,
        // 3 stored generated
        let rows = sqlx::query(
            "SELECT name, type, pk, hidden FROM pragma_table_xinfo(?1) ORDER BY cid",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("table_schema", e))?;
        if rows.is_empty() {
            return Err(TdtpError::SchemaMismatch(format!(
                "table {table:?} does not exist"
            )));
        }
        let mut fields = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| source_err("table_schema", e))?;
            let decl: String = row.try_get("type").map_err(|e| source_err("table_schema", e))?;
            let pk: i64 = row.try_get("pk").map_err(|e| source_err("table_schema", e))?;
            let hidden: i64 = row.try_get("hidden").map_err(|e| source_err("table_schema", e))?;
            if hidden == 1 {
                continue;
            }
            let (ftype, subtype) = dialect::column_to_canonical(DIALECT, &decl);
            let mut field = Field::new(name, ftype);
            field.subtype = subtype;
            field.is_key = pk > 0;
            field.read_only = hidden >= 2;
            fields.push(field);
        }
        Ok(Schema::new(fields))
    }
}

#[async_trait]
impl DataReader for SqliteAdapter {
    async fn export_table(&self, table: &str) -> Result<Vec<Packet>, TdtpError> {
        let (schema, _) = self.effective_schema(self.table_schema(table).await?);
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| DIALECT.quote(&f.name))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            DIALECT.quote(table)
        );
        let rows = self.fetch_rows(&sql, &schema).await?;
        Ok(generate_reference(table, &schema, rows))
    }

    async fn export_table_with_query(
        &self,
        query: &SelectStatement,
        sender: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<Vec<Packet>, TdtpError> {
        let full_schema = self.table_schema(&query.table).await?;
        crate::adapter_common::pushdown_response(
            self,
            DIALECT,
            query,
            full_schema,
            self.include_read_only,
            true,
            sender,
            recipient,
        )
        .await
    }
}

#[async_trait]
impl crate::adapter_common::SqlPort for SqliteAdapter {
    async fn port_fetch_rows(&self, sql: &str, schema: &Schema) -> Result<Vec<Row>, TdtpError> {
        self.fetch_rows(sql, schema).await
    }

    async fn port_fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        self.fetch_count(sql).await
    }
}

#[async_trait]
impl DataWriter for SqliteAdapter {
    async fn import_packet(
        &self,
        packet: &Packet,
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let table = &packet.header.table;
        if !self.table_exists(table).await? {
            let sql = dialect::create_table_sql(DIALECT, table, &packet.schema, true);
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| source_err("create_table", e))?;
        }
        self.insert_rows(table, &packet.schema, &packet.data.rows, strategy)
            .await
    }

    async fn import_snapshot(&self, packets: &[Packet]) -> Result<ImportSummary, TdtpError> {
        let first = packets
            .first()
            .ok_or_else(|| TdtpError::Packet("empty snapshot".into()))?;
        let table = first.header.table.clone();
        let staging = dialect::staging_table_name(&table);
        let old = dialect::old_table_name(&table);

        let sql = dialect::create_table_sql(DIALECT, &staging, &first.schema, false);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| source_err("create_staging", e))?;

        let mut summary = ImportSummary::default();
        for packet in packets {
            match self
                .insert_rows(&staging, &packet.schema, &packet.data.rows, WriteStrategy::Fail)
                .await
            {
                Ok(s) => summary.merge(s),
                Err(e) => {
                    let _ = sqlx::query(&format!("DROP TABLE {}", DIALECT.quote(&staging)))
                        .execute(&self.pool)
                        .await;
                    return Err(e);
                }
            }
        }

        let target_exists = self.table_exists(&table).await?;
        if target_exists {
            if let Err(e) = self.rename_table(&table, &old).await {
                let _ = sqlx::query(&format!("DROP TABLE {}", DIALECT.quote(&staging)))
                    .execute(&self.pool)
                    .await;
                return Err(e);
            }
        }
        if let Err(e) = self.rename_table(&staging, &table).await {
            // compensating rename: put the old snapshot back
            if target_exists {
                if let Err(undo) = self.rename_table(&old, &table).await {
                    warn!(error = %undo, table, "compensating rename failed");
                }
            }
            let _ = sqlx::query(&format!("DROP TABLE {}", DIALECT.quote(&staging)))
                .execute(&self.pool)
                .await;
            return Err(e);
        }
        if target_exists {
            sqlx::query(&format!("DROP TABLE {}", DIALECT.quote(&old)))
                .execute(&self.pool)
                .await
                .map_err(|e| source_err("drop_old", e))?;
        }
        Ok(summary)
    }
}

impl SqliteAdapter {
    async fn rename_table(&self, from: &str, to: &str) -> Result<(), TdtpError> {
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            DIALECT.quote(from),
            DIALECT.quote(to)
        ))
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| source_err("rename", e))
    }
}

struct SqliteTx {
    conn: sqlx::pool::PoolConnection<sqlx::Sqlite>,
}

#[async_trait]
impl AdapterTx for SqliteTx {
    async fn execute(&mut self, sql: &str) -> Result<u64, TdtpError> {
        sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .map(|r| r.rows_affected())
            .map_err(map_write_err)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), TdtpError> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map(|_| ())
            .map_err(|e| source_err("commit", e))
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), TdtpError> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map(|_| ())
            .map_err(|e| source_err("rollback", e))
    }
}

#[async_trait]
impl TransactionManager for SqliteAdapter {
    async fn begin(&self) -> Result<Box<dyn AdapterTx>, TdtpError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| source_err("begin", e))?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| source_err("begin", e))?;
        Ok(Box::new(SqliteTx { conn }))
    }
}

#[async_trait]
impl RawQueryExecutor for SqliteAdapter {
    async fn execute_raw_query(
        &self,
        sql: &str,
        result_table: &str,
    ) -> Result<Packet, TdtpError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| source_err("raw_query", e))?;
        let schema = schema_from_rows(&rows);
        let mut encoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut columns = Vec::with_capacity(schema.len());
            for (i, field) in schema.fields().iter().enumerate() {
                columns.push(decode_cell(row, i, field.ftype)?);
            }
            encoded.push(Row::new(encode_row(&columns)));
        }
        debug!(rows = encoded.len(), table = result_table, "raw query read");
        crate::adapter_common::single_reference_packet(result_table, schema, encoded)
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn ping(&self) -> Result<(), TdtpError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| source_err("ping", e))
    }

    async fn close(&self) -> Result<(), TdtpError> {
        self.pool.close().await;
        Ok(())
    }

    fn database_type(&self) -> &'static str {
        "sqlite"
    }

    async fn database_version(&self) -> Result<String, TdtpError> {
        sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| source_err("version", e))
    }

    fn set_include_read_only(&mut self, include: bool) {
        self.include_read_only = include;
    }
}

/// Canonical schema from result-set column metadata, for ad-hoc
/// queries with no catalogue entry to introspect.
fn schema_from_rows(rows: &[SqliteRow]) -> Schema {
    let Some(first) = rows.first() else {
        return Schema::default();
    };
    Schema::new(
        first
            .columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let (ftype, subtype) = if type_name.eq_ignore_ascii_case("null") {
                    (FieldType::Text, None)
                } else {
                    dialect::column_to_canonical(DIALECT, type_name)
                };
                let mut field = Field::new(col.name(), ftype);
                field.subtype = subtype;
                field
            })
            .collect(),
    )
}

fn decode_cell(row: &SqliteRow, idx: usize, ftype: FieldType) -> Result<Option<String>, TdtpError> {
    let raw = row.try_get_raw(idx).map_err(|e| source_err("decode", e))?;
    if raw.is_null() {
        return Ok(None);
    }
    let value = match ftype {
        FieldType::Integer => row.try_get::<i64, _>(idx).map(|v| v.to_string()),
        FieldType::Real | FieldType::Decimal => row.try_get::<f64, _>(idx).map(|v| v.to_string()),
        FieldType::Boolean => row
            .try_get::<bool, _>(idx)
            .map(|b| if b { "true" } else { "false" }.to_string()),
        FieldType::Text | FieldType::Date | FieldType::Datetime | FieldType::Timestamp => {
            row.try_get::<String, _>(idx)
        }
        FieldType::Blob => row.try_get::<Vec<u8>, _>(idx).map(hex::encode),
    }
    .map_err(|e| source_err("decode", e))?;
    Ok(Some(value))
}

fn insert_sql(verb: &str, table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| DIALECT.quote(&f.name))
        .collect();
    let placeholders: Vec<&str> = schema.fields().iter().map(|_| "?").collect();
    format!(
        "{verb} INTO {} ({}) VALUES ({})",
        DIALECT.quote(table),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    repr: Option<&str>,
    field: &Field,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, TdtpError> {
    use tdtp_core::types::{parse_value, TypedValue};
    let Some(repr) = repr else {
        return Ok(query.bind(None::<String>));
    };
    Ok(match field.ftype {
        FieldType::Integer => match parse_value(repr, field)? {
            TypedValue::Integer(v) => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Real | FieldType::Decimal => {
            match parse_value(repr, field)? {
                TypedValue::Real(v) | TypedValue::Decimal { value: v, .. } => query.bind(v),
                _ => unreachable!(),
            }
        }
        FieldType::Boolean => match parse_value(repr, field)? {
            TypedValue::Boolean(v) => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Blob => match parse_value(repr, field)? {
            TypedValue::Blob(bytes, _) => query.bind(bytes),
            _ => unreachable!(),
        },
        // temporal values are stored in their ISO-8601 text form
        FieldType::Text | FieldType::Date | FieldType::Datetime | FieldType::Timestamp => {
            query.bind(repr.to_string())
        }
    })
}

fn source_err(op: &str, e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Source {
        name: "sqlite".into(),
        message: format!("{op}: {e}"),
    }
}

/// SQLITE_CONSTRAINT family → constraint violation; everything else is
/// a source error.
fn map_write_err(e: sqlx::Error) -> TdtpError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code == "1555" || code == "2067" || code == "19" || code.starts_with("787") {
                return TdtpError::Constraint(db.message().to_string());
            }
        }
    }
    source_err("write", e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_shapes() {
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text),
        ]);
        assert_eq!(
            insert_sql("INSERT OR IGNORE", "t", &schema),
            "INSERT OR IGNORE INTO \"t\" (\"id\", \"name\") VALUES (?, ?)"
        );
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let mut tx = adapter.begin().await.unwrap();
        tx.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .await
            .unwrap();
        tx.execute("INSERT INTO users VALUES (1, 'Alice', 25), (2, 'Bob', 30)")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(adapter.table_exists("users").await.unwrap());
        assert_eq!(adapter.table_names().await.unwrap(), vec!["users"]);

        let schema = adapter.table_schema("users").await.unwrap();
        assert_eq!(schema.len(), 3);
        assert!(schema.fields()[0].is_key);
        assert_eq!(schema.fields()[1].ftype, FieldType::Text);

        let packets = adapter.export_table("users").await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.rows.len(), 2);
        assert_eq!(packets[0].data.rows[0].value, "1|Alice|25");
    }

    #[tokio::test]
    async fn strategy_ignore_keeps_existing_rows() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let mut tx = adapter.begin().await.unwrap();
        tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .await
            .unwrap();
        tx.execute("INSERT INTO t VALUES (1, 'X')").await.unwrap();
        tx.commit().await.unwrap();

        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ]);
        let packets = generate_reference(
            "t",
            &schema,
            vec![Row::new("1|Y"), Row::new("2|Z")],
        );
        let summary = adapter
            .import_packet(&packets[0], WriteStrategy::Ignore)
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.ignored, 1);

        let exported = adapter.export_table("t").await.unwrap();
        assert_eq!(
            exported[0].data.rows,
            vec![Row::new("1|X"), Row::new("2|Z")]
        );
    }

    #[tokio::test]
    async fn strategy_fail_surfaces_constraint() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let mut tx = adapter.begin().await.unwrap();
        tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .await
            .unwrap();
        tx.execute("INSERT INTO t VALUES (1, 'X')").await.unwrap();
        tx.commit().await.unwrap();

        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ]);
        let packets = generate_reference("t", &schema, vec![Row::new("1|Y")]);
        let err = adapter
            .import_packet(&packets[0], WriteStrategy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, TdtpError::Constraint(_)), "{err}");
    }

    #[tokio::test]
    async fn snapshot_replacement_swaps_atomically() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ]);
        let first = generate_reference("t", &schema, vec![Row::new("1|old")]);
        adapter.import_snapshot(&first).await.unwrap();

        let second = generate_reference(
            "t",
            &schema,
            vec![Row::new("1|new"), Row::new("2|also-new")],
        );
        adapter.import_snapshot(&second).await.unwrap();

        let exported = adapter.export_table("t").await.unwrap();
        assert_eq!(
            exported[0].data.rows,
            vec![Row::new("1|new"), Row::new("2|also-new")]
        );
        // no leftovers from the swap
        assert_eq!(adapter.table_names().await.unwrap(), vec!["t"]);
    }

    #[tokio::test]
    async fn query_pushdown_with_context() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let mut tx = adapter.begin().await.unwrap();
        tx.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .await
            .unwrap();
        tx.execute(
            "INSERT INTO users VALUES (1,'Alice',25),(2,'Bob',30),(3,'Charlie',35),(4,'David',40)",
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let query = tdtp_core::query::parse("SELECT * FROM users WHERE age > 30").unwrap();
        let packets = adapter
            .export_table_with_query(&query, Some("node-a"), None)
            .await
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0].data.rows,
            vec![Row::new("3|Charlie|35"), Row::new("4|David|40")]
        );
        let ctx = packets[0].query_context.as_ref().unwrap();
        assert_eq!(ctx.results.total_records_in_table, 4);
        assert_eq!(ctx.results.records_returned, 2);
        assert!(!ctx.results.more_data_available);
    }

    #[tokio::test]
    async fn raw_query_builds_reference_packet() {
        let adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        let mut tx = adapter.begin().await.unwrap();
        tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .await
            .unwrap();
        tx.execute("INSERT INTO t VALUES (1, 'a'), (2, 'b')").await.unwrap();
        tx.commit().await.unwrap();

        let packet = adapter
            .execute_raw_query("SELECT id, v FROM t ORDER BY id", "alias")
            .await
            .unwrap();
        assert_eq!(packet.header.table, "alias");
        assert_eq!(packet.header.record_count, 2);
        assert_eq!(packet.schema.fields()[0].ftype, FieldType::Integer);
        assert_eq!(packet.data.rows[1].value, "2|b");
    }
}
