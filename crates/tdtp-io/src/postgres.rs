//! PostgreSQL adapter.
//!
//! Upserts ride ON CONFLICT, the Copy strategy uses the COPY protocol,
//! and identity columns get `OVERRIDING SYSTEM VALUE` when a packet
//! carries values for them. Introspection is scoped to the `public`
//! schema.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::debug;

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

const DIALECT: Dialect = Dialect::Postgres;

#[derive(Debug)]
pub struct PostgresAdapter {
    pool: PgPool,
    server_version: String,
    include_read_only: bool,
}

impl PostgresAdapter {
    pub async fn connect(dsn: &str) -> Result<Self, TdtpError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(|e| source_err("connect", e))?;
        let server_version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&pool)
            .await
            .map_err(|e| source_err("probe", e))?;
        Ok(PostgresAdapter {
            pool,
            server_version,
            include_read_only: false,
        })
    }

    fn effective_schema(&self, schema: Schema) -> Schema {
        if self.include_read_only {
            schema
        } else {
            schema.without_read_only().0
        }
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>, TdtpError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| source_err("select", e))?;
        rows.iter()
            .map(|row| {
                let mut columns = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    columns.push(decode_cell(row, i)?);
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

    /// SELECT list for a schema; `money` and `time` columns are cast to
    /// forms the driver decodes losslessly.
    fn select_list(schema: &Schema) -> String {
        schema
            .fields()
            .iter()
            .map(|f| {
                let quoted = DIALECT.quote(&f.name);
                match f.subtype.as_deref() {
                    Some("money") => format!("{quoted}::numeric AS {quoted}"),
                    _ => quoted,
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        if matches!(strategy, WriteStrategy::Copy) {
            return self.copy_rows(table, schema, rows).await;
        }
        let overriding = self.needs_identity_override(table, schema).await?;
        let sql = self.insert_sql(table, schema, strategy, overriding);
        let mut summary = ImportSummary::default();

        let mut tx = self.pool.begin().await.map_err(|e| source_err("begin", e))?;
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

    fn insert_sql(
        &self,
        table: &str,
        schema: &Schema,
        strategy: WriteStrategy,
        overriding: bool,
    ) -> String {
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| DIALECT.quote(&f.name))
            .collect();
        let placeholders: Vec<String> = (1..=schema.len()).map(|i| DIALECT.placeholder(i)).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}){} VALUES ({})",
            DIALECT.quote(table),
            columns.join(", "),
            if overriding { " OVERRIDING SYSTEM VALUE" } else { "" },
            placeholders.join(", ")
        );
        match strategy {
            WriteStrategy::Replace => {
                let keys: Vec<String> = schema
                    .key_fields()
                    .iter()
                    .map(|f| DIALECT.quote(&f.name))
                    .collect();
                if keys.is_empty() {
                    return sql;
                }
                let updates: Vec<String> = schema
                    .fields()
                    .iter()
                    .filter(|f| !f.is_key)
                    .map(|f| {
                        let q = DIALECT.quote(&f.name);
                        format!("{q} = EXCLUDED.{q}")
                    })
                    .collect();
                if updates.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
                } else {
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        keys.join(", "),
                        updates.join(", ")
                    ));
                }
            }
            WriteStrategy::Ignore => sql.push_str(" ON CONFLICT DO NOTHING"),
            WriteStrategy::Fail | WriteStrategy::Copy => {}
        }
        sql
    }

    /// Whether any imported column is an identity column of the target.
    async fn needs_identity_override(
        &self,
        table: &str,
        schema: &Schema,
    ) -> Result<bool, TdtpError> {
        if !self.table_exists(table).await? {
            return Ok(false);
        }
        let identity_columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 AND is_identity = 'YES'",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("identity_probe", e))?;
        Ok(schema
            .fields()
            .iter()
            .any(|f| identity_columns.iter().any(|c| c == &f.name)))
    }

    /// Bulk load over the COPY protocol (text format).
    async fn copy_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
    ) -> Result<ImportSummary, TdtpError> {
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| DIALECT.quote(&f.name))
            .collect();
        let stmt = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            DIALECT.quote(table),
            columns.join(", ")
        );
        let mut sink = self
            .pool
            .copy_in_raw(&stmt)
            .await
            .map_err(|e| source_err("copy", e))?;

        let mut payload = String::new();
        for row in rows {
            let columns = decode_row(&row.value)?;
            for (i, (repr, field)) in columns.iter().zip(schema.fields()).enumerate() {
                if i > 0 {
                    payload.push('\t');
                }
                match repr {
                    None => payload.push_str("\\N"),
                    Some(v) => push_copy_text(&mut payload, v, field),
                }
            }
            payload.push('\n');
        }
        sink.send(payload.as_bytes())
            .await
            .map_err(|e| source_err("copy", e))?;
        let inserted = sink.finish().await.map_err(map_write_err)?;
        Ok(ImportSummary {
            inserted,
            ignored: 0,
        })
    }
}

/// COPY text escaping: backslash, tab, newline and carriage return must
/// be escaped; bytea values go out in `\x` hex form.
fn push_copy_text(out: &mut String, value: &str, field: &Field) {
    if field.ftype == FieldType::Blob {
        out.push_str("\\\\x");
        out.push_str(value);
        return;
    }
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

#[async_trait]
impl SchemaReader for PostgresAdapter {
    async fn table_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("table_names", e))
    }

    async fn view_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.views \
             WHERE table_schema = 'public' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("view_names", e))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, TdtpError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| source_err("table_exists", e))
    }

    async fn table_schema(&self, table: &str) -> Result<Schema, TdtpError> {
        // information_schema exposes domain types (sql_identifier,
        // yes_or_no); casting keeps the driver decode unambiguous
        let rows = sqlx::query(
            "SELECT c.column_name::text AS column_name, c.data_type::text AS data_type, \
                    c.character_maximum_length::int4 AS character_maximum_length, \
                    c.numeric_precision::int4 AS numeric_precision, \
                    c.numeric_scale::int4 AS numeric_scale, \
                    c.is_identity::text AS is_identity, c.is_generated::text AS is_generated, \
                    (k.column_name IS NOT NULL) AS is_key \
             FROM information_schema.columns c \
             LEFT JOIN (SELECT kcu.column_name \
                        FROM information_schema.table_constraints tc \
                        JOIN information_schema.key_column_usage kcu \
                          ON kcu.constraint_name = tc.constraint_name \
                         AND kcu.table_schema = tc.table_schema \
                         AND kcu.table_name = tc.table_name \
                        WHERE tc.constraint_type = 'PRIMARY KEY' \
                          AND tc.table_schema = 'public' AND tc.table_name = $1) k \
               ON k.column_name = c.column_name \
             WHERE c.table_schema = 'public' AND c.table_name = $1 \
             ORDER BY c.ordinal_position",
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
            let name: String = row.try_get("column_name").map_err(|e| source_err("table_schema", e))?;
            let data_type: String = row.try_get("data_type").map_err(|e| source_err("table_schema", e))?;
            let length: Option<i32> = row.try_get("character_maximum_length").ok();
            let precision: Option<i32> = row.try_get("numeric_precision").ok();
            let scale: Option<i32> = row.try_get("numeric_scale").ok();
            let is_identity: String = row.try_get("is_identity").map_err(|e| source_err("table_schema", e))?;
            let is_generated: String = row.try_get("is_generated").map_err(|e| source_err("table_schema", e))?;
            let is_key: bool = row.try_get("is_key").map_err(|e| source_err("table_schema", e))?;

            let (ftype, subtype) = dialect::column_to_canonical(DIALECT, &data_type);
            let mut field = Field::new(name, ftype);
            field.subtype = subtype;
            field.length = length.map(|v| v as u32);
            if ftype == FieldType::Decimal {
                field.precision = precision.map(|v| v as u32);
                field.scale = scale.map(|v| v as u32);
            }
            if ftype == FieldType::Timestamp {
                field.timezone = Some("UTC".to_string());
            }
            field.is_key = is_key;
            field.read_only = is_identity == "YES" || is_generated == "ALWAYS";
            fields.push(field);
        }
        Ok(Schema::new(fields))
    }
}

#[async_trait]
impl DataReader for PostgresAdapter {
    async fn export_table(&self, table: &str) -> Result<Vec<Packet>, TdtpError> {
        let schema = self.effective_schema(self.table_schema(table).await?);
        let sql = format!(
            "SELECT {} FROM {}",
            Self::select_list(&schema),
            DIALECT.quote(table)
        );
        let rows = self.fetch_rows(&sql).await?;
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
impl crate::adapter_common::SqlPort for PostgresAdapter {
    async fn port_fetch_rows(&self, sql: &str, _schema: &Schema) -> Result<Vec<Row>, TdtpError> {
        self.fetch_rows(sql).await
    }

    async fn port_fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        self.fetch_count(sql).await
    }
}

#[async_trait]
impl DataWriter for PostgresAdapter {
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

        let create = dialect::create_table_sql(DIALECT, &staging, &first.schema, false);
        sqlx::query(&create)
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
                    self.drop_table(&staging).await;
                    return Err(e);
                }
            }
        }

        // rename pair runs in one transaction; postgres DDL is
        // transactional so the swap is atomic for readers
        let mut tx = self.pool.begin().await.map_err(|e| source_err("begin", e))?;
        let target_exists = self.table_exists(&table).await?;
        if target_exists {
            let sql = format!(
                "ALTER TABLE {} RENAME TO {}",
                DIALECT.quote(&table),
                DIALECT.quote(&old)
            );
            if let Err(e) = sqlx::query(&sql).execute(&mut *tx).await {
                drop(tx);
                self.drop_table(&staging).await;
                return Err(source_err("rename", e));
            }
        }
        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            DIALECT.quote(&staging),
            DIALECT.quote(&table)
        );
        if let Err(e) = sqlx::query(&sql).execute(&mut *tx).await {
            // the transaction rolls the first rename back
            drop(tx);
            self.drop_table(&staging).await;
            return Err(source_err("rename", e));
        }
        if target_exists {
            let sql = format!("DROP TABLE {}", DIALECT.quote(&old));
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| source_err("drop_old", e))?;
        }
        tx.commit().await.map_err(|e| source_err("commit", e))?;
        Ok(summary)
    }
}

impl PostgresAdapter {
    async fn drop_table(&self, table: &str) {
        let sql = format!("DROP TABLE IF EXISTS {}", DIALECT.quote(table));
        if let Err(e) = sqlx::query(&sql).execute(&self.pool).await {
            debug!(error = %e, table, "staging cleanup failed");
        }
    }
}

struct PgTx {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

#[async_trait]
impl AdapterTx for PgTx {
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
impl TransactionManager for PostgresAdapter {
    async fn begin(&self) -> Result<Box<dyn AdapterTx>, TdtpError> {
        let mut conn = self.pool.acquire().await.map_err(|e| source_err("begin", e))?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| source_err("begin", e))?;
        Ok(Box::new(PgTx { conn }))
    }
}

#[async_trait]
impl RawQueryExecutor for PostgresAdapter {
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
            for i in 0..schema.len() {
                columns.push(decode_cell(row, i)?);
            }
            encoded.push(Row::new(encode_row(&columns)));
        }
        crate::adapter_common::single_reference_packet(result_table, schema, encoded)
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
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
        "postgres"
    }

    async fn database_version(&self) -> Result<String, TdtpError> {
        Ok(self.server_version.clone())
    }

    fn set_include_read_only(&mut self, include: bool) {
        self.include_read_only = include;
    }
}

fn schema_from_rows(rows: &[PgRow]) -> Schema {
    let Some(first) = rows.first() else {
        return Schema::default();
    };
    Schema::new(
        first
            .columns()
            .iter()
            .map(|col| {
                let (ftype, subtype) =
                    dialect::column_to_canonical(DIALECT, col.type_info().name());
                let mut field = Field::new(col.name(), ftype);
                field.subtype = subtype;
                field
            })
            .collect(),
    )
}

/// Dynamic cell decode keyed on the driver's type name.
fn decode_cell(row: &PgRow, idx: usize) -> Result<Option<String>, TdtpError> {
    let raw = row.try_get_raw(idx).map_err(|e| source_err("decode", e))?;
    if raw.is_null() {
        return Ok(None);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => row
            .try_get::<bool, _>(idx)
            .map(|b| if b { "true" } else { "false" }.to_string()),
        "INT2" => row.try_get::<i16, _>(idx).map(|v| v.to_string()),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| v.to_string()),
        "INT8" => row.try_get::<i64, _>(idx).map(|v| v.to_string()),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| v.to_string()),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(|v| v.to_string()),
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .map(|v| v.to_string()),
        "MONEY" => row
            .try_get::<sqlx::postgres::types::PgMoney, _>(idx)
            .map(|v| v.to_decimal(2).to_string()),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            row.try_get::<String, _>(idx)
        }
        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .map(|d| d.format("%Y-%m-%d").to_string()),
        "TIMESTAMP" => row.try_get::<NaiveDateTime, _>(idx).map(|dt| {
            Utc.from_utc_datetime(&dt)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
        }),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .map(|t| t.format("%H:%M:%S%.f").to_string()),
        "BYTEA" => row.try_get::<Vec<u8>, _>(idx).map(hex::encode),
        "UUID" => row.try_get::<uuid::Uuid, _>(idx).map(|u| u.to_string()),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(idx)
            .map(|v| v.to_string()),
        _ => {
            // last resort: many extension types decode as text
            return match row.try_get::<String, _>(idx) {
                Ok(v) => Ok(Some(v)),
                Err(_) => Err(source_err(
                    "decode",
                    format!("unsupported postgres type {type_name}"),
                )),
            };
        }
    }
    .map_err(|e| source_err("decode", e))?;
    Ok(Some(value))
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    repr: Option<&str>,
    field: &Field,
) -> Result<sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>, TdtpError> {
    use tdtp_core::types::{parse_value, TypedValue};
    let Some(repr) = repr else {
        return Ok(query.bind(None::<String>));
    };
    Ok(match field.ftype {
        FieldType::Integer => match parse_value(repr, field)? {
            TypedValue::Integer(v) => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Real | FieldType::Decimal => match parse_value(repr, field)? {
            TypedValue::Real(v) | TypedValue::Decimal { value: v, .. } => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Boolean => match parse_value(repr, field)? {
            TypedValue::Boolean(v) => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Date => match parse_value(repr, field)? {
            TypedValue::Date(v) => query.bind(v),
            _ => unreachable!(),
        },
        FieldType::Datetime | FieldType::Timestamp => match parse_value(repr, field)? {
            TypedValue::Datetime(v) | TypedValue::Timestamp(v) => {
                query.bind(v.with_timezone(&Utc))
            }
            _ => unreachable!(),
        },
        FieldType::Blob => match parse_value(repr, field)? {
            TypedValue::Blob(bytes, _) => query.bind(bytes),
            _ => unreachable!(),
        },
        FieldType::Text => match field.subtype.as_deref() {
            Some("uuid") => query.bind(
                uuid::Uuid::parse_str(repr)
                    .map_err(|e| TdtpError::ValueParse(format!("field {}: {e}", field.name)))?,
            ),
            Some("json") | Some("jsonb") => query.bind(
                serde_json::from_str::<serde_json::Value>(repr)
                    .map_err(|e| TdtpError::ValueParse(format!("field {}: {e}", field.name)))?,
            ),
            Some("time") => query.bind(
                NaiveTime::parse_from_str(repr, "%H:%M:%S%.f")
                    .map_err(|e| TdtpError::ValueParse(format!("field {}: {e}", field.name)))?,
            ),
            _ => query.bind(repr.to_string()),
        },
    })
}

fn source_err(op: &str, e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Source {
        name: "postgres".into(),
        message: format!("{op}: {e}"),
    }
}

/// SQLSTATE 23505 (unique) and friends in class 23 → constraint
/// violation.
fn map_write_err(e: sqlx::Error) -> TdtpError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code.starts_with("23") {
                return TdtpError::Constraint(db.message().to_string());
            }
        }
    }
    source_err("write", e)
}
