//! MySQL adapter.
//!
//! Upserts use `ON DUPLICATE KEY UPDATE`, Ignore maps to `INSERT
//! IGNORE`, and snapshot swaps ride the atomic multi-table `RENAME
//! TABLE` statement. Introspection is scoped to the DSN's database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
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

const DIALECT: Dialect = Dialect::MySql;

#[derive(Debug)]
pub struct MySqlAdapter {
    pool: MySqlPool,
    include_read_only: bool,
}

impl MySqlAdapter {
    pub async fn connect(dsn: &str) -> Result<Self, TdtpError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(|e| source_err("connect", e))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| source_err("probe", e))?;
        Ok(MySqlAdapter {
            pool,
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

    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        if matches!(strategy, WriteStrategy::Copy) {
            // no practical bulk protocol through the driver
            debug!(table, "copy strategy falls back to replace");
            return self
                .insert_rows_inner(table, schema, rows, WriteStrategy::Replace)
                .await;
        }
        self.insert_rows_inner(table, schema, rows, strategy).await
    }

    async fn insert_rows_inner(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let sql = insert_sql(table, schema, strategy);
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
}

fn insert_sql(table: &str, schema: &Schema, strategy: WriteStrategy) -> String {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| DIALECT.quote(&f.name))
        .collect();
    let placeholders: Vec<&str> = schema.fields().iter().map(|_| "?").collect();
    let verb = if matches!(strategy, WriteStrategy::Ignore) {
        "INSERT IGNORE"
    } else {
        "INSERT"
    };
    let mut sql = format!(
        "{verb} INTO {} ({}) VALUES ({})",
        DIALECT.quote(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    if matches!(strategy, WriteStrategy::Replace | WriteStrategy::Copy) {
        let updates: Vec<String> = schema
            .fields()
            .iter()
            .filter(|f| !f.is_key)
            .map(|f| {
                let q = DIALECT.quote(&f.name);
                format!("{q} = VALUES({q})")
            })
            .collect();
        if !updates.is_empty() {
            sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")));
        }
    }
    sql
}

#[async_trait]
impl SchemaReader for MySqlAdapter {
    async fn table_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("table_names", e))
    }

    async fn view_names(&self) -> Result<Vec<String>, TdtpError> {
        sqlx::query_scalar(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'VIEW' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| source_err("view_names", e))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, TdtpError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| source_err("table_exists", e))?;
        Ok(count > 0)
    }

    async fn table_schema(&self, table: &str) -> Result<Schema, TdtpError> {
        let rows = sqlx::query(
            "SELECT column_name, data_type, column_type, character_maximum_length, \
                    numeric_precision, numeric_scale, column_key, extra \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
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
            let column_type: String = row.try_get("column_type").map_err(|e| source_err("table_schema", e))?;
            let length: Option<i64> = row.try_get("character_maximum_length").ok();
            let precision: Option<i64> = row.try_get("numeric_precision").ok();
            let scale: Option<i64> = row.try_get("numeric_scale").ok();
            let column_key: String = row.try_get("column_key").unwrap_or_default();
            let extra: String = row.try_get("extra").unwrap_or_default();

            // column_type keeps the display width tinyint(1) needs
            let lookup = if data_type.eq_ignore_ascii_case("tinyint") {
                column_type.as_str()
            } else {
                data_type.as_str()
            };
            let (ftype, subtype) = dialect::column_to_canonical(DIALECT, lookup);
            let mut field = Field::new(name, ftype);
            field.subtype = subtype;
            field.length = length.and_then(|v| u32::try_from(v).ok());
            if ftype == FieldType::Decimal {
                field.precision = precision.and_then(|v| u32::try_from(v).ok());
                field.scale = scale.and_then(|v| u32::try_from(v).ok());
            }
            field.is_key = column_key.eq_ignore_ascii_case("PRI");
            let extra_lower = extra.to_ascii_lowercase();
            field.read_only =
                extra_lower.contains("auto_increment") || extra_lower.contains("generated");
            fields.push(field);
        }
        Ok(Schema::new(fields))
    }
}

#[async_trait]
impl DataReader for MySqlAdapter {
    async fn export_table(&self, table: &str) -> Result<Vec<Packet>, TdtpError> {
        let schema = self.effective_schema(self.table_schema(table).await?);
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
impl crate::adapter_common::SqlPort for MySqlAdapter {
    async fn port_fetch_rows(&self, sql: &str, _schema: &Schema) -> Result<Vec<Row>, TdtpError> {
        self.fetch_rows(sql).await
    }

    async fn port_fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        self.fetch_count(sql).await
    }
}

#[async_trait]
impl DataWriter for MySqlAdapter {
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

        // RENAME TABLE swaps both names in one atomic statement
        let target_exists = self.table_exists(&table).await?;
        let rename = if target_exists {
            format!(
                "RENAME TABLE {} TO {}, {} TO {}",
                DIALECT.quote(&table),
                DIALECT.quote(&old),
                DIALECT.quote(&staging),
                DIALECT.quote(&table)
            )
        } else {
            format!(
                "RENAME TABLE {} TO {}",
                DIALECT.quote(&staging),
                DIALECT.quote(&table)
            )
        };
        if let Err(e) = sqlx::query(&rename).execute(&self.pool).await {
            self.drop_table(&staging).await;
            return Err(source_err("rename", e));
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

impl MySqlAdapter {
    async fn drop_table(&self, table: &str) {
        let sql = format!("DROP TABLE IF EXISTS {}", DIALECT.quote(table));
        if let Err(e) = sqlx::query(&sql).execute(&self.pool).await {
            debug!(error = %e, table, "staging cleanup failed");
        }
    }
}

struct MySqlTx {
    conn: sqlx::pool::PoolConnection<sqlx::MySql>,
}

#[async_trait]
impl AdapterTx for MySqlTx {
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
impl TransactionManager for MySqlAdapter {
    async fn begin(&self) -> Result<Box<dyn AdapterTx>, TdtpError> {
        let mut conn = self.pool.acquire().await.map_err(|e| source_err("begin", e))?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| source_err("begin", e))?;
        Ok(Box::new(MySqlTx { conn }))
    }
}

#[async_trait]
impl RawQueryExecutor for MySqlAdapter {
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
impl Adapter for MySqlAdapter {
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
        "mysql"
    }

    async fn database_version(&self) -> Result<String, TdtpError> {
        sqlx::query_scalar("SELECT VERSION()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| source_err("version", e))
    }

    fn set_include_read_only(&mut self, include: bool) {
        self.include_read_only = include;
    }
}

fn schema_from_rows(rows: &[MySqlRow]) -> Schema {
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

fn decode_cell(row: &MySqlRow, idx: usize) -> Result<Option<String>, TdtpError> {
    let raw = row.try_get_raw(idx).map_err(|e| source_err("decode", e))?;
    if raw.is_null() {
        return Ok(None);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => row
            .try_get::<bool, _>(idx)
            .map(|b| if b { "true" } else { "false" }.to_string()),
        name if name.ends_with("UNSIGNED") => {
            row.try_get::<u64, _>(idx).map(|v| v.to_string())
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get::<i64, _>(idx).map(|v| v.to_string())
        }
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| v.to_string()),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(|v| v.to_string()),
        "DECIMAL" => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .map(|v| v.to_string()),
        "BIT" => row.try_get::<u64, _>(idx).map(|v| v.to_string()),
        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .map(|d| d.format("%Y-%m-%d").to_string()),
        "DATETIME" => row.try_get::<NaiveDateTime, _>(idx).map(|dt| {
            Utc.from_utc_datetime(&dt)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
        }),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .map(|t| t.format("%H:%M:%S%.f").to_string()),
        "JSON" => row
            .try_get::<serde_json::Value, _>(idx)
            .map(|v| v.to_string()),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            row.try_get::<Vec<u8>, _>(idx).map(hex::encode)
        }
        _ => row.try_get::<String, _>(idx),
    }
    .map_err(|e| source_err("decode", e))?;
    Ok(Some(value))
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    repr: Option<&str>,
    field: &Field,
) -> Result<sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>, TdtpError> {
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
                query.bind(v.naive_utc())
            }
            _ => unreachable!(),
        },
        FieldType::Blob => match parse_value(repr, field)? {
            TypedValue::Blob(bytes, _) => query.bind(bytes),
            _ => unreachable!(),
        },
        FieldType::Text => match field.subtype.as_deref() {
            Some("json") => query.bind(
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
        name: "mysql".into(),
        message: format!("{op}: {e}"),
    }
}

/// SQLSTATE class 23 (1062 duplicate key and friends) → constraint
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

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text),
        ])
    }

    #[test]
    fn replace_builds_on_duplicate_key() {
        assert_eq!(
            insert_sql("t", &schema(), WriteStrategy::Replace),
            "INSERT INTO `t` (`id`, `name`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn ignore_uses_insert_ignore() {
        assert_eq!(
            insert_sql("t", &schema(), WriteStrategy::Ignore),
            "INSERT IGNORE INTO `t` (`id`, `name`) VALUES (?, ?)"
        );
    }

    #[test]
    fn fail_is_plain_insert() {
        assert_eq!(
            insert_sql("t", &schema(), WriteStrategy::Fail),
            "INSERT INTO `t` (`id`, `name`) VALUES (?, ?)"
        );
    }
}
