//! MS SQL Server adapter (tiberius).
//!
//! DSNs use the ADO.NET form (`server=tcp:host,1433;user=...`). The
//! Replace strategy issues one MERGE per row inside a transaction;
//! imports into identity columns toggle IDENTITY_INSERT around the
//! batch. OFFSET/FETCH push-down requires compatibility level 110+,
//! probed at connect time; below that the adapter filters in memory.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use tiberius::{Client, ColumnData, ColumnType, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
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

const DIALECT: Dialect = Dialect::Mssql;

/// OFFSET/FETCH needs SQL Server 2012 semantics.
const OFFSET_FETCH_COMPAT_LEVEL: u8 = 110;

type MsClient = Client<Compat<TcpStream>>;

#[derive(Debug)]
pub struct MssqlAdapter {
    client: Arc<Mutex<MsClient>>,
    compatibility_level: u8,
    include_read_only: bool,
}

impl MssqlAdapter {
    pub async fn connect(dsn: &str) -> Result<Self, TdtpError> {
        let config = Config::from_ado_string(dsn).map_err(|e| source_err("connect", e))?;
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| source_err("connect", e))?;
        tcp.set_nodelay(true).map_err(|e| source_err("connect", e))?;
        let mut client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| source_err("connect", e))?;

        let compatibility_level = {
            let rows = client
                .query(
                    "SELECT compatibility_level FROM sys.databases WHERE name = DB_NAME()",
                    &[],
                )
                .await
                .map_err(|e| source_err("probe", e))?
                .into_first_result()
                .await
                .map_err(|e| source_err("probe", e))?;
            rows.first()
                .and_then(|r| r.try_get::<u8, _>(0).ok().flatten())
                .unwrap_or(OFFSET_FETCH_COMPAT_LEVEL)
        };
        debug!(compatibility_level, "sql server connected");
        Ok(MssqlAdapter {
            client: Arc::new(Mutex::new(client)),
            compatibility_level,
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
        let mut client = self.client.lock().await;
        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| source_err("select", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("select", e))?;
        rows.into_iter()
            .map(|row| {
                let columns: Result<Vec<Option<String>>, TdtpError> =
                    row.into_iter().map(|data| cell_to_string(&data)).collect();
                Ok(Row::new(encode_row(&columns?)))
            })
            .collect()
    }

    async fn fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| source_err("count", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("count", e))?;
        let count: i32 = rows
            .first()
            .and_then(|r| r.try_get(0).ok().flatten())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn identity_columns(&self, table: &str) -> Result<Vec<String>, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT c.name FROM sys.columns c WHERE c.object_id = OBJECT_ID(@P1) AND c.is_identity = 1",
                &[&table],
            )
            .await
            .map_err(|e| source_err("identity_probe", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("identity_probe", e))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
            .collect())
    }

    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Row],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let strategy = match strategy {
            // no separate bulk path through this driver
            WriteStrategy::Copy => WriteStrategy::Replace,
            other => other,
        };
        let identity = self.identity_columns(table).await?;
        let needs_identity_insert = schema
            .fields()
            .iter()
            .any(|f| identity.iter().any(|c| c == &f.name));

        let sql = match strategy {
            WriteStrategy::Replace => merge_sql(table, schema),
            _ => insert_sql(table, schema),
        };
        let mut summary = ImportSummary::default();

        let mut client = self.client.lock().await;
        client
            .execute("BEGIN TRAN", &[])
            .await
            .map_err(|e| source_err("begin", e))?;
        if needs_identity_insert {
            let stmt = format!("SET IDENTITY_INSERT {} ON", DIALECT.quote(table));
            client
                .execute(stmt.as_str(), &[])
                .await
                .map_err(|e| source_err("identity_insert", e))?;
        }

        let result = async {
            for row in rows {
                let columns = decode_row(&row.value)?;
                if columns.len() != schema.len() {
                    return Err(TdtpError::Packet(format!(
                        "row has {} columns, schema has {}",
                        columns.len(),
                        schema.len()
                    )));
                }
                let values = bind_values(&columns, schema)?;
                let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
                match client.execute(sql.as_str(), &params).await {
                    Ok(_) => summary.inserted += 1,
                    Err(e) if strategy == WriteStrategy::Ignore && is_unique_violation(&e) => {
                        summary.ignored += 1;
                    }
                    Err(e) => return Err(map_write_err(e)),
                }
            }
            Ok(())
        }
        .await;

        if needs_identity_insert {
            let stmt = format!("SET IDENTITY_INSERT {} OFF", DIALECT.quote(table));
            let _ = client.execute(stmt.as_str(), &[]).await;
        }
        match result {
            Ok(()) => {
                client
                    .execute("COMMIT TRAN", &[])
                    .await
                    .map_err(|e| source_err("commit", e))?;
                Ok(summary)
            }
            Err(e) => {
                let _ = client.execute("ROLLBACK TRAN", &[]).await;
                Err(e)
            }
        }
    }

    async fn exec(&self, sql: &str) -> Result<u64, TdtpError> {
        let mut client = self.client.lock().await;
        client
            .execute(sql, &[])
            .await
            .map(|r| r.total())
            .map_err(map_write_err)
    }
}

fn insert_sql(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| DIALECT.quote(&f.name))
        .collect();
    let placeholders: Vec<String> = (1..=schema.len()).map(|i| DIALECT.placeholder(i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        DIALECT.quote(table),
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// One-row MERGE: update on key match, insert otherwise.
fn merge_sql(table: &str, schema: &Schema) -> String {
    let keys = schema.key_fields();
    if keys.is_empty() {
        return insert_sql(table, schema);
    }
    let src_columns: Vec<String> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} AS {}", DIALECT.placeholder(i + 1), DIALECT.quote(&f.name)))
        .collect();
    let on: Vec<String> = keys
        .iter()
        .map(|f| {
            let q = DIALECT.quote(&f.name);
            format!("tgt.{q} = src.{q}")
        })
        .collect();
    let updates: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| !f.is_key)
        .map(|f| {
            let q = DIALECT.quote(&f.name);
            format!("{q} = src.{q}")
        })
        .collect();
    let insert_columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| DIALECT.quote(&f.name))
        .collect();
    let insert_values: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("src.{}", DIALECT.quote(&f.name)))
        .collect();

    let mut sql = format!(
        "MERGE INTO {} AS tgt USING (SELECT {}) AS src ON {}",
        DIALECT.quote(table),
        src_columns.join(", "),
        on.join(" AND ")
    );
    if !updates.is_empty() {
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")));
    }
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
        insert_columns.join(", "),
        insert_values.join(", ")
    ));
    sql
}

#[async_trait]
impl SchemaReader for MssqlAdapter {
    async fn table_names(&self) -> Result<Vec<String>, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query("SELECT name FROM sys.tables ORDER BY name", &[])
            .await
            .map_err(|e| source_err("table_names", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("table_names", e))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
            .collect())
    }

    async fn view_names(&self) -> Result<Vec<String>, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query("SELECT name FROM sys.views ORDER BY name", &[])
            .await
            .map_err(|e| source_err("view_names", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("view_names", e))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
            .collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT COUNT(*) FROM sys.objects WHERE name = @P1 AND type IN ('U', 'V')",
                &[&table],
            )
            .await
            .map_err(|e| source_err("table_exists", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("table_exists", e))?;
        let count: i32 = rows
            .first()
            .and_then(|r| r.try_get(0).ok().flatten())
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn table_schema(&self, table: &str) -> Result<Schema, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT c.name, t.name AS type_name, c.max_length, c.precision, c.scale, \
                        c.is_identity, c.is_computed, \
                        CASE WHEN pk.column_id IS NOT NULL THEN 1 ELSE 0 END AS is_key \
                 FROM sys.columns c \
                 JOIN sys.types t ON t.user_type_id = c.user_type_id \
                 LEFT JOIN (SELECT ic.object_id, ic.column_id \
                            FROM sys.index_columns ic \
                            JOIN sys.indexes i ON i.object_id = ic.object_id \
                             AND i.index_id = ic.index_id AND i.is_primary_key = 1) pk \
                   ON pk.object_id = c.object_id AND pk.column_id = c.column_id \
                 WHERE c.object_id = OBJECT_ID(@P1) \
                 ORDER BY c.column_id",
                &[&table],
            )
            .await
            .map_err(|e| source_err("table_schema", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("table_schema", e))?;
        if rows.is_empty() {
            return Err(TdtpError::SchemaMismatch(format!(
                "table {table:?} does not exist"
            )));
        }
        let mut fields = Vec::with_capacity(rows.len());
        for row in rows {
            let name: &str = row
                .try_get(0)
                .map_err(|e| source_err("table_schema", e))?
                .unwrap_or_default();
            let type_name: &str = row
                .try_get(1)
                .map_err(|e| source_err("table_schema", e))?
                .unwrap_or_default();
            let max_length: i16 = row.try_get(2).ok().flatten().unwrap_or(0);
            let precision: u8 = row.try_get(3).ok().flatten().unwrap_or(0);
            let scale: u8 = row.try_get(4).ok().flatten().unwrap_or(0);
            let is_identity: bool = row.try_get(5).ok().flatten().unwrap_or(false);
            let is_computed: bool = row.try_get(6).ok().flatten().unwrap_or(false);
            let is_key: i32 = row.try_get(7).ok().flatten().unwrap_or(0);

            let (ftype, subtype) = dialect::column_to_canonical(DIALECT, type_name);
            let mut field = Field::new(name.to_string(), ftype);
            field.subtype = subtype;
            if ftype == FieldType::Text && max_length > 0 {
                // nvarchar lengths are stored in bytes, two per character
                let divisor = if type_name.starts_with('n') { 2 } else { 1 };
                field.length = Some((max_length / divisor) as u32);
            }
            if ftype == FieldType::Decimal && precision > 0 {
                field.precision = Some(precision as u32);
                field.scale = Some(scale as u32);
            }
            field.is_key = is_key == 1;
            field.read_only = is_identity
                || is_computed
                || matches!(type_name, "timestamp" | "rowversion");
            fields.push(field);
        }
        Ok(Schema::new(fields))
    }
}

#[async_trait]
impl DataReader for MssqlAdapter {
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
        let pagination_ok = self.compatibility_level >= OFFSET_FETCH_COMPAT_LEVEL
            || (query.limit.is_none() && query.offset.is_none());
        crate::adapter_common::pushdown_response(
            self,
            DIALECT,
            query,
            full_schema,
            self.include_read_only,
            pagination_ok,
            sender,
            recipient,
        )
        .await
    }
}

#[async_trait]
impl crate::adapter_common::SqlPort for MssqlAdapter {
    async fn port_fetch_rows(&self, sql: &str, _schema: &Schema) -> Result<Vec<Row>, TdtpError> {
        self.fetch_rows(sql).await
    }

    async fn port_fetch_count(&self, sql: &str) -> Result<u64, TdtpError> {
        self.fetch_count(sql).await
    }
}

#[async_trait]
impl DataWriter for MssqlAdapter {
    async fn import_packet(
        &self,
        packet: &Packet,
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let table = &packet.header.table;
        if !self.table_exists(table).await? {
            let sql = dialect::create_table_sql(DIALECT, table, &packet.schema, false);
            self.exec(&sql).await?;
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

        self.exec(&dialect::create_table_sql(DIALECT, &staging, &first.schema, false))
            .await?;
        let mut summary = ImportSummary::default();
        for packet in packets {
            match self
                .insert_rows(&staging, &packet.schema, &packet.data.rows, WriteStrategy::Fail)
                .await
            {
                Ok(s) => summary.merge(s),
                Err(e) => {
                    let _ = self.exec(&format!("DROP TABLE {}", DIALECT.quote(&staging))).await;
                    return Err(e);
                }
            }
        }

        let target_exists = self.table_exists(&table).await?;
        if target_exists {
            if let Err(e) = self.rename_table(&table, &old).await {
                let _ = self.exec(&format!("DROP TABLE {}", DIALECT.quote(&staging))).await;
                return Err(e);
            }
        }
        if let Err(e) = self.rename_table(&staging, &table).await {
            // compensating rename: restore the previous snapshot
            if target_exists {
                if let Err(undo) = self.rename_table(&old, &table).await {
                    tracing::warn!(error = %undo, table, "compensating rename failed");
                }
            }
            let _ = self.exec(&format!("DROP TABLE {}", DIALECT.quote(&staging))).await;
            return Err(e);
        }
        if target_exists {
            self.exec(&format!("DROP TABLE {}", DIALECT.quote(&old))).await?;
        }
        Ok(summary)
    }
}

impl MssqlAdapter {
    async fn rename_table(&self, from: &str, to: &str) -> Result<(), TdtpError> {
        let mut client = self.client.lock().await;
        client
            .execute("EXEC sp_rename @P1, @P2", &[&from, &to])
            .await
            .map(|_| ())
            .map_err(|e| source_err("rename", e))
    }
}

struct MssqlTx {
    client: Arc<Mutex<MsClient>>,
    // BEGIN TRAN was issued on this shared connection
}

#[async_trait]
impl AdapterTx for MssqlTx {
    async fn execute(&mut self, sql: &str) -> Result<u64, TdtpError> {
        let mut client = self.client.lock().await;
        client
            .execute(sql, &[])
            .await
            .map(|r| r.total())
            .map_err(map_write_err)
    }

    async fn commit(self: Box<Self>) -> Result<(), TdtpError> {
        let mut client = self.client.lock().await;
        client
            .execute("COMMIT TRAN", &[])
            .await
            .map(|_| ())
            .map_err(|e| source_err("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), TdtpError> {
        let mut client = self.client.lock().await;
        client
            .execute("ROLLBACK TRAN", &[])
            .await
            .map(|_| ())
            .map_err(|e| source_err("rollback", e))
    }
}

#[async_trait]
impl TransactionManager for MssqlAdapter {
    async fn begin(&self) -> Result<Box<dyn AdapterTx>, TdtpError> {
        {
            let mut client = self.client.lock().await;
            client
                .execute("BEGIN TRAN", &[])
                .await
                .map_err(|e| source_err("begin", e))?;
        }
        Ok(Box::new(MssqlTx {
            client: Arc::clone(&self.client),
        }))
    }
}

#[async_trait]
impl RawQueryExecutor for MssqlAdapter {
    async fn execute_raw_query(
        &self,
        sql: &str,
        result_table: &str,
    ) -> Result<Packet, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| source_err("raw_query", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("raw_query", e))?;
        drop(client);

        let schema = match rows.first() {
            None => Schema::default(),
            Some(first) => Schema::new(
                first
                    .columns()
                    .iter()
                    .map(|col| {
                        let (ftype, subtype) = dialect::column_to_canonical(
                            DIALECT,
                            column_type_name(col.column_type()),
                        );
                        let mut field = Field::new(col.name(), ftype);
                        field.subtype = subtype;
                        field
                    })
                    .collect(),
            ),
        };
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let columns: Result<Vec<Option<String>>, TdtpError> =
                row.into_iter().map(|data| cell_to_string(&data)).collect();
            encoded.push(Row::new(encode_row(&columns?)));
        }
        crate::adapter_common::single_reference_packet(result_table, schema, encoded)
    }
}

#[async_trait]
impl Adapter for MssqlAdapter {
    async fn ping(&self) -> Result<(), TdtpError> {
        self.exec("SELECT 1").await.map(|_| ())
    }

    async fn close(&self) -> Result<(), TdtpError> {
        // tiberius closes on drop; nothing to release eagerly
        Ok(())
    }

    fn database_type(&self) -> &'static str {
        "mssql"
    }

    async fn database_version(&self) -> Result<String, TdtpError> {
        let mut client = self.client.lock().await;
        let rows = client
            .query("SELECT @@VERSION", &[])
            .await
            .map_err(|e| source_err("version", e))?
            .into_first_result()
            .await
            .map_err(|e| source_err("version", e))?;
        Ok(rows
            .first()
            .and_then(|r| r.try_get::<&str, _>(0).ok().flatten())
            .unwrap_or_default()
            .to_string())
    }

    fn set_include_read_only(&mut self, include: bool) {
        self.include_read_only = include;
    }
}

fn column_type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money | ColumnType::Money4 => "money",
        ColumnType::Decimaln | ColumnType::Numericn => "decimal",
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::BigChar => "char",
        ColumnType::BigVarChar | ColumnType::Text => "varchar",
        ColumnType::NChar => "nchar",
        ColumnType::NVarchar | ColumnType::NText => "nvarchar",
        ColumnType::BigBinary | ColumnType::BigVarBin | ColumnType::Image => "varbinary",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::Datetime | ColumnType::Datetime4 | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Xml => "xml",
        _ => "nvarchar",
    }
}

/// One TDS value → canonical string form.
fn cell_to_string(data: &ColumnData<'static>) -> Result<Option<String>, TdtpError> {
    let temporal = |e: tiberius::error::Error| source_err("decode", e);
    Ok(match data {
        ColumnData::U8(v) => v.map(|x| x.to_string()),
        ColumnData::I16(v) => v.map(|x| x.to_string()),
        ColumnData::I32(v) => v.map(|x| x.to_string()),
        ColumnData::I64(v) => v.map(|x| x.to_string()),
        ColumnData::F32(v) => v.map(|x| x.to_string()),
        ColumnData::F64(v) => v.map(|x| x.to_string()),
        ColumnData::Bit(v) => v.map(|b| if b { "true" } else { "false" }.to_string()),
        ColumnData::String(v) => v.as_ref().map(|s| s.to_string()),
        ColumnData::Guid(v) => v.map(|g| g.to_string()),
        ColumnData::Binary(v) => v.as_ref().map(|b| hex::encode(b.as_ref())),
        ColumnData::Numeric(v) => v.map(|n| n.to_string()),
        ColumnData::Xml(v) => v.as_ref().map(|x| x.to_string()),
        ColumnData::Date(_) => NaiveDate::from_sql(data)
            .map_err(temporal)?
            .map(|d| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => NaiveTime::from_sql(data)
            .map_err(temporal)?
            .map(|t| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::SmallDateTime(_) | ColumnData::DateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data).map_err(temporal)?.map(|dt| {
                Utc.from_utc_datetime(&dt)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
            })
        }
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)
            .map_err(temporal)?
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
    })
}

/// Owned parameter value with a [`ToSql`] view.
enum MsVal {
    Null,
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<Utc>),
}

impl ToSql for MsVal {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            MsVal::Null => ColumnData::String(None),
            MsVal::I64(v) => v.to_sql(),
            MsVal::F64(v) => v.to_sql(),
            MsVal::Bool(v) => v.to_sql(),
            MsVal::Str(v) => ColumnData::String(Some(v.as_str().into())),
            MsVal::Bytes(v) => ColumnData::Binary(Some(v.as_slice().into())),
            MsVal::Date(v) => v.to_sql(),
            MsVal::DateTime(v) => v.to_sql(),
            MsVal::DateTimeOffset(v) => v.to_sql(),
        }
    }
}

fn bind_values(columns: &[Option<String>], schema: &Schema) -> Result<Vec<MsVal>, TdtpError> {
    use tdtp_core::types::{parse_value, TypedValue};
    columns
        .iter()
        .zip(schema.fields())
        .map(|(repr, field)| {
            let Some(repr) = repr else {
                return Ok(MsVal::Null);
            };
            Ok(match field.ftype {
                FieldType::Integer => match parse_value(repr, field)? {
                    TypedValue::Integer(v) => MsVal::I64(v),
                    _ => unreachable!(),
                },
                FieldType::Real | FieldType::Decimal => match parse_value(repr, field)? {
                    TypedValue::Real(v) | TypedValue::Decimal { value: v, .. } => MsVal::F64(v),
                    _ => unreachable!(),
                },
                FieldType::Boolean => match parse_value(repr, field)? {
                    TypedValue::Boolean(v) => MsVal::Bool(v),
                    _ => unreachable!(),
                },
                FieldType::Date => match parse_value(repr, field)? {
                    TypedValue::Date(v) => MsVal::Date(v),
                    _ => unreachable!(),
                },
                FieldType::Datetime => match parse_value(repr, field)? {
                    TypedValue::Datetime(v) | TypedValue::Timestamp(v) => {
                        MsVal::DateTime(v.naive_utc())
                    }
                    _ => unreachable!(),
                },
                FieldType::Timestamp => match parse_value(repr, field)? {
                    TypedValue::Datetime(v) | TypedValue::Timestamp(v) => {
                        MsVal::DateTimeOffset(v.with_timezone(&Utc))
                    }
                    _ => unreachable!(),
                },
                FieldType::Blob => match parse_value(repr, field)? {
                    TypedValue::Blob(bytes, _) => MsVal::Bytes(bytes),
                    _ => unreachable!(),
                },
                FieldType::Text => MsVal::Str(repr.to_string()),
            })
        })
        .collect()
}

fn source_err(op: &str, e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Source {
        name: "mssql".into(),
        message: format!("{op}: {e}"),
    }
}

/// 2627 = PK violation, 2601 = unique index violation.
fn is_unique_violation(e: &tiberius::error::Error) -> bool {
    matches!(e, tiberius::error::Error::Server(token) if token.code() == 2627 || token.code() == 2601)
}

fn map_write_err(e: tiberius::error::Error) -> TdtpError {
    if let tiberius::error::Error::Server(token) = &e {
        // constraint family: PK, unique, FK, check
        if matches!(token.code(), 2627 | 2601 | 547) {
            return TdtpError::Constraint(token.message().to_string());
        }
    }
    source_err("write", e)
}
