//! Dialect-neutral helper shared by the adapters.
//!
//! Identifier quoting, the bidirectional map between dialect column
//! types and canonical types (with subtype tags preserving dialect
//! nuance), CREATE TABLE generation, bind placeholders, and the
//! pagination rewrite MS SQL Server needs. Adapters consume this by
//! composition; nothing here touches a connection.

use tdtp_core::packet::{Field, Schema};
use tdtp_core::types::FieldType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Mssql,
    Sqlite,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Mssql => "mssql",
            Dialect::Sqlite => "sqlite",
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Mssql => format!("[{}]", ident.replace(']', "]]")),
        }
    }

    /// Bind placeholder for 1-based position `i`.
    pub fn placeholder(&self, i: usize) -> String {
        match self {
            Dialect::Postgres => format!("${i}"),
            Dialect::Mssql => format!("@P{i}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }
}

/// Map a dialect column type to a canonical type plus subtype tag.
///
/// The subtype keeps the dialect nuance (`nvarchar`, `money`,
/// `datetime2`, ...) so a re-emit to the originating dialect restores
/// the original column type. Blob columns always carry the `hex`
/// subtype, since that is the text form adapters export them in.
pub fn column_to_canonical(dialect: Dialect, column_type: &str) -> (FieldType, Option<String>) {
    let lower = column_type.to_ascii_lowercase();
    let base = lower.split('(').next().unwrap_or(&lower).trim().to_string();
    match dialect {
        Dialect::Postgres => postgres_canonical(&base),
        Dialect::MySql => mysql_canonical(&base, &lower),
        Dialect::Mssql => mssql_canonical(&base),
        Dialect::Sqlite => sqlite_canonical(&base),
    }
}

fn tagged(ftype: FieldType, subtype: &str) -> (FieldType, Option<String>) {
    (ftype, Some(subtype.to_string()))
}

fn plain(ftype: FieldType) -> (FieldType, Option<String>) {
    (ftype, None)
}

fn postgres_canonical(base: &str) -> (FieldType, Option<String>) {
    match base {
        "smallint" | "int2" => tagged(FieldType::Integer, "smallint"),
        "integer" | "int" | "int4" => plain(FieldType::Integer),
        "bigint" | "int8" => tagged(FieldType::Integer, "bigint"),
        "serial" | "bigserial" => tagged(FieldType::Integer, base),
        "real" | "float4" => tagged(FieldType::Real, "real"),
        "double precision" | "float8" => plain(FieldType::Real),
        "numeric" | "decimal" => plain(FieldType::Decimal),
        "money" => tagged(FieldType::Decimal, "money"),
        "boolean" | "bool" => plain(FieldType::Boolean),
        "text" => plain(FieldType::Text),
        "character varying" | "varchar" => tagged(FieldType::Text, "varchar"),
        "character" | "bpchar" | "char" => tagged(FieldType::Text, "char"),
        "uuid" => tagged(FieldType::Text, "uuid"),
        "json" => tagged(FieldType::Text, "json"),
        "jsonb" => tagged(FieldType::Text, "jsonb"),
        "date" => plain(FieldType::Date),
        "timestamp without time zone" | "timestamp" => plain(FieldType::Datetime),
        "timestamp with time zone" | "timestamptz" => plain(FieldType::Timestamp),
        "time without time zone" | "time" => tagged(FieldType::Text, "time"),
        "bytea" => tagged(FieldType::Blob, "hex"),
        other => tagged(FieldType::Text, other),
    }
}

fn mysql_canonical(base: &str, full: &str) -> (FieldType, Option<String>) {
    match base {
        "tinyint" if full.starts_with("tinyint(1)") => tagged(FieldType::Boolean, "tinyint"),
        "tinyint" | "smallint" | "mediumint" | "year" => tagged(FieldType::Integer, base),
        "int" | "integer" => plain(FieldType::Integer),
        "bigint" => tagged(FieldType::Integer, "bigint"),
        "float" => tagged(FieldType::Real, "float"),
        "double" | "double precision" | "real" => plain(FieldType::Real),
        "decimal" | "numeric" => plain(FieldType::Decimal),
        "bit" => tagged(FieldType::Boolean, "bit"),
        "char" => tagged(FieldType::Text, "char"),
        "varchar" => plain(FieldType::Text),
        "tinytext" | "mediumtext" | "longtext" => tagged(FieldType::Text, base),
        "text" => plain(FieldType::Text),
        "enum" | "set" => tagged(FieldType::Text, base),
        "json" => tagged(FieldType::Text, "json"),
        "date" => plain(FieldType::Date),
        "datetime" => plain(FieldType::Datetime),
        "timestamp" => plain(FieldType::Timestamp),
        "time" => tagged(FieldType::Text, "time"),
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            tagged(FieldType::Blob, "hex")
        }
        other => tagged(FieldType::Text, other),
    }
}

fn mssql_canonical(base: &str) -> (FieldType, Option<String>) {
    match base {
        "tinyint" | "smallint" => tagged(FieldType::Integer, base),
        "int" => plain(FieldType::Integer),
        "bigint" => tagged(FieldType::Integer, "bigint"),
        "real" => tagged(FieldType::Real, "real"),
        "float" => plain(FieldType::Real),
        "decimal" | "numeric" => plain(FieldType::Decimal),
        "money" => tagged(FieldType::Decimal, "money"),
        "smallmoney" => tagged(FieldType::Decimal, "smallmoney"),
        "bit" => plain(FieldType::Boolean),
        "char" => tagged(FieldType::Text, "char"),
        "varchar" => plain(FieldType::Text),
        "nchar" => tagged(FieldType::Text, "nchar"),
        "nvarchar" => tagged(FieldType::Text, "nvarchar"),
        "text" | "ntext" | "xml" => tagged(FieldType::Text, base),
        "uniqueidentifier" => tagged(FieldType::Text, "uniqueidentifier"),
        "date" => plain(FieldType::Date),
        "smalldatetime" => tagged(FieldType::Datetime, "smalldatetime"),
        "datetime" => tagged(FieldType::Datetime, "datetime"),
        "datetime2" => tagged(FieldType::Datetime, "datetime2"),
        "datetimeoffset" => plain(FieldType::Timestamp),
        "time" => tagged(FieldType::Text, "time"),
        "binary" | "varbinary" | "image" => tagged(FieldType::Blob, "hex"),
        // rowversion columns are read-only; introspection flags them
        "timestamp" | "rowversion" => tagged(FieldType::Blob, "hex"),
        other => tagged(FieldType::Text, other),
    }
}

fn sqlite_canonical(base: &str) -> (FieldType, Option<String>) {
    match base {
        "" => tagged(FieldType::Blob, "hex"),
        b if b.contains("int") => plain(FieldType::Integer),
        "real" | "float" | "double" | "double precision" => plain(FieldType::Real),
        "numeric" | "decimal" => plain(FieldType::Decimal),
        "boolean" | "bool" => plain(FieldType::Boolean),
        "date" => plain(FieldType::Date),
        "datetime" => plain(FieldType::Datetime),
        "timestamp" => plain(FieldType::Timestamp),
        "blob" => tagged(FieldType::Blob, "hex"),
        b if b.contains("char") || b.contains("clob") || b == "text" => plain(FieldType::Text),
        other => tagged(FieldType::Text, other),
    }
}

/// DDL column type for a canonical field in a dialect. A subtype that
/// names a native type of this dialect wins, so schemas round-trip to
/// their originating dialect.
pub fn ddl_type(dialect: Dialect, field: &Field) -> String {
    if let Some(native) = native_subtype_ddl(dialect, field) {
        return native;
    }
    match dialect {
        Dialect::Postgres => match field.ftype {
            FieldType::Integer => "BIGINT".into(),
            FieldType::Real => "DOUBLE PRECISION".into(),
            FieldType::Decimal => decimal_ddl("NUMERIC", field),
            FieldType::Text => text_ddl("TEXT", "VARCHAR", field),
            FieldType::Boolean => "BOOLEAN".into(),
            FieldType::Date => "DATE".into(),
            FieldType::Datetime => "TIMESTAMP".into(),
            FieldType::Timestamp => "TIMESTAMPTZ".into(),
            FieldType::Blob => "BYTEA".into(),
        },
        Dialect::MySql => match field.ftype {
            FieldType::Integer => "BIGINT".into(),
            FieldType::Real => "DOUBLE".into(),
            FieldType::Decimal => decimal_ddl("DECIMAL", field),
            // key columns need a bounded type under MySQL index rules
            FieldType::Text => match field.length {
                Some(n) => format!("VARCHAR({n})"),
                None if field.is_key => "VARCHAR(255)".into(),
                None => "TEXT".into(),
            },
            FieldType::Boolean => "TINYINT(1)".into(),
            FieldType::Date => "DATE".into(),
            FieldType::Datetime => "DATETIME".into(),
            FieldType::Timestamp => "TIMESTAMP".into(),
            FieldType::Blob => "LONGBLOB".into(),
        },
        Dialect::Mssql => match field.ftype {
            FieldType::Integer => "BIGINT".into(),
            FieldType::Real => "FLOAT".into(),
            FieldType::Decimal => decimal_ddl("DECIMAL", field),
            FieldType::Text => match field.length {
                Some(n) => format!("NVARCHAR({n})"),
                None if field.is_key => "NVARCHAR(450)".into(),
                None => "NVARCHAR(MAX)".into(),
            },
            FieldType::Boolean => "BIT".into(),
            FieldType::Date => "DATE".into(),
            FieldType::Datetime => "DATETIME2".into(),
            FieldType::Timestamp => "DATETIMEOFFSET".into(),
            FieldType::Blob => "VARBINARY(MAX)".into(),
        },
        Dialect::Sqlite => match field.ftype {
            FieldType::Integer | FieldType::Boolean => "INTEGER".into(),
            FieldType::Real | FieldType::Decimal => "REAL".into(),
            FieldType::Text | FieldType::Date | FieldType::Datetime | FieldType::Timestamp => {
                "TEXT".into()
            }
            FieldType::Blob => "BLOB".into(),
        },
    }
}

fn decimal_ddl(name: &str, field: &Field) -> String {
    match (field.precision, field.scale) {
        (Some(p), Some(s)) => format!("{name}({p},{s})"),
        (Some(p), None) => format!("{name}({p})"),
        _ => name.to_string(),
    }
}

fn text_ddl(unbounded: &str, bounded: &str, field: &Field) -> String {
    match field.length {
        Some(n) => format!("{bounded}({n})"),
        None => unbounded.to_string(),
    }
}

/// DDL from a dialect-native subtype tag, when the tag belongs to this
/// dialect.
fn native_subtype_ddl(dialect: Dialect, field: &Field) -> Option<String> {
    let subtype = field.subtype.as_deref()?;
    let native: &[&str] = match dialect {
        Dialect::Postgres => &[
            "smallint", "bigint", "real", "money", "varchar", "char", "uuid", "json", "jsonb",
            "time",
        ],
        Dialect::MySql => &[
            "tinyint", "smallint", "mediumint", "bigint", "year", "float", "bit", "char",
            "tinytext", "mediumtext", "longtext", "enum", "set", "json", "time",
        ],
        Dialect::Mssql => &[
            "tinyint", "smallint", "bigint", "real", "money", "smallmoney", "char", "nchar",
            "nvarchar", "text", "ntext", "xml", "uniqueidentifier", "smalldatetime", "datetime",
            "datetime2", "datetimeoffset", "rowversion", "time",
        ],
        // sqlite affinities never need the tag
        Dialect::Sqlite => &[],
    };
    if !native.contains(&subtype) {
        return None;
    }
    let upper = subtype.to_ascii_uppercase();
    Some(match (subtype, field.length, field.precision, field.scale) {
        ("varchar" | "char" | "nchar" | "nvarchar", Some(n), _, _) => format!("{upper}({n})"),
        ("nvarchar", None, _, _) => "NVARCHAR(MAX)".into(),
        ("varchar", None, _, _) if dialect == Dialect::MySql => "VARCHAR(255)".into(),
        ("money" | "smallmoney" | "uniqueidentifier" | "rowversion", _, _, _) => upper,
        (_, _, Some(p), Some(s)) => format!("{upper}({p},{s})"),
        _ => upper,
    })
}

/// CREATE TABLE statement for a schema.
pub fn create_table_sql(
    dialect: Dialect,
    table: &str,
    schema: &Schema,
    if_not_exists: bool,
) -> String {
    let mut sql = String::from("CREATE TABLE ");
    if if_not_exists && dialect != Dialect::Mssql {
        sql.push_str("IF NOT EXISTS ");
    }
    sql.push_str(&dialect.quote(table));
    sql.push_str(" (");
    for (i, field) in schema.fields().iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&dialect.quote(&field.name));
        sql.push(' ');
        sql.push_str(&ddl_type(dialect, field));
    }
    let keys: Vec<String> = schema
        .key_fields()
        .iter()
        .map(|f| dialect.quote(&f.name))
        .collect();
    if !keys.is_empty() {
        sql.push_str(&format!(", PRIMARY KEY ({})", keys.join(", ")));
    }
    sql.push(')');
    sql
}

/// Rewrite dialect-neutral `LIMIT n [OFFSET m]` pagination for MS SQL
/// Server: `ORDER BY ... OFFSET m ROWS [FETCH NEXT n ROWS ONLY]`, with
/// a constant ORDER BY injected when the query has none (OFFSET
/// requires one).
pub fn adapt_pagination(dialect: Dialect, sql: &str) -> String {
    if dialect != Dialect::Mssql {
        return sql.to_string();
    }
    let (body, offset) = match split_tail_count(sql, " OFFSET ") {
        Some((body, n)) => (body, Some(n)),
        None => (sql.to_string(), None),
    };
    let (mut body, limit) = match split_tail_count(&body, " LIMIT ") {
        Some((body, n)) => (body, Some(n)),
        None => (body, None),
    };
    if limit.is_none() && offset.is_none() {
        return body;
    }
    if !body.to_ascii_uppercase().contains(" ORDER BY ") {
        body.push_str(" ORDER BY (SELECT NULL)");
    }
    body.push_str(&format!(" OFFSET {} ROWS", offset.unwrap_or(0)));
    if let Some(limit) = limit {
        body.push_str(&format!(" FETCH NEXT {limit} ROWS ONLY"));
    }
    body
}

/// Split a trailing `<marker><integer>` suffix off the statement.
fn split_tail_count(sql: &str, marker: &str) -> Option<(String, u64)> {
    let pos = sql.rfind(marker)?;
    let count = sql[pos + marker.len()..].trim().parse::<u64>().ok()?;
    Some((sql[..pos].to_string(), count))
}

/// Staging table name for atomic snapshot replacement.
pub fn staging_table_name(table: &str) -> String {
    format!("{table}_tmp_{}", chrono::Utc::now().timestamp_micros())
}

/// Name the previous snapshot parks under during the swap.
pub fn old_table_name(table: &str) -> String {
    format!("{table}_old")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::packet::Field;

    #[test]
    fn quoting_per_dialect() {
        assert_eq!(Dialect::Postgres.quote("users"), "\"users\"");
        assert_eq!(Dialect::MySql.quote("users"), "`users`");
        assert_eq!(Dialect::Mssql.quote("users"), "[users]");
        assert_eq!(Dialect::Postgres.quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn canonical_mapping_with_subtypes() {
        let (t, s) = column_to_canonical(Dialect::Mssql, "nvarchar(100)");
        assert_eq!(t, FieldType::Text);
        assert_eq!(s.as_deref(), Some("nvarchar"));

        let (t, s) = column_to_canonical(Dialect::Mssql, "uniqueidentifier");
        assert_eq!(t, FieldType::Text);
        assert_eq!(s.as_deref(), Some("uniqueidentifier"));

        let (t, s) = column_to_canonical(Dialect::Postgres, "timestamp with time zone");
        assert_eq!(t, FieldType::Timestamp);
        assert!(s.is_none());

        let (t, s) = column_to_canonical(Dialect::MySql, "tinyint(1)");
        assert_eq!(t, FieldType::Boolean);
        assert_eq!(s.as_deref(), Some("tinyint"));

        let (t, s) = column_to_canonical(Dialect::Sqlite, "INTEGER");
        assert_eq!(t, FieldType::Integer);
        assert!(s.is_none());
    }

    #[test]
    fn subtype_round_trips_to_origin_dialect() {
        let field = Field::new("title", FieldType::Text)
            .with_length(100)
            .with_subtype("nvarchar");
        assert_eq!(ddl_type(Dialect::Mssql, &field), "NVARCHAR(100)");
        // a foreign dialect ignores the tag
        assert_eq!(ddl_type(Dialect::Postgres, &field), "VARCHAR(100)");

        let field = Field::new("price", FieldType::Decimal).with_subtype("money");
        assert_eq!(ddl_type(Dialect::Mssql, &field), "MONEY");
        assert_eq!(ddl_type(Dialect::Sqlite, &field), "REAL");
    }

    #[test]
    fn create_table_with_composite_key() {
        let schema = Schema::new(vec![
            Field::new("tenant", FieldType::Integer).key(),
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text),
        ]);
        assert_eq!(
            create_table_sql(Dialect::Sqlite, "t", &schema, true),
            "CREATE TABLE IF NOT EXISTS \"t\" (\"tenant\" INTEGER, \"id\" INTEGER, \"name\" TEXT, PRIMARY KEY (\"tenant\", \"id\"))"
        );
    }

    #[test]
    fn mssql_pagination_rewrite() {
        assert_eq!(
            adapt_pagination(Dialect::Mssql, "SELECT * FROM t ORDER BY id ASC LIMIT 10 OFFSET 5"),
            "SELECT * FROM t ORDER BY id ASC OFFSET 5 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert_eq!(
            adapt_pagination(Dialect::Mssql, "SELECT * FROM t LIMIT 3"),
            "SELECT * FROM t ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT 3 ROWS ONLY"
        );
        assert_eq!(
            adapt_pagination(Dialect::Mssql, "SELECT * FROM t OFFSET 7"),
            "SELECT * FROM t ORDER BY (SELECT NULL) OFFSET 7 ROWS"
        );
        assert_eq!(
            adapt_pagination(Dialect::Mssql, "SELECT * FROM t WHERE a = 1"),
            "SELECT * FROM t WHERE a = 1"
        );
        // other dialects take LIMIT/OFFSET as-is
        assert_eq!(
            adapt_pagination(Dialect::Postgres, "SELECT * FROM t LIMIT 3"),
            "SELECT * FROM t LIMIT 3"
        );
    }

    #[test]
    fn staging_names() {
        let staging = staging_table_name("users");
        assert!(staging.starts_with("users_tmp_"));
        assert_eq!(old_table_name("users"), "users_old");
    }
}
