use std::fmt::Write;

use anyhow::bail;
use itertools::Itertools;
use sqlx::PgPool;

/// A statement with `:name` parameters rewritten to positional `$n` ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedStatement {
    sql: String,
    params: Vec<String>,
}

impl NamedStatement {
    /// Rewrites every `:name` outside of quotes into `$n`. Repeated names share
    /// one position and `::` casts are kept.
    pub fn parse(statement: &str) -> NamedStatement {
        let mut sql = String::with_capacity(statement.len());
        let mut params: Vec<String> = Vec::new();
        let mut chars = statement.chars().peekable();
        let mut quote = None;

        while let Some(c) = chars.next() {
            if let Some(open) = quote {
                sql.push(c);
                if c == open {
                    quote = None;
                }
                continue;
            }

            match c {
                '\'' | '"' => {
                    quote = Some(c);
                    sql.push(c);
                }
                ':' if chars.peek() == Some(&':') => {
                    chars.next();
                    sql.push_str("::");
                }
                ':' if chars
                    .peek()
                    .is_some_and(|next| next.is_ascii_alphabetic() || *next == '_') =>
                {
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if !(next.is_ascii_alphanumeric() || next == '_') {
                            break;
                        }
                        name.push(next);
                        chars.next();
                    }
                    let position = match params.iter().position(|param| *param == name) {
                        Some(position) => position,
                        None => {
                            params.push(name);
                            params.len() - 1
                        }
                    };
                    let _ = write!(sql, "${}", position + 1);
                }
                _ => sql.push(c),
            }
        }

        NamedStatement { sql, params }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in positional order.
    pub fn params(&self) -> &[String] {
        &self.params
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    // Values arrive as JSON, the cast lets the database convert them.
    fn placeholder(&self) -> String {
        match self.data_type.as_str() {
            "" | "ARRAY" | "USER-DEFINED" => format!(":{}", self.name),
            data_type => format!(":{}::{}", self.name, data_type),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<Column>,
}

impl TableDescription {
    /// Loads the columns and the primary key of `table`.
    pub async fn load(pool: &PgPool, table: &str) -> anyhow::Result<TableDescription> {
        let columns: Vec<(String, String)> = sqlx::query_as(
            r#"
            select column_name, data_type
            from information_schema.columns
            where table_name = $1
            order by ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        let primary_key: Vec<(String,)> = sqlx::query_as(
            r#"
            select kcu.column_name
            from information_schema.table_constraints tc
            join information_schema.key_column_usage kcu
              on tc.constraint_name = kcu.constraint_name
             and tc.table_schema = kcu.table_schema
             and tc.table_name = kcu.table_name
            where tc.constraint_type = 'PRIMARY KEY' and tc.table_name = $1
            order by kcu.ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        if columns.is_empty() {
            bail!("Table {table} not found");
        }

        let columns: Vec<Column> = columns
            .into_iter()
            .map(|(name, data_type)| Column { name, data_type })
            .collect();
        let primary_key = primary_key
            .into_iter()
            .filter_map(|(name,)| columns.iter().find(|column| column.name == name).cloned())
            .collect();

        Ok(TableDescription {
            name: table.to_string(),
            columns,
            primary_key,
        })
    }

    pub fn key_column_names(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }

    pub fn upsert_statement(&self) -> String {
        format!(
            "UPSERT INTO {} ({}) VALUES ({})",
            self.name,
            self.columns.iter().map(|column| &column.name).join(", "),
            self.columns.iter().map(Column::placeholder).join(", ")
        )
    }

    pub fn delete_statement(&self) -> anyhow::Result<String> {
        if self.primary_key.is_empty() {
            bail!("Table {} has no primary key", self.name);
        }
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            self.name,
            self.primary_key
                .iter()
                .map(|column| format!("{} = {}", column.name, column.placeholder()))
                .join(" AND ")
        ))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ChangeFeedStyle {
    #[default]
    Simple,
    /// Adds resolved timestamps and webhook sink batching.
    Advanced,
}

/// The address a change feed posts to for the given subscriber.
pub fn callback_url(public_url: &str, subscriber_id: &str) -> String {
    format!(
        "{}/{}?insecure_tls_skip_verify=true",
        public_url.trim_end_matches('/'),
        subscriber_id
    )
}

pub fn changefeed_statement(style: ChangeFeedStyle, table: &str, callback_url: &str) -> String {
    match style {
        ChangeFeedStyle::Simple => format!(
            "CREATE CHANGEFEED FOR TABLE {table} INTO 'webhook-{callback_url}' WITH updated;"
        ),
        ChangeFeedStyle::Advanced => format!(
            "CREATE CHANGEFEED FOR TABLE {table} INTO 'webhook-{callback_url}' \
             WITH updated, resolved='15s', \
             webhook_sink_config='{{\"Flush\": {{\"Messages\": 64, \"Frequency\": \"1s\"}}, \"Retry\": {{\"Max\": \"inf\"}}}}';"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> TableDescription {
        TableDescription {
            name: "products".to_string(),
            columns: vec![
                Column::new("id", "uuid"),
                Column::new("name", "text"),
                Column::new("tags", "ARRAY"),
            ],
            primary_key: vec![Column::new("id", "uuid")],
        }
    }

    #[test]
    fn test_parse_named_parameters() {
        let statement = NamedStatement::parse(
            "UPDATE t SET v = :v, w = ':skipped', \"x:y\" = :v::INT8 WHERE pk = :pk",
        );
        assert_eq!(
            statement.sql(),
            "UPDATE t SET v = $1, w = ':skipped', \"x:y\" = $1::INT8 WHERE pk = $2"
        );
        assert_eq!(statement.params(), &["v".to_string(), "pk".to_string()]);
    }

    #[test]
    fn test_parse_without_parameters() {
        let statement = NamedStatement::parse("SELECT now()::STRING, 'it''s :x'");
        assert_eq!(statement.sql(), "SELECT now()::STRING, 'it''s :x'");
        assert!(statement.params().is_empty());
    }

    #[test]
    fn test_generated_statements() {
        let table = products();
        assert_eq!(
            table.upsert_statement(),
            "UPSERT INTO products (id, name, tags) VALUES (:id::uuid, :name::text, :tags)"
        );
        assert_eq!(
            table.delete_statement().unwrap(),
            "DELETE FROM products WHERE id = :id::uuid"
        );
        assert_eq!(table.key_column_names(), vec!["id".to_string()]);

        let parsed = NamedStatement::parse(&table.upsert_statement());
        assert_eq!(
            parsed.sql(),
            "UPSERT INTO products (id, name, tags) VALUES ($1::uuid, $2::text, $3)"
        );
    }

    #[test]
    fn test_delete_requires_primary_key() {
        let mut table = products();
        table.primary_key.clear();
        assert!(table.delete_statement().is_err());
    }

    #[test]
    fn test_changefeed_statements() {
        let url = callback_url("https://10.0.0.1:8443/", "products-1");
        assert_eq!(
            url,
            "https://10.0.0.1:8443/products-1?insecure_tls_skip_verify=true"
        );
        assert_eq!(
            changefeed_statement(ChangeFeedStyle::Simple, "products", &url),
            "CREATE CHANGEFEED FOR TABLE products INTO \
             'webhook-https://10.0.0.1:8443/products-1?insecure_tls_skip_verify=true' WITH updated;"
        );
        let advanced = changefeed_statement(ChangeFeedStyle::Advanced, "products", &url);
        assert!(advanced.contains("WITH updated, resolved='15s', webhook_sink_config="));
        assert!(advanced.ends_with(r#""Retry": {"Max": "inf"}}';"#));
    }
}
