//! PostgreSQL action.
//!
//! Configuration keys: `query` (required), `parameters` (positional
//! values), `connection_string` (overridable by the credential payload's
//! `connection_string` or discrete `host`/`port`/`user`/`password`/`db`
//! fields). SELECTs return rows as JSON objects; other statements return
//! the affected-row count.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, PgConnection, Row, TypeInfo};

use playmill_core::{ActionKind, ErrorObject};

use super::{Action, ActionInvocation, SecretHandle};

pub struct PostgresAction;

#[async_trait]
impl Action for PostgresAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Postgres
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        let query = invocation
            .config_str("query")
            .or_else(|| invocation.config_str("command"))
            .ok_or_else(|| {
                ErrorObject::validation("postgres action requires `query`").with_retryable(false)
            })?
            .to_string();

        let url = connection_url(&invocation)?;
        let mut conn = PgConnection::connect(&url).await.map_err(|e| {
            ErrorObject::transport(format!("postgres connect failed: {e}")).with_source("postgres")
        })?;

        let mut prepared = sqlx::query(&query);
        if let Some(Value::Array(parameters)) = invocation.config.get("parameters") {
            for parameter in parameters {
                prepared = match parameter {
                    Value::Null => prepared.bind(None::<String>),
                    Value::Bool(b) => prepared.bind(*b),
                    Value::Number(n) if n.is_i64() => prepared.bind(n.as_i64()),
                    Value::Number(n) => prepared.bind(n.as_f64()),
                    Value::String(s) => prepared.bind(s.clone()),
                    other => prepared.bind(other.clone()),
                };
            }
        }

        let is_select = query.trim_start().to_lowercase().starts_with("select")
            || query.trim_start().to_lowercase().starts_with("with");

        let result = if is_select {
            let rows = prepared.fetch_all(&mut conn).await.map_err(classify)?;
            let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
            json!({ "rows": rows, "row_count": rows.len() })
        } else {
            let done = prepared.execute(&mut conn).await.map_err(classify)?;
            json!({ "rows_affected": done.rows_affected() })
        };

        let _ = conn.close().await;
        Ok(result)
    }
}

/// SQL-level failures are logical action errors; everything at or below
/// the connection is transport.
fn classify(e: sqlx::Error) -> ErrorObject {
    match &e {
        sqlx::Error::Database(db) => {
            ErrorObject::action(format!("sql error: {db}")).with_source("postgres")
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ErrorObject::transport(format!("postgres i/o error: {e}")).with_source("postgres")
        }
        _ => ErrorObject::action(format!("postgres error: {e}")).with_source("postgres"),
    }
}

fn connection_url(invocation: &ActionInvocation) -> Result<String, ErrorObject> {
    if let Some(url) = invocation.config_str("connection_string") {
        return Ok(url.to_string());
    }
    if let Some(secret) = &invocation.secret {
        return url_from_secret(secret);
    }
    Err(ErrorObject::auth(
        "postgres action requires `connection_string` or a credential",
    )
    .with_retryable(false))
}

fn url_from_secret(secret: &SecretHandle) -> Result<String, ErrorObject> {
    if let Some(url) = secret.field("connection_string") {
        return Ok(url.to_string());
    }
    let host = secret.field("host").unwrap_or("localhost");
    let port = secret
        .expose()
        .get("port")
        .map(|p| match p {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "5432".to_string());
    let user = secret
        .field("user")
        .ok_or_else(|| ErrorObject::auth("postgres credential is missing `user`"))?;
    let password = secret.field("password").unwrap_or_default();
    let db = secret.field("db").unwrap_or("postgres");
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "INT2" | "INT4" | "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name).ok().flatten(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}
