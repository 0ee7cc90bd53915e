//! HTTP action.
//!
//! Configuration keys: `url` (required), `method`, `headers`, `params`,
//! `body` (JSON). Bearer credentials attach via the secret handle's
//! `token` field. Connection failures and 5xx responses are transport
//! errors (retryable); 4xx responses are logical action errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use playmill_core::{ActionKind, ErrorObject};

use super::{Action, ActionInvocation};

pub struct HttpAction {
    client: reqwest::Client,
}

impl HttpAction {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for HttpAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Http
    }

    async fn invoke(&self, invocation: ActionInvocation) -> Result<Value, ErrorObject> {
        let url = invocation
            .config_str("url")
            .ok_or_else(|| ErrorObject::validation("http action requires `url`").with_retryable(false))?
            .to_string();

        let method: Method = invocation
            .config_str("method")
            .unwrap_or("GET")
            .to_uppercase()
            .parse()
            .map_err(|_| ErrorObject::validation("invalid http method").with_retryable(false))?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(invocation.deadline.min(Duration::from_secs(600)));

        if let Some(Value::Object(headers)) = invocation.config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(Value::Object(params)) = invocation.config.get("params") {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = invocation.config.get("body") {
            request = request.json(body);
        }
        if let Some(secret) = &invocation.secret {
            if let Some(token) = secret.field("token") {
                request = request.bearer_auth(token);
            }
        }

        invocation
            .progress
            .emit("http_request", json!({ "url": url, "attempt": invocation.attempt }));

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorObject::timeout(format!("http request timed out: {e}"))
            } else {
                ErrorObject::transport(format!("http request failed: {e}"))
            };
            kind.with_source("http")
        })?;

        let status = response.status();
        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), Value::String(v.to_string())))
            })
            .collect();

        let text = response.text().await.map_err(|e| {
            ErrorObject::transport(format!("failed to read response body: {e}")).with_source("http")
        })?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_server_error() {
            return Err(ErrorObject::transport(format!("http {status} from {url}"))
                .with_source("http"));
        }
        if status.is_client_error() {
            return Err(ErrorObject::action(format!("http {status} from {url}"))
                .with_source("http"));
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
        }))
    }
}
