use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Generic HTTP call.
///
/// Non-2xx responses are reported as `success: false` with the status code;
/// transport errors are raised.
pub struct ApiNode {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".into()
}

impl ApiNode {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ApiNode {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_config(config: &Value) -> Result<(ApiConfig, reqwest::Method), NodeError> {
    let cfg: ApiConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::config(format!("api: {e}")))?;
    let method = cfg
        .method
        .to_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|e| NodeError::config(format!("api: invalid method '{}': {e}", cfg.method)))?;
    if !(cfg.url.starts_with("http://") || cfg.url.starts_with("https://")) {
        return Err(NodeError::config(format!("api: unsupported url '{}'", cfg.url)));
    }
    Ok((cfg, method))
}

#[async_trait]
impl NodeHandler for ApiNode {
    async fn execute(&self, config: &Value, _ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        let (cfg, method) = parse_config(config)?;

        let mut req = self
            .client
            .request(method.clone(), &cfg.url)
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)));
        for (k, v) in &cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req = match cfg.body {
            Some(Value::String(text)) => req.body(text),
            Some(Value::Null) | None => req,
            Some(other) => req.json(&other),
        };

        debug!(%method, url = %cfg.url, "sending api request");
        let resp = req
            .send()
            .await
            .map_err(|e| NodeError::execution(format!("api: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| NodeError::execution(format!("api: reading body: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let output = json!({ "status": status.as_u16(), "body": body });

        if status.is_success() {
            Ok(NodeResult::ok(output))
        } else {
            warn!(status = status.as_u16(), url = %cfg.url, "api request failed");
            Ok(NodeResult::failure(format!("HTTP {}", status.as_u16()), output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn config_validation() {
        let (cfg, method) = parse_config(&json!({"url": "https://example.com/x"})).unwrap();
        assert_eq!(method, reqwest::Method::GET);
        assert_eq!(cfg.url, "https://example.com/x");

        let (_, method) = parse_config(&json!({"url": "http://h", "method": "post"})).unwrap();
        assert_eq!(method, reqwest::Method::POST);

        assert!(matches!(parse_config(&json!({})), Err(NodeError::Config(_))));
        assert!(matches!(
            parse_config(&json!({"url": "ftp://h"})),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            parse_config(&json!({"url": "http://h", "method": "NOT A METHOD"})),
            Err(NodeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn malformed_config_is_raised_before_any_request() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let err = ApiNode::new().execute(&json!({"method": "GET"}), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
