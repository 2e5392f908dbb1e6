// Write Sink
// HTTP implementation of the opaque mutation sink. Enforces the sink's
// contract client-side: at most one call per second, at most 100 nodes
// and 5000 serialized characters per request. The core never reads
// anything back; a 2xx is the end of the story.

use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::contracts::{WriteSink, WRITE_SINK_MAX_CHARS, WRITE_SINK_MAX_NODES};
use crate::errors::SupertagError;

const MIN_CALL_INTERVAL: Duration = Duration::from_secs(1);

pub struct HttpWriteSink {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
    last_post: Mutex<Option<Instant>>,
}

impl HttpWriteSink {
    pub fn new(endpoint: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint,
            token,
            client,
            last_post: Mutex::new(None),
        })
    }

    /// Sleep long enough to keep at least one second between calls.
    async fn respect_rate_limit(&self) {
        let mut last = self.last_post.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < MIN_CALL_INTERVAL {
                tokio::time::sleep(MIN_CALL_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Count nodes in a payload: the node itself plus every nested child.
pub fn count_nodes(payload: &serde_json::Value) -> usize {
    fn walk(value: &serde_json::Value) -> usize {
        match value {
            serde_json::Value::Object(map) => {
                1 + map
                    .get("children")
                    .and_then(|c| c.as_array())
                    .map(|children| children.iter().map(walk).sum())
                    .unwrap_or(0)
            }
            serde_json::Value::Array(items) => items.iter().map(walk).sum(),
            _ => 0,
        }
    }
    walk(payload)
}

/// Check the sink's per-request budget.
pub fn validate_payload(payload: &serde_json::Value) -> Result<()> {
    let nodes = count_nodes(payload);
    if nodes > WRITE_SINK_MAX_NODES {
        return Err(SupertagError::ValidationErrors(vec![format!(
            "payload has {nodes} nodes, limit is {WRITE_SINK_MAX_NODES}"
        )])
        .into());
    }
    let chars = payload.to_string().chars().count();
    if chars > WRITE_SINK_MAX_CHARS {
        return Err(SupertagError::ValidationErrors(vec![format!(
            "payload is {chars} characters, limit is {WRITE_SINK_MAX_CHARS}"
        )])
        .into());
    }
    Ok(())
}

#[async_trait]
impl WriteSink for HttpWriteSink {
    async fn post(&self, target: &str, payload: &serde_json::Value) -> Result<()> {
        validate_payload(payload)?;
        self.respect_rate_limit().await;

        let body = serde_json::json!({
            "targetNodeId": target,
            "nodes": [payload],
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::Error::new(SupertagError::Timeout(format!("write sink: {e}")))
            } else {
                anyhow::Error::new(SupertagError::NetworkError(format!("write sink: {e}")))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = match status.as_u16() {
                401 => SupertagError::AuthFailed(format!("write sink: {body}")),
                403 => SupertagError::PermissionDenied(format!("write sink: {body}")),
                429 => SupertagError::RateLimited(format!("write sink: {body}")),
                _ => SupertagError::ApiError(format!("write sink {status}: {body}")),
            };
            return Err(err.into());
        }
        debug!(target, "payload posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_counting_walks_children() {
        let payload = json!({
            "name": "Review PR",
            "children": [
                {"attribute_id": "a", "children": [{"name": "active"}]},
                {"attribute_id": "b", "children": [{"name": "x"}, {"name": "y"}]}
            ]
        });
        assert_eq!(count_nodes(&payload), 6);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let children: Vec<serde_json::Value> =
            (0..200).map(|i| json!({"name": format!("c{i}")})).collect();
        let payload = json!({"name": "too big", "children": children});
        let err = validate_payload(&payload).err().unwrap();
        assert_eq!(
            err.downcast_ref::<SupertagError>().map(|e| e.kind_name()),
            Some("ValidationErrors")
        );
    }

    #[test]
    fn long_payloads_are_rejected() {
        let payload = json!({"name": "x".repeat(6000)});
        assert!(validate_payload(&payload).is_err());
    }

    #[test]
    fn small_payloads_pass() {
        let payload = json!({"name": "Review PR", "supertags": [{"id": "todo-id"}]});
        assert!(validate_payload(&payload).is_ok());
    }
}
