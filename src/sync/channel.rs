//! Peer context-propagation channel

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CompanionError;

/// Asynchronous background transport to the paired peer instance. Each update
/// fully replaces the previously delivered context for that key.
#[async_trait]
pub trait ContextChannel: Send + Sync {
    async fn update_context(&self, key: &str, value: &str) -> Result<(), CompanionError>;
}

/// Delivers the context map to the peer's receive surface over HTTP
pub struct HttpContextChannel {
    client: reqwest::Client,
    peer_url: String,
}

impl HttpContextChannel {
    pub fn new(peer_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            peer_url: peer_url.into(),
        }
    }
}

#[async_trait]
impl ContextChannel for HttpContextChannel {
    async fn update_context(&self, key: &str, value: &str) -> Result<(), CompanionError> {
        let payload = serde_json::json!({ key: value });
        let response = self
            .client
            .post(&self.peer_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CompanionError::Sync(format!("peer unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(CompanionError::Sync(format!(
                "peer returned {}",
                response.status()
            )));
        }

        tracing::debug!("[SyncBridge] Context delivered to {}", self.peer_url);
        Ok(())
    }
}

/// Stand-in when no peer is configured: every send fails, so install toggles
/// roll back instead of claiming success without a paired display.
pub struct UnpairedChannel;

#[async_trait]
impl ContextChannel for UnpairedChannel {
    async fn update_context(&self, _key: &str, _value: &str) -> Result<(), CompanionError> {
        Err(CompanionError::Sync("no peer is paired".to_string()))
    }
}
