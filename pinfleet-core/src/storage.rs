//! Storage-node capability: the adapter boundary between fleet
//! coordination and the underlying content-addressed storage network.

use crate::error::{FleetError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Capability consumed by the fleet core for talking to individual
/// storage nodes. The core never spawns subprocesses or speaks the
/// storage network's wire format directly.
#[async_trait]
pub trait StorageNodeClient: Send + Sync {
    /// One liveness check against the node's status endpoint.
    async fn health_check(&self, address: &str) -> Result<bool>;

    /// All content ids currently pinned on the node.
    async fn list_pins(&self, address: &str) -> Result<Vec<String>>;

    /// Ask the node to retain the content indefinitely.
    async fn pin(&self, address: &str, cid: &str) -> Result<()>;

    /// Release the retention directive.
    async fn unpin(&self, address: &str, cid: &str) -> Result<()>;

    /// Whether the node can serve the content locally right now.
    async fn fetch_presence(&self, address: &str, cid: &str) -> Result<bool>;

    /// Store new content, returning its content id.
    async fn add_content(&self, address: &str, data: Bytes) -> Result<String>;
}

/// HTTP adapter speaking the node's RPC API (Kubo-compatible paths).
pub struct HttpStorageNodeClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PinListResponse {
    #[serde(rename = "Keys", default)]
    keys: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AddContentResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl HttpStorageNodeClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    fn api_url(&self, address: &str, path: &str) -> String {
        format!("http://{}/api/v0/{}", address, path)
    }
}

#[async_trait]
impl StorageNodeClient for HttpStorageNodeClient {
    async fn health_check(&self, address: &str) -> Result<bool> {
        let response = self
            .client
            .post(self.api_url(address, "id"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn list_pins(&self, address: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.api_url(address, "pin/ls?type=recursive"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Http(format!(
                "pin list failed: node={} status={}",
                address,
                response.status()
            )));
        }

        let payload: PinListResponse = response
            .json()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        let mut pins: Vec<String> = payload.keys.into_keys().collect();
        pins.sort();
        Ok(pins)
    }

    async fn pin(&self, address: &str, cid: &str) -> Result<()> {
        let response = self
            .client
            .post(self.api_url(address, &format!("pin/add?arg={}", cid)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Http(format!(
                "pin failed: node={} cid={} status={}",
                address,
                cid,
                response.status()
            )));
        }

        Ok(())
    }

    async fn unpin(&self, address: &str, cid: &str) -> Result<()> {
        let response = self
            .client
            .post(self.api_url(address, &format!("pin/rm?arg={}", cid)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Http(format!(
                "unpin failed: node={} cid={} status={}",
                address,
                cid,
                response.status()
            )));
        }

        Ok(())
    }

    async fn fetch_presence(&self, address: &str, cid: &str) -> Result<bool> {
        // offline=true keeps the check local to the queried node instead of
        // letting it fetch the block from peers.
        let response = self
            .client
            .post(self.api_url(address, &format!("block/stat?arg={}&offline=true", cid)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn add_content(&self, address: &str, data: Bytes) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name("content");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.api_url(address, "add?pin=true"))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::Http(format!(
                "add content failed: node={} status={}",
                address,
                response.status()
            )));
        }

        let payload: AddContentResponse = response
            .json()
            .await
            .map_err(|error| FleetError::Http(error.to_string()))?;

        Ok(payload.hash)
    }
}
