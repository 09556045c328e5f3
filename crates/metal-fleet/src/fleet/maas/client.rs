//! MAAS API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use super::models::{Credentials, NodeDetails};
use crate::config::FleetConfig;
use crate::constraints::{QueryParams, PARAM_NAME};
use crate::error::{FleetError, Result};
use crate::fleet::traits::{FleetApi, MacAddress, NetworkDetails, Node, NodeFilter};
use crate::userdata::encode_user_data;

/// MAAS fleet API client.
#[derive(Clone)]
pub struct MaasClient {
    /// HTTP client.
    client: Client,
    /// `{server}/api/{version}/`.
    base_url: Url,
    /// OAuth credentials.
    credentials: Credentials,
}

impl MaasClient {
    /// Create a new MAAS client.
    ///
    /// # Arguments
    /// * `server_url` - MAAS server URL (e.g., `http://maas.local/MAAS`)
    /// * `api_key` - API key in `consumer:token:secret` form
    /// * `api_version` - API version path segment (e.g., "1.0")
    /// * `timeout` - Per-request timeout
    ///
    /// # Errors
    /// Returns error if the URL or key is invalid or the HTTP client cannot be created.
    pub fn new(
        server_url: &str,
        api_key: &str,
        api_version: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let credentials = Credentials::parse(api_key).ok_or_else(|| {
            FleetError::Config(
                "API key must have the form consumer_key:token_key:token_secret".into(),
            )
        })?;

        let base_url = Url::parse(&format!("{}/", server_url.trim_end_matches('/')))
            .and_then(|u| u.join(&format!("api/{api_version}/")))
            .map_err(|e| FleetError::Config(format!("Invalid server URL {server_url}: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::transport("build client", server_url, e))?;

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// Create a client from configuration.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        Self::new(
            &config.server_url,
            &config.api_key,
            &config.api_version,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// API root this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FleetError::Config(format!("Invalid API path {path}: {e}")))
    }

    /// OAuth 1.0 PLAINTEXT authorization header.
    fn authorization(&self) -> String {
        let nonce = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = format!("&{}", self.credentials.token_secret);
        let params = [
            ("oauth_consumer_key", self.credentials.consumer_key.as_str()),
            ("oauth_token", self.credentials.token_key.as_str()),
            ("oauth_signature_method", "PLAINTEXT"),
            ("oauth_signature", signature.as_str()),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_nonce", nonce.as_str()),
            ("oauth_version", "1.0"),
        ];
        let fields = params
            .iter()
            .map(|(k, v)| {
                let v: String = form_urlencoded::byte_serialize(v.as_bytes()).collect();
                format!("{k}=\"{v}\"")
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {fields}")
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", self.authorization())
    }

    /// Make an authenticated GET request, failing on a non-success status.
    async fn send_get(
        &self,
        operation: &'static str,
        target: &str,
        path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        debug!(url = %url, operation, target, "GET request");

        let response = self
            .authed(self.client.get(url).query(query))
            .send()
            .await
            .map_err(|e| FleetError::transport(operation, target, e))?;

        Self::check_status(operation, target, response).await
    }

    /// Make an authenticated GET request and decode the JSON body.
    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        target: &str,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        let response = self.send_get(operation, target, path, query).await?;
        Self::handle_response(operation, target, response).await
    }

    /// Make an authenticated form POST request. `operation` is sent as the
    /// MAAS `op` parameter.
    async fn post_form(
        &self,
        operation: &'static str,
        target: &str,
        path: &str,
        form: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let url = self.url(path)?;
        debug!(url = %url, operation, target, "POST request");

        let response = self
            .authed(self.client.post(url).query(&[("op", operation)]).form(form))
            .send()
            .await
            .map_err(|e| FleetError::transport(operation, target, e))?;

        Self::check_status(operation, target, response).await
    }

    async fn check_status(
        operation: &'static str,
        target: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(FleetError::Api {
            operation,
            target: target.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    /// Decode a successful JSON response.
    async fn handle_response<T: DeserializeOwned>(
        operation: &'static str,
        target: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let text = response
            .text()
            .await
            .map_err(|e| FleetError::transport(operation, target, e))?;
        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, operation, target, "Failed to parse response");
            FleetError::Serialization(e)
        })
    }
}

#[async_trait]
impl FleetApi for MaasClient {
    async fn acquire(&self, params: &QueryParams) -> Result<Node> {
        info!(params = ?params, "Acquiring node");

        let target = params.get(PARAM_NAME).unwrap_or("any node");
        let response = match self
            .post_form("acquire", target, "nodes/", &params.to_pairs())
            .await
        {
            Ok(response) => response,
            Err(FleetError::Api {
                status, message, ..
            }) if status == StatusCode::CONFLICT.as_u16() => {
                return Err(FleetError::Capacity(format!("{status} CONFLICT ({message})")));
            }
            Err(e) => return Err(e),
        };

        let node: Node = Self::handle_response("acquire", target, response).await?;
        info!(system_id = %node.system_id, hostname = %node.hostname, "Node acquired");
        Ok(node)
    }

    async fn start(&self, system_id: &str, user_data: &[u8]) -> Result<()> {
        info!(system_id = %system_id, "Starting node");

        let form = vec![("user_data".to_string(), encode_user_data(user_data)?)];
        self.post_form("start", system_id, &format!("nodes/{system_id}/"), &form)
            .await?;

        info!(system_id = %system_id, "Node started");
        Ok(())
    }

    async fn release(&self, system_ids: &[String]) -> Result<()> {
        info!(count = system_ids.len(), "Releasing nodes");

        let form: Vec<(String, String)> = system_ids
            .iter()
            .map(|id| ("nodes".to_string(), id.clone()))
            .collect();
        self.post_form("release", &system_ids.join(","), "nodes/", &form)
            .await?;
        Ok(())
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let mut query = vec![("op".to_string(), "list".to_string())];
        query.extend(filter.system_ids.iter().map(|id| ("id".to_string(), id.clone())));
        if let Some(agent) = &filter.agent_name {
            query.push(("agent_name".to_string(), agent.clone()));
        }
        let target = if filter.system_ids.is_empty() {
            "all nodes".to_string()
        } else {
            filter.system_ids.join(",")
        };
        self.get("list nodes", &target, "nodes/", &query).await
    }

    async fn list_networks(&self, system_id: &str) -> Result<Vec<NetworkDetails>> {
        let query = vec![("node".to_string(), system_id.to_string())];
        self.get("list networks", system_id, "networks/", &query)
            .await
    }

    async fn network_macs(&self, network: &str) -> Result<Vec<String>> {
        let query = vec![("op".to_string(), "list_connected_macs".to_string())];
        let macs: Vec<MacAddress> = self
            .get(
                "list connected macs",
                network,
                &format!("networks/{network}/"),
                &query,
            )
            .await?;
        Ok(macs.into_iter().map(|m| m.mac_address).collect())
    }

    /// Fetch `op=details` and return its `lshw` document.
    ///
    /// Only the JSON encoding `{"lshw": "<xml>"}` is understood. Servers that
    /// answer with BSON (stock MAAS 1.0) are rejected with
    /// [`FleetError::Parse`] naming the content type.
    async fn hardware_report(&self, system_id: &str) -> Result<Vec<u8>> {
        let query = vec![("op".to_string(), "details".to_string())];
        let response = self
            .send_get("node details", system_id, &format!("nodes/{system_id}/"), &query)
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.is_empty() && !content_type.contains("json") {
            return Err(FleetError::Parse(format!(
                "details of {system_id} returned unsupported content type {content_type}"
            )));
        }

        let details: NodeDetails =
            Self::handle_response("node details", system_id, response).await?;
        Ok(details.lshw.into_bytes())
    }
}
