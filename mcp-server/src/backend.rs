//! MAAS 2.0 REST client for the machine lifecycle calls the tools need.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::config::BackendConfig;

/// Status names reported by MAAS for the states the tools wait on.
pub mod status {
    pub const DEPLOYING: &str = "Deploying";
    pub const DEPLOYED: &str = "Deployed";
    pub const FAILED_DEPLOYMENT: &str = "Failed deployment";
    pub const COMMISSIONING: &str = "Commissioning";
    pub const TESTING: &str = "Testing";
    pub const READY: &str = "Ready";
    pub const FAILED_COMMISSIONING: &str = "Failed commissioning";
    pub const FAILED_TESTING: &str = "Failed testing";
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MAAS returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to decode MAAS response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Invalid MAAS URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid system id: {0:?}")]
    InvalidSystemId(String),
}

impl BackendError {
    /// Whether another attempt may succeed: timeouts, connection failures,
    /// 5xx, and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(err) => err.is_timeout() || err.is_connect(),
            BackendError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Machine fields read back from MAAS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub system_id: String,
    #[serde(default)]
    pub hostname: String,
    pub status_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro_series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwe_kernel: Option<String>,
    /// Base64-encoded cloud-init user data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

impl DeployOptions {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        [
            ("distro_series", &self.distro_series),
            ("hwe_kernel", &self.hwe_kernel),
            ("user_data", &self.user_data),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|value| (key, value)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionOptions {
    #[serde(default)]
    pub enable_ssh: bool,
    #[serde(default)]
    pub skip_bmc_config: bool,
    #[serde(default)]
    pub skip_networking: bool,
    #[serde(default)]
    pub skip_storage: bool,
}

impl CommissionOptions {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        let flag = |value: bool| String::from(if value { "1" } else { "0" });
        vec![
            ("enable_ssh", flag(self.enable_ssh)),
            ("skip_bmc_config", flag(self.skip_bmc_config)),
            ("skip_networking", flag(self.skip_networking)),
            ("skip_storage", flag(self.skip_storage)),
        ]
    }
}

#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// Start deploying an allocated machine.
    async fn deploy(&self, system_id: &str, options: &DeployOptions) -> Result<Machine, BackendError>;

    /// Start commissioning a machine.
    async fn commission(
        &self,
        system_id: &str,
        options: &CommissionOptions,
    ) -> Result<Machine, BackendError>;

    async fn machine(&self, system_id: &str) -> Result<Machine, BackendError>;
}

/// `consumer:token:secret` credentials issued by MAAS.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    consumer_key: String,
    token_key: String,
    token_secret: String,
}

impl ApiKey {
    pub fn parse(key: &str) -> Result<Self, BackendError> {
        let mut parts = key.trim().split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(consumer), Some(token), Some(secret), None)
                if !consumer.is_empty() && !token.is_empty() && !secret.is_empty() =>
            {
                Ok(Self {
                    consumer_key: consumer.to_string(),
                    token_key: token.to_string(),
                    token_secret: secret.to_string(),
                })
            }
            _ => Err(BackendError::InvalidApiKey(
                "expected consumer:token:secret".to_string(),
            )),
        }
    }

    /// OAuth 1.0 PLAINTEXT `Authorization` header value.
    pub fn authorization(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple();
        let timestamp = chrono::Utc::now().timestamp();
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"%26{}\", \
             oauth_nonce=\"{nonce}\", oauth_timestamp=\"{timestamp}\"",
            self.consumer_key, self.token_key, self.token_secret
        )
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("consumer_key", &self.consumer_key)
            .finish_non_exhaustive()
    }
}

/// [`MachineBackend`] over the MAAS HTTP API.
#[derive(Debug, Clone)]
pub struct HttpMachineBackend {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<ApiKey>,
}

impl HttpMachineBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<ApiKey>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let api_key = config.api_key.as_deref().map(ApiKey::parse).transpose()?;
        Self::new(
            &config.url,
            api_key,
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn machine_url(&self, system_id: &str, op: Option<&str>) -> Result<Url, BackendError> {
        if system_id.is_empty() || !system_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BackendError::InvalidSystemId(system_id.to_string()));
        }
        let mut url = self
            .base_url
            .join(&format!("api/2.0/machines/{system_id}/"))?;
        if let Some(op) = op {
            url.query_pairs_mut().append_pair("op", op);
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(AUTHORIZATION, key.authorization()),
            None => request,
        }
    }

    async fn post_op(
        &self,
        system_id: &str,
        op: &str,
        fields: Vec<(&'static str, String)>,
    ) -> Result<Machine, BackendError> {
        let url = self.machine_url(system_id, Some(op))?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        tracing::debug!(system_id, op, "POST {url}");
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Machine, BackendError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status { status, body });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MachineBackend for HttpMachineBackend {
    async fn deploy(&self, system_id: &str, options: &DeployOptions) -> Result<Machine, BackendError> {
        self.post_op(system_id, "deploy", options.form_fields()).await
    }

    async fn commission(
        &self,
        system_id: &str,
        options: &CommissionOptions,
    ) -> Result<Machine, BackendError> {
        self.post_op(system_id, "commission", options.form_fields())
            .await
    }

    async fn machine(&self, system_id: &str) -> Result<Machine, BackendError> {
        let url = self.machine_url(system_id, None)?;
        self.send(self.client.get(url)).await
    }
}
