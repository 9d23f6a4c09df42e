//! Cloud pub/sub target adapter
//!
//! Dispatches by provider: GCP Pub/Sub (REST publish with bearer-token
//! credentials and an endpoint override for emulators), AWS SNS (SDK client
//! with static credentials, topic ARN from credentials or resolved by
//! listing topics) and Azure Service Bus (REST publish authorized with a
//! SAS token derived from the connection string).

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::TargetConnector;

const GCP_ENDPOINT: &str = "https://pubsub.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SAS_TTL_SECS: i64 = 3600;

/// Pub/Sub target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubTargetConfig {
    /// One of `gcp`, `aws`, `azure`
    pub provider: String,
    pub topic: String,
    /// Provider-specific credential material
    #[serde(default)]
    pub credentials: JsonMap,
}

impl PubSubTargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::invalid_config("topic", "topic cannot be empty"));
        }
        match self.provider.to_ascii_lowercase().as_str() {
            "gcp" => {
                if self.credential("project_id").is_none() {
                    return Err(Error::invalid_config(
                        "credentials",
                        "GCP credentials require project_id",
                    ));
                }
            }
            "aws" => {
                if self.credential("access_key_id").is_none()
                    || self.credential("secret_access_key").is_none()
                {
                    return Err(Error::invalid_config(
                        "credentials",
                        "AWS credentials require access_key_id and secret_access_key",
                    ));
                }
            }
            "azure" => {
                if self.credential("connection_string").is_none() {
                    return Err(Error::invalid_config(
                        "credentials",
                        "Azure credentials require connection_string",
                    ));
                }
            }
            other => {
                return Err(Error::invalid_config(
                    "provider",
                    format!("provider must be one of gcp, aws, azure (got '{}')", other),
                ));
            }
        }
        Ok(())
    }

    fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).and_then(Value::as_str)
    }
}

/// An established provider session
enum ProviderClient {
    Gcp {
        http: reqwest::Client,
        publish_url: String,
        token: Option<String>,
    },
    Aws {
        client: aws_sdk_sns::Client,
        topic_arn: String,
    },
    Azure {
        http: reqwest::Client,
        post_url: String,
        resource_uri: String,
        key_name: String,
        key: String,
    },
}

/// Connector for cloud pub/sub services
pub struct PubSubConnector {
    config: PubSubTargetConfig,
    client: Option<ProviderClient>,
}

impl PubSubConnector {
    pub fn new(config: PubSubTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: None,
        })
    }

    fn http_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::connection_with_source("failed to build HTTP client", e))
    }

    fn connect_gcp(&self) -> Result<ProviderClient> {
        let project_id = self
            .config
            .credential("project_id")
            .ok_or_else(|| Error::invalid_config("credentials", "GCP project_id is required"))?;
        let endpoint = self
            .config
            .credential("endpoint")
            .unwrap_or(GCP_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        let publish_url = format!(
            "{}/v1/projects/{}/topics/{}:publish",
            endpoint, project_id, self.config.topic
        );

        Ok(ProviderClient::Gcp {
            http: Self::http_client()?,
            publish_url,
            token: self.config.credential("access_token").map(str::to_string),
        })
    }

    async fn connect_aws(&self) -> Result<ProviderClient> {
        let access_key = self
            .config
            .credential("access_key_id")
            .ok_or_else(|| Error::invalid_config("credentials", "AWS access_key_id is required"))?;
        let secret_key = self.config.credential("secret_access_key").ok_or_else(|| {
            Error::invalid_config("credentials", "AWS secret_access_key is required")
        })?;
        let region = self
            .config
            .credential("region")
            .unwrap_or("us-east-1")
            .to_string();

        let credentials = aws_sdk_sns::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "fleetsim-engine",
        );
        let sdk_config = aws_sdk_sns::Config::builder()
            .behavior_version(aws_sdk_sns::config::BehaviorVersion::latest())
            .region(aws_sdk_sns::config::Region::new(region))
            .credentials_provider(credentials)
            .build();
        let client = aws_sdk_sns::Client::from_conf(sdk_config);

        let topic_arn = match self.config.credential("topic_arn") {
            Some(arn) => arn.to_string(),
            None => {
                // Resolve the ARN by topic name
                let suffix = format!(":{}", self.config.topic);
                let listing = client.list_topics().send().await.map_err(|e| {
                    Error::connection(format!("failed to list SNS topics: {}", e))
                })?;
                listing
                    .topics()
                    .iter()
                    .filter_map(|t| t.topic_arn())
                    .find(|arn| arn.ends_with(&suffix))
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::connection(format!("SNS topic '{}' not found", self.config.topic))
                    })?
            }
        };

        Ok(ProviderClient::Aws { client, topic_arn })
    }

    fn connect_azure(&self) -> Result<ProviderClient> {
        let connection_string = self.config.credential("connection_string").ok_or_else(|| {
            Error::invalid_config("credentials", "Azure connection_string is required")
        })?;

        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        for part in connection_string.split(';') {
            if let Some((name, value)) = part.split_once('=') {
                match name.trim() {
                    "Endpoint" => endpoint = Some(value.trim().to_string()),
                    "SharedAccessKeyName" => key_name = Some(value.trim().to_string()),
                    // SharedAccessKey values are base64 and may contain '='
                    "SharedAccessKey" => {
                        key = Some(part.trim().trim_start_matches("SharedAccessKey=").to_string())
                    }
                    _ => {}
                }
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            Error::invalid_config("credentials", "connection_string is missing Endpoint")
        })?;
        let key_name = key_name.ok_or_else(|| {
            Error::invalid_config("credentials", "connection_string is missing SharedAccessKeyName")
        })?;
        let key = key.ok_or_else(|| {
            Error::invalid_config("credentials", "connection_string is missing SharedAccessKey")
        })?;

        let host = endpoint
            .trim_start_matches("sb://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let resource_uri = format!("https://{}/{}", host, self.config.topic);
        let post_url = format!("{}/messages", resource_uri);

        Ok(ProviderClient::Azure {
            http: Self::http_client()?,
            post_url,
            resource_uri,
            key_name,
            key,
        })
    }

    /// Service Bus SAS token: HMAC-SHA256 over the URL-encoded resource and
    /// a bounded expiry
    fn sas_token(resource_uri: &str, key_name: &str, key: &str) -> Result<String> {
        let expiry = chrono::Utc::now().timestamp() + SAS_TTL_SECS;
        let encoded_uri = utf8_percent_encode(resource_uri, NON_ALPHANUMERIC).to_string();
        let to_sign = format!("{}\n{}", encoded_uri, expiry);

        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
            .map_err(|_| Error::config("invalid Service Bus shared access key"))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        let encoded_signature = utf8_percent_encode(&signature, NON_ALPHANUMERIC).to_string();

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri, encoded_signature, expiry, key_name
        ))
    }
}

#[async_trait]
impl TargetConnector for PubSubConnector {
    fn kind(&self) -> &'static str {
        "pubsub"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let client = match self.config.provider.to_ascii_lowercase().as_str() {
            "gcp" => self.connect_gcp()?,
            "aws" => self.connect_aws().await?,
            "azure" => self.connect_azure()?,
            other => {
                return Err(Error::invalid_config(
                    "provider",
                    format!("unsupported provider: {}", other),
                ));
            }
        };

        debug!(
            "pub/sub session ready: provider={} topic={}",
            self.config.provider, self.config.topic
        );
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::connection("pub/sub session is not connected"))?;

        let body = serde_json::to_string(&Value::Object(payload.clone()))?;

        match client {
            ProviderClient::Gcp {
                http,
                publish_url,
                token,
            } => {
                let message = json!({
                    "messages": [{"data": BASE64.encode(body.as_bytes())}]
                });
                let mut request = http.post(publish_url).json(&message);
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }

                let response = request.send().await?;
                let status = response.status();
                if status.as_u16() >= 400 {
                    return Err(Error::send(format!(
                        "GCP Pub/Sub publish failed with status {}",
                        status
                    )));
                }
                Ok(())
            }
            ProviderClient::Aws { client, topic_arn } => {
                client
                    .publish()
                    .topic_arn(topic_arn)
                    .message(&body)
                    .send()
                    .await
                    .map_err(|e| Error::send(format!("SNS publish failed: {}", e)))?;
                Ok(())
            }
            ProviderClient::Azure {
                http,
                post_url,
                resource_uri,
                key_name,
                key,
            } => {
                let sas = Self::sas_token(resource_uri, key_name, key)?;
                let response = http
                    .post(post_url)
                    .header("Authorization", sas)
                    .header("Content-Type", "application/json")
                    .body(body)
                    .send()
                    .await?;

                let status = response.status();
                if status.as_u16() >= 400 {
                    return Err(Error::send(format!(
                        "Service Bus publish failed with status {}",
                        status
                    )));
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}
