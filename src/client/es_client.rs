//! Elasticsearch REST client.
//!
//! Implements the `ClusterHealthGateway` over HTTPS with the admin client
//! certificate taken from the cluster's TLS secret.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use reqwest::{Certificate, Identity, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::gateway::{ClusterHealthGateway, GatewayError};
use super::parsing::{
    lookup_setting, parse_watermark, setting_as_bool, setting_as_i32,
};
use super::types::{
    ClusterHealth, DiskUsage, DiskWatermarks, IndexSettings, ParseError, ShardAllocationMode,
};

const ALLOCATION_SETTING: &str = "cluster.routing.allocation.enable";
const MIN_MASTERS_SETTING: &str = "discovery.zen.minimum_master_nodes";
const WATERMARK_LOW: &str = "cluster.routing.allocation.disk.watermark.low";
const WATERMARK_HIGH: &str = "cluster.routing.allocation.disk.watermark.high";
const WATERMARK_FLOOD: &str = "cluster.routing.allocation.disk.watermark.flood_stage";

/// Configuration for connecting to an Elasticsearch cluster.
#[derive(Clone, Debug)]
pub struct ElasticsearchClientConfig {
    /// Base URL, e.g. `https://logs.ns.svc:9200`.
    pub base_url: String,
    /// PEM-encoded CA bundle.
    pub ca_pem: Option<Vec<u8>>,
    /// PEM-encoded client certificate followed by its private key.
    pub identity_pem: Option<Vec<u8>>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ElasticsearchClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            ca_pem: None,
            identity_pem: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ElasticsearchClientConfig {
    /// Build a configuration from a TLS secret holding `ca.crt`, `tls.crt` and `tls.key`.
    pub fn from_secret(base_url: String, secret: &Secret) -> Self {
        let data = secret.data.clone().unwrap_or_default();
        let ca_pem = data.get("ca.crt").map(|b| b.0.clone());
        let identity_pem = match (data.get("tls.crt"), data.get("tls.key")) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.0.clone();
                pem.push(b'\n');
                pem.extend_from_slice(&key.0);
                Some(pem)
            }
            _ => None,
        };
        Self {
            base_url,
            ca_pem,
            identity_pem,
            ..Default::default()
        }
    }
}

/// HTTP client for the Elasticsearch administrative API.
#[derive(Clone, Debug)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    number_of_nodes: i32,
}

#[derive(Deserialize)]
struct AckResponse {
    #[serde(default)]
    acknowledged: bool,
}

#[derive(Deserialize)]
struct ShardsSummary {
    #[serde(default)]
    failed: i64,
}

#[derive(Deserialize)]
struct FlushResponse {
    #[serde(rename = "_shards")]
    shards: ShardsSummary,
}

#[derive(Deserialize)]
struct CatNode {
    name: String,
}

#[derive(Deserialize)]
struct CatIndex {
    index: String,
}

impl ElasticsearchClient {
    /// Create a client from a configuration.
    pub fn new(config: ElasticsearchClientConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout);

        if let Some(ca) = &config.ca_pem {
            let certificate = Certificate::from_pem(ca)?;
            builder = builder.add_root_certificate(certificate);
        }
        if let Some(identity) = &config.identity_pem {
            builder = builder.identity(Identity::from_pem(identity)?);
        }

        if config.base_url.is_empty() {
            return Err(GatewayError::InvalidConfig("base URL is empty".to_string()));
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(StatusCode, String), GatewayError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(method = %method, path = %path, status = status.as_u16(), "Elasticsearch request");
        Ok((status, text))
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, GatewayError> {
        let (status, text) = self.send(method, path, body).await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                code: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| {
            GatewayError::Parse(ParseError::MissingField(format!("{}: {}", path, e)))
        })
    }

    async fn cluster_settings(&self) -> Result<serde_json::Value, GatewayError> {
        self.request_json(
            Method::GET,
            "_cluster/settings?include_defaults=true&flat_settings=true",
            None,
        )
        .await
    }

    async fn put_persistent_setting(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, GatewayError> {
        let body = serde_json::json!({ "persistent": { key: value } });
        let ack: AckResponse = self
            .request_json(Method::PUT, "_cluster/settings", Some(&body))
            .await?;
        Ok(ack.acknowledged)
    }
}

#[async_trait]
impl ClusterHealthGateway for ElasticsearchClient {
    #[instrument(skip(self))]
    async fn get_cluster_health(&self) -> Result<ClusterHealth, GatewayError> {
        let health: HealthResponse = self
            .request_json(Method::GET, "_cluster/health", None)
            .await?;
        Ok(health.status.parse()?)
    }

    #[instrument(skip(self))]
    async fn get_shard_allocation(&self) -> Result<ShardAllocationMode, GatewayError> {
        let settings = self.cluster_settings().await?;
        let mode = lookup_setting(&settings, ALLOCATION_SETTING)
            .and_then(|v| v.as_str())
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(ShardAllocationMode::All);
        Ok(mode)
    }

    #[instrument(skip(self))]
    async fn set_shard_allocation(&self, mode: ShardAllocationMode) -> Result<bool, GatewayError> {
        self.put_persistent_setting(ALLOCATION_SETTING, serde_json::json!(mode.to_string()))
            .await
    }

    #[instrument(skip(self))]
    async fn do_synchronized_flush(&self) -> Result<bool, GatewayError> {
        let (status, text) = self.send(Method::POST, "_flush/synced", None).await?;
        // 409 means some shards could not be sync-flushed, which is not fatal
        if status == StatusCode::CONFLICT {
            warn!(body = %text, "Synchronized flush partially failed");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(GatewayError::Status {
                code: status.as_u16(),
                body: text,
            });
        }
        let flush: FlushResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Parse(ParseError::MissingField(e.to_string())))?;
        Ok(flush.shards.failed == 0)
    }

    #[instrument(skip(self))]
    async fn get_cluster_node_count(&self) -> Result<i32, GatewayError> {
        let health: HealthResponse = self
            .request_json(Method::GET, "_cluster/health", None)
            .await?;
        Ok(health.number_of_nodes)
    }

    #[instrument(skip(self))]
    async fn is_node_in_cluster(&self, node_name: &str) -> Result<bool, GatewayError> {
        let nodes: Vec<CatNode> = self
            .request_json(Method::GET, "_cat/nodes?h=name&format=json", None)
            .await?;
        Ok(nodes.iter().any(|n| n.name == node_name))
    }

    #[instrument(skip(self))]
    async fn get_min_master_nodes(&self) -> Result<i32, GatewayError> {
        let settings = self.cluster_settings().await?;
        lookup_setting(&settings, MIN_MASTERS_SETTING)
            .and_then(setting_as_i32)
            .ok_or_else(|| GatewayError::Parse(ParseError::MissingField(MIN_MASTERS_SETTING.into())))
    }

    #[instrument(skip(self))]
    async fn set_min_master_nodes(&self, count: i32) -> Result<bool, GatewayError> {
        self.put_persistent_setting(MIN_MASTERS_SETTING, serde_json::json!(count))
            .await
    }

    #[instrument(skip(self))]
    async fn get_node_disk_usage(&self, node_name: &str) -> Result<(DiskUsage, u64), GatewayError> {
        let stats: serde_json::Value = self
            .request_json(Method::GET, &format!("_nodes/{}/stats/fs", node_name), None)
            .await?;
        let total = stats
            .get("nodes")
            .and_then(|n| n.as_object())
            .and_then(|nodes| nodes.values().next())
            .and_then(|node| node.pointer("/fs/total"))
            .ok_or_else(|| GatewayError::Unavailable(format!("no fs stats for {}", node_name)))?;

        let total_bytes = total
            .get("total_in_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or_default();
        let available_bytes = total
            .get("available_in_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or_default();
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 * 100.0 / total_bytes as f64
        };

        Ok((
            DiskUsage {
                used_bytes,
                used_percent,
            },
            total_bytes,
        ))
    }

    #[instrument(skip(self))]
    async fn get_disk_watermarks(&self) -> Result<DiskWatermarks, GatewayError> {
        let settings = self.cluster_settings().await?;
        let defaults = DiskWatermarks::default();
        let read = |key: &str| -> Result<Option<_>, GatewayError> {
            lookup_setting(&settings, key)
                .and_then(|v| v.as_str())
                .map(parse_watermark)
                .transpose()
                .map_err(GatewayError::from)
        };
        Ok(DiskWatermarks {
            low: read(WATERMARK_LOW)?.unwrap_or(defaults.low),
            high: read(WATERMARK_HIGH)?.unwrap_or(defaults.high),
            flood: read(WATERMARK_FLOOD)?.unwrap_or(defaults.flood),
        })
    }

    #[instrument(skip(self))]
    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, GatewayError> {
        let indices: Vec<CatIndex> = self
            .request_json(
                Method::GET,
                &format!("_cat/indices/{}?h=index&format=json", pattern),
                None,
            )
            .await?;
        Ok(indices.into_iter().map(|i| i.index).collect())
    }

    #[instrument(skip(self))]
    async fn get_index_settings(&self, index: &str) -> Result<IndexSettings, GatewayError> {
        let response: serde_json::Value = self
            .request_json(Method::GET, &format!("{}/_settings", index), None)
            .await?;
        let settings = response
            .get(index)
            .and_then(|i| i.pointer("/settings/index"))
            .ok_or_else(|| GatewayError::Parse(ParseError::MissingField(format!("{}.settings", index))))?;

        Ok(IndexSettings {
            number_of_replicas: settings
                .get("number_of_replicas")
                .and_then(setting_as_i32)
                .unwrap_or_default(),
            read_only_allow_delete: settings
                .pointer("/blocks/read_only_allow_delete")
                .map(setting_as_bool)
                .unwrap_or(false),
        })
    }

    #[instrument(skip(self, settings))]
    async fn update_index_settings(
        &self,
        index: &str,
        settings: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let ack: AckResponse = self
            .request_json(Method::PUT, &format!("{}/_settings", index), Some(&settings))
            .await?;
        if !ack.acknowledged {
            warn!(index = %index, "Index settings update not acknowledged");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_lowest_node_version(&self) -> Result<semver::Version, GatewayError> {
        let response: serde_json::Value = self
            .request_json(Method::GET, "_nodes?filter_path=nodes.*.version", None)
            .await?;
        let versions: BTreeMap<semver::Version, ()> = response
            .get("nodes")
            .and_then(|n| n.as_object())
            .map(|nodes| {
                nodes
                    .values()
                    .filter_map(|n| n.get("version").and_then(|v| v.as_str()))
                    .filter_map(|v| semver::Version::parse(v).ok())
                    .map(|v| (v, ()))
                    .collect()
            })
            .unwrap_or_default();

        versions
            .into_keys()
            .next()
            .ok_or_else(|| GatewayError::Unavailable("no node versions reported".to_string()))
    }
}
