//! Instance metadata (IMDSv2) and the cached per-process node view.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::errors::{Error, Result};

const DEFAULT_IMDS_BASE: &str = "http://169.254.169.254";
const TOKEN_TTL_SECONDS: &str = "21600";

/// Fetches instance metadata service v2 paths.
/// ref. https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/configuring-instance-metadata-service.html
#[derive(Debug, Clone)]
pub struct MetadataClient {
    base: String,
    http: reqwest::Client,
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::with_base(DEFAULT_IMDS_BASE)
    }
}

impl MetadataClient {
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetches the IMDS v2 session token.
    async fn fetch_token(&self) -> Result<String> {
        let uri = format!("{}/latest/api/token", self.base);
        let resp = self
            .http
            .put(&uri)
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed PUT api/token {:?}", e),
                retryable: true,
            })?;
        resp.text().await.map_err(|e| Error::API {
            message: format!("PUT api/token returned unexpected body {:?}", e),
            retryable: false,
        })
    }

    /// Fetches "meta-data/{path}".
    pub async fn fetch(&self, path: &str) -> Result<String> {
        log::debug!("fetching meta-data/{}", path);
        let token = self.fetch_token().await?;
        let uri = format!("{}/latest/meta-data/{}", self.base, path);
        let resp = self
            .http
            .get(&uri)
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .map_err(|e| Error::API {
                message: format!("failed GET meta-data/{} {:?}", path, e),
                retryable: true,
            })?;
        if !resp.status().is_success() {
            return Err(Error::API {
                message: format!("GET meta-data/{} returned {}", path, resp.status()),
                retryable: false,
            });
        }
        resp.text().await.map_err(|e| Error::API {
            message: format!("GET meta-data/{} returned unexpected body {:?}", path, e),
            retryable: false,
        })
    }

    pub async fn fetch_instance_id(&self) -> Result<String> {
        self.fetch("instance-id").await
    }

    pub async fn fetch_instance_type(&self) -> Result<String> {
        self.fetch("instance-type").await
    }

    pub async fn fetch_availability_zone(&self) -> Result<String> {
        self.fetch("placement/availability-zone").await
    }
}

/// Derives the region from an availability zone name ("us-west-2a" has a
/// one-letter zone suffix).
pub fn region_from_az(az: &str) -> String {
    az.trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .to_string()
}

/// Attachment slots usable for data volumes on the instance type.
///
/// Nitro instances share one bus budget across volumes and network
/// interfaces; the Xen generations expose a fixed block-device table. One
/// safe number per generation; the CLI override wins over both.
pub fn volume_attach_limit(instance_type: &str) -> i64 {
    let family = instance_type.split('.').next().unwrap_or(instance_type);
    const XEN_FAMILIES: &[&str] = &[
        "c1", "c3", "c4", "d2", "g3", "i2", "i3", "m1", "m2", "m3", "m4", "p2", "p3", "r3", "r4",
        "t1", "t2", "x1", "x1e",
    ];
    if XEN_FAMILIES.contains(&family) {
        39
    } else {
        27
    }
}

/// Network-interface budget reported alongside the shared Nitro limit.
pub fn network_interface_limit(instance_type: &str) -> i64 {
    let size = instance_type.split('.').nth(1).unwrap_or("");
    match size {
        "nano" | "micro" | "small" => 2,
        "medium" | "large" => 3,
        _ => 4,
    }
}

/// Cached per-process view of the host instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NodeMeta {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub availability_zone: String,
    pub max_attachable_volumes: i64,
    pub max_network_interfaces: i64,
    pub attachment_count: i64,
}

impl NodeMeta {
    /// Assembles the node view from IMDS. "attachment_count" starts at zero
    /// and is refreshed from describe output by the callers that need it.
    pub async fn load(client: &MetadataClient) -> Result<Self> {
        let instance_id = client.fetch_instance_id().await?;
        let instance_type = client.fetch_instance_type().await?;
        let availability_zone = client.fetch_availability_zone().await?;
        let region = region_from_az(&availability_zone);

        log::info!(
            "loaded node metadata: instance '{}' type '{}' az '{}'",
            instance_id,
            instance_type,
            availability_zone
        );
        Ok(Self {
            max_attachable_volumes: volume_attach_limit(&instance_type),
            max_network_interfaces: network_interface_limit(&instance_type),
            instance_id,
            instance_type,
            region,
            availability_zone,
            attachment_count: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_truncates_zone_suffix() {
        assert_eq!(region_from_az("us-west-2a"), "us-west-2");
        assert_eq!(region_from_az("eu-central-1b"), "eu-central-1");
        assert_eq!(region_from_az("ap-southeast-3c"), "ap-southeast-3");
    }

    #[test]
    fn attach_limits_by_generation() {
        assert_eq!(volume_attach_limit("m4.large"), 39);
        assert_eq!(volume_attach_limit("t2.micro"), 39);
        assert_eq!(volume_attach_limit("m5.large"), 27);
        assert_eq!(volume_attach_limit("c6i.8xlarge"), 27);
    }

    #[test]
    fn eni_limits_by_size() {
        assert_eq!(network_interface_limit("t3.micro"), 2);
        assert_eq!(network_interface_limit("m5.large"), 3);
        assert_eq!(network_interface_limit("r5.4xlarge"), 4);
    }
}
