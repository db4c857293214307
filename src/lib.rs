pub mod cloud;
pub mod controller;
pub mod coordination;
pub mod csi;
pub mod device;
pub mod ec2;
pub mod errors;
pub mod identity;
pub mod mount;
pub mod node;

use aws_config::{meta::region::RegionProviderChain, timeout::TimeoutConfig, BehaviorVersion};
use aws_types::{region::Region, SdkConfig as AwsSdkConfig};
use tokio::time::Duration;

/// The plugin name advertised through the Identity service.
pub const DRIVER_NAME: &str = "ebs.csi.aws.com";

/// The plugin version advertised through the Identity service.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Topology segment key carrying the availability zone of a volume or node.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.ebs.csi.aws.com/zone";

/// Loads an AWS config from default environments.
///
/// If "region" is None, resolution falls through the default provider chain
/// ("AWS_REGION"/"AWS_DEFAULT_REGION", profile, then IMDS when running on
/// an EC2 instance).
pub async fn load_config(
    region: Option<String>,
    operation_timeout: Option<Duration>,
) -> AwsSdkConfig {
    log::info!("loading AWS configuration for region {:?}", region);

    let reg_provider = RegionProviderChain::first_try(region.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    let mut timeout_builder = TimeoutConfig::builder().connect_timeout(Duration::from_secs(5));
    if let Some(to) = &operation_timeout {
        if !to.is_zero() {
            timeout_builder = timeout_builder.operation_timeout(*to);
        }
    }

    aws_config::defaults(BehaviorVersion::latest())
        .region(reg_provider)
        .timeout_config(timeout_builder.build())
        .load()
        .await
}
