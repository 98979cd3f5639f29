use async_trait::async_trait;
use meridian_types::AccountTopology;
use tracing::{debug, info};
use url::Url;

use super::{build_http_client, check_status};
use crate::error::DriverResult;
use crate::transport::AccountTopologySource;

/// Reads the account topology over HTTP.
#[derive(Clone)]
pub struct GatewayTopologySource {
    client: reqwest::Client,
}

impl GatewayTopologySource {
    pub fn new() -> DriverResult<Self> {
        Ok(Self { client: build_http_client(None)? })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccountTopologySource for GatewayTopologySource {
    async fn get_account_topology(&self, endpoint: &Url) -> DriverResult<AccountTopology> {
        debug!(endpoint = %endpoint, "Fetching account topology");
        let response = check_status(self.client.get(endpoint.clone()).send().await?).await?;
        let topology: AccountTopology = response.json().await?;
        info!(
            endpoint = %endpoint,
            write_regions = topology.writable_locations.len(),
            read_regions = topology.readable_locations.len(),
            multi_write = topology.enable_multiple_write_locations,
            "Account topology fetched"
        );
        Ok(topology)
    }
}
