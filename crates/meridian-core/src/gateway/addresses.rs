use async_trait::async_trait;
use meridian_types::models::headers;
use meridian_types::ReplicaAddress;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{build_http_client, check_status};
use crate::error::DriverResult;
use crate::transport::AddressSource;

#[derive(Debug, Deserialize)]
struct AddressFeed {
    #[serde(default)]
    addresses: Vec<ReplicaAddress>,
}

/// Fetches replica addresses from a regional address gateway.
#[derive(Clone)]
pub struct GatewayAddressSource {
    client: reqwest::Client,
}

impl GatewayAddressSource {
    pub fn new() -> DriverResult<Self> {
        Ok(Self { client: build_http_client(None)? })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: Url, force_refresh: bool) -> DriverResult<Vec<ReplicaAddress>> {
        let mut builder = self.client.get(url.clone());
        if force_refresh {
            builder = builder.header(headers::FORCE_REFRESH, "true");
        }
        let response = check_status(builder.send().await?).await?;
        let feed: AddressFeed = response.json().await?;
        debug!(url = %url, replicas = feed.addresses.len(), force_refresh, "Fetched addresses");
        Ok(feed.addresses)
    }
}

#[async_trait]
impl AddressSource for GatewayAddressSource {
    async fn get_addresses(
        &self,
        service_endpoint: &Url,
        collection_rid: &str,
        partition_key_range_ids: &[String],
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>> {
        let mut url = service_endpoint.join("addresses")?;
        url.query_pairs_mut()
            .append_pair("collection", collection_rid)
            .append_pair("partitionKeyRangeIds", &partition_key_range_ids.join(","));
        self.fetch(url, force_refresh).await
    }

    async fn get_master_addresses(
        &self,
        service_endpoint: &Url,
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>> {
        let url = service_endpoint.join("addresses/master")?;
        self.fetch(url, force_refresh).await
    }
}
