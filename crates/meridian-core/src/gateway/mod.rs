//! HTTP gateway sources.
//!
//! The account endpoint serves the topology at `GET {endpoint}/`; the address
//! gateway serves replica sets at `GET {endpoint}/addresses`.

mod addresses;
mod topology;

use std::time::Duration;

use meridian_types::models::{headers, status_codes, sub_status_codes};
use meridian_types::StoreError;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

pub use addresses::GatewayAddressSource;
pub use topology::GatewayTopologySource;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the HTTP client shared by the gateway sources.
pub fn build_http_client(timeout: Option<Duration>) -> DriverResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT).max(Duration::from_secs(1)))
        .tcp_nodelay(true)
        .build()
        .map_err(DriverError::from)
}

/// Turn a non-success gateway reply into a typed failure.
async fn check_status(response: reqwest::Response) -> DriverResult<reqwest::Response> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    let sub_status = response
        .headers()
        .get(headers::SUB_STATUS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(sub_status_codes::UNKNOWN);
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    debug!(url = %url, status, sub_status, "Gateway returned failure status");

    if status == status_codes::NOT_FOUND && sub_status == sub_status_codes::UNKNOWN {
        return Err(DriverError::NotFound(format!("{url}: {body}")));
    }
    Err(StoreError::from_status(status, sub_status, body).into())
}
