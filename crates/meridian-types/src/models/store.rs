//! Single-replica response as seen by the consistency layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::status::{self, FailureKind};

/// Header names the core reads or writes.
pub mod headers {
    pub const SESSION_TOKEN: &str = "x-ms-session-token";
    pub const OWNER_FULL_NAME: &str = "x-ms-alt-content-path";
    pub const OWNER_ID: &str = "x-ms-content-path";
    pub const CONTINUATION: &str = "x-ms-continuation";
    pub const TARGET_LSN: &str = "x-ms-target-lsn";
    pub const TARGET_GLOBAL_COMMITTED_LSN: &str = "x-ms-target-global-committed-lsn";
    pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const SUB_STATUS: &str = "x-ms-substatus";
    pub const FORCE_REFRESH: &str = "x-ms-force-refresh";
}

/// Response of one replica call.
///
/// LSN-style fields use `-1` when the replica did not report them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreResponse {
    pub status: u16,
    pub sub_status: u32,
    pub lsn: i64,
    pub item_lsn: i64,
    pub global_committed_lsn: i64,
    pub quorum_acked_lsn: i64,
    pub current_replica_set_size: i32,
    pub number_of_read_regions: i32,
    pub activity_id: String,
    pub partition_key_range_id: Option<String>,
    pub session_token: Option<String>,
    pub request_charge: f64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for StoreResponse {
    fn default() -> Self {
        Self {
            status: status::status_codes::OK,
            sub_status: status::sub_status_codes::UNKNOWN,
            lsn: -1,
            item_lsn: -1,
            global_committed_lsn: -1,
            quorum_acked_lsn: -1,
            current_replica_set_size: -1,
            number_of_read_regions: 0,
            activity_id: String::new(),
            partition_key_range_id: None,
            session_token: None,
            request_charge: 0.0,
            headers: HashMap::new(),
        }
    }
}

impl StoreResponse {
    /// Successful response at `lsn`.
    pub fn ok(lsn: i64) -> Self {
        Self { lsn, quorum_acked_lsn: lsn, ..Default::default() }
    }

    /// Failure-status response.
    pub fn failure(status: u16, sub_status: u32) -> Self {
        Self { status, sub_status, ..Default::default() }
    }

    pub fn with_lsn(mut self, lsn: i64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn with_item_lsn(mut self, item_lsn: i64) -> Self {
        self.item_lsn = item_lsn;
        self
    }

    pub fn with_global_committed_lsn(mut self, lsn: i64) -> Self {
        self.global_committed_lsn = lsn;
        self
    }

    pub fn with_quorum_acked_lsn(mut self, lsn: i64) -> Self {
        self.quorum_acked_lsn = lsn;
        self
    }

    pub fn with_replica_set_size(mut self, size: i32) -> Self {
        self.current_replica_set_size = size;
        self
    }

    pub fn with_read_regions(mut self, count: i32) -> Self {
        self.number_of_read_regions = count;
        self
    }

    pub fn with_activity_id(mut self, id: impl Into<String>) -> Self {
        self.activity_id = id.into();
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_error(&self) -> bool {
        status::is_error_status(self.status)
    }

    pub fn failure_kind(&self) -> FailureKind {
        if self.is_error() {
            FailureKind::classify(self.status, self.sub_status)
        } else {
            FailureKind::Other
        }
    }

    /// Session token header, falling back to the typed field.
    pub fn session_token_header(&self) -> Option<&str> {
        self.session_token.as_deref().or_else(|| self.header(headers::SESSION_TOKEN))
    }
}
