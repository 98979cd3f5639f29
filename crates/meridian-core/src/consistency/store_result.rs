//! One replica's answer, normalized for the quorum logic.

use std::fmt;

use meridian_types::models::{status_codes, sub_status_codes};
use meridian_types::{StoreError, StoreResponse};
use url::Url;

use crate::session::SessionToken;

/// A replica reply with its LSNs lifted out.
///
/// A replica that answered with a failure status keeps both the response and
/// the typed error: its LSNs still count towards a quorum.
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub response: Option<StoreResponse>,
    pub error: Option<StoreError>,
    pub lsn: i64,
    pub item_lsn: i64,
    pub quorum_acked_lsn: i64,
    pub global_committed_lsn: i64,
    pub current_replica_set_size: i32,
    pub number_of_read_regions: i32,
    pub activity_id: String,
    pub session_token: Option<SessionToken>,
    pub request_charge: f64,
    /// Usable for quorum decisions
    pub is_valid: bool,
    pub store_physical_address: Url,
}

impl StoreResult {
    /// Normalize a transport reply.
    ///
    /// With `requires_valid_lsn`, a failure counts only if it is not Gone (a
    /// stale name cache excepted) and carries an LSN.
    pub fn from_reply(
        reply: Result<StoreResponse, StoreError>,
        address: &Url,
        requires_valid_lsn: bool,
    ) -> Self {
        match reply {
            Ok(response) => Self::from_response(response, address, requires_valid_lsn),
            Err(error) => Self {
                response: None,
                error: Some(error),
                lsn: -1,
                item_lsn: -1,
                quorum_acked_lsn: -1,
                global_committed_lsn: -1,
                current_replica_set_size: 0,
                number_of_read_regions: 0,
                activity_id: String::new(),
                session_token: None,
                request_charge: 0.0,
                is_valid: false,
                store_physical_address: address.clone(),
            },
        }
    }

    fn from_response(response: StoreResponse, address: &Url, requires_valid_lsn: bool) -> Self {
        let error = response.is_error().then(|| {
            StoreError::from_status(
                response.status,
                response.sub_status,
                format!("replica {address} answered {}", response.status),
            )
        });
        let is_valid = match &error {
            None => true,
            Some(_) => {
                !requires_valid_lsn
                    || ((response.status != status_codes::GONE
                        || response.sub_status == sub_status_codes::NAME_CACHE_IS_STALE)
                        && response.lsn >= 0)
            },
        };
        let session_token = response
            .session_token_header()
            .and_then(|h| SessionToken::parse(h.rsplit_once(':').map_or(h, |(_, token)| token)))
            .or_else(|| (response.lsn >= 0).then(|| SessionToken::simple(response.lsn)));

        Self {
            lsn: response.lsn,
            item_lsn: response.item_lsn,
            quorum_acked_lsn: response.quorum_acked_lsn,
            global_committed_lsn: response.global_committed_lsn,
            current_replica_set_size: response.current_replica_set_size,
            number_of_read_regions: response.number_of_read_regions,
            activity_id: response.activity_id.clone(),
            request_charge: response.request_charge,
            session_token,
            is_valid,
            error,
            response: Some(response),
            store_physical_address: address.clone(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match (&self.response, &self.error) {
            (Some(r), _) => r.status,
            (None, Some(e)) => e.status_code(),
            (None, None) => status_codes::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn sub_status(&self) -> u32 {
        match (&self.response, &self.error) {
            (Some(r), _) => r.sub_status,
            (None, Some(e)) => e.sub_status(),
            (None, None) => sub_status_codes::UNKNOWN,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.response.is_some()
    }

    /// Gone that an address refresh could fix.
    pub fn is_gone_requiring_refresh(&self) -> bool {
        self.status_code() == status_codes::GONE && self.sub_status() != sub_status_codes::NAME_CACHE_IS_STALE
    }

    /// The response, or the failure it carried.
    pub fn into_response(self) -> Result<StoreResponse, StoreError> {
        match (self.error, self.response) {
            (Some(e), _) => Err(e),
            (None, Some(r)) => Ok(r),
            (None, None) => Err(StoreError::Internal { message: "store result without response".to_string() }),
        }
    }
}

impl fmt::Display for StoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} status={}/{} lsn={} gclsn={} valid={}",
            self.store_physical_address,
            self.status_code(),
            self.sub_status(),
            self.lsn,
            self.global_committed_lsn,
            self.is_valid
        )
    }
}
