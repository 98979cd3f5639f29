//! Session container: collection identity → partition → token.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use meridian_types::models::headers;
use meridian_types::{ResourceId, StoreResponse};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::token::{parse_partitioned_tokens, SessionToken};
use crate::request::{collection_name_from_path, ServiceRequest};

type PartitionTokens = Arc<DashMap<String, SessionToken>>;

/// Per-client store of the latest session progress of every collection.
///
/// Collections are indexed both by full name and by the numeric collection id
/// decoded from their resource id. When a name starts mapping to a new
/// resource id (the collection was recreated), the stale id's tokens are dropped.
#[derive(Default)]
pub struct SessionContainer {
    /// Guards name/rid transitions; token merges only take the read side
    identity_lock: RwLock<()>,
    rid_by_name: DashMap<String, u64>,
    name_by_rid: DashMap<u64, String>,
    tokens_by_rid: DashMap<u64, PartitionTokens>,
}

impl SessionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the session token returned for `request`.
    ///
    /// The owner-full-name header wins over the request address; for name-based
    /// requests the owner-id header wins over the request resource id. Master
    /// resource requests are ignored.
    pub fn set_session_token(&self, request: &ServiceRequest, response_headers: &HashMap<String, String>) {
        let Some(token) = response_headers.get(headers::SESSION_TOKEN).filter(|t| !t.is_empty()) else {
            return;
        };
        if request.is_master_resource() {
            return;
        }

        let owner_full_name = response_headers
            .get(headers::OWNER_FULL_NAME)
            .filter(|v| !v.is_empty())
            .map_or(request.resource_address.as_str(), String::as_str);
        let Some(collection_name) = collection_name_from_path(owner_full_name) else {
            return;
        };

        let rid_string = if request.is_name_based {
            response_headers
                .get(headers::OWNER_ID)
                .filter(|v| !v.is_empty())
                .cloned()
                .or_else(|| request.resource_id.clone())
        } else {
            request.resource_id.clone()
        };
        let Some(resource_id) = rid_string.as_deref().and_then(ResourceId::parse) else {
            return;
        };
        if !resource_id.is_collection_scoped() {
            return;
        }

        self.apply(resource_id.unique_document_collection_id(), &collection_name, token);
    }

    /// Record a token for an explicitly known collection.
    pub fn set_session_token_for(
        &self,
        collection_rid: &str,
        collection_full_name: &str,
        response_headers: &HashMap<String, String>,
    ) {
        let Some(token) = response_headers.get(headers::SESSION_TOKEN).filter(|t| !t.is_empty()) else {
            return;
        };
        let Some(resource_id) = ResourceId::parse(collection_rid) else {
            warn!(collection_rid, "Ignoring session token for unparseable collection rid");
            return;
        };
        let Some(collection_name) = collection_name_from_path(collection_full_name) else {
            return;
        };
        self.apply(resource_id.unique_document_collection_id(), &collection_name, token);
    }

    /// Record the token carried by a replica response.
    pub fn record_response(&self, request: &ServiceRequest, response: &StoreResponse) {
        let Some(token) = response.session_token_header() else {
            return;
        };
        let mut view = response.headers.clone();
        view.insert(headers::SESSION_TOKEN.to_string(), token.to_string());
        self.set_session_token(request, &view);
    }

    /// Collection-wide token (`rangeId:token,...`), empty when unknown.
    pub fn resolve_global_session_token(&self, request: &ServiceRequest) -> String {
        if request.is_master_resource() {
            return String::new();
        }
        self.tokens_for_request(request).map_or_else(String::new, |tokens| render(&tokens))
    }

    /// Token for one partition, falling back to the merged tokens of its parents.
    pub fn resolve_partition_local_session_token(
        &self,
        request: &ServiceRequest,
        partition_key_range_id: &str,
    ) -> Option<SessionToken> {
        if request.is_master_resource() {
            return None;
        }
        let tokens = self.tokens_for_request(request)?;
        if let Some(token) = tokens.get(partition_key_range_id) {
            return Some(token.clone());
        }

        let parents = request
            .context
            .resolved_partition_key_range
            .as_ref()
            .map(|range| range.parents.as_slice())
            .unwrap_or_default();
        let mut resolved: Option<SessionToken> = None;
        for parent in parents {
            if let Some(token) = tokens.get(parent) {
                resolved = Some(match resolved {
                    Some(acc) => acc.merge(&token),
                    None => token.clone(),
                });
            }
        }
        resolved
    }

    /// Collection-wide token for a collection link (name or rid based).
    pub fn session_token_for_link(&self, collection_link: &str) -> String {
        let rid = match collection_name_from_path(collection_link) {
            Some(name) => self.rid_by_name.get(&name).map(|r| *r),
            None => ResourceId::parse(collection_link.trim_matches('/'))
                .filter(ResourceId::is_collection_scoped)
                .map(|r| r.unique_document_collection_id()),
        };
        rid.and_then(|rid| self.tokens_by_rid.get(&rid).map(|t| Arc::clone(t.value())))
            .map_or_else(String::new, |tokens| render(&tokens))
    }

    pub fn clear_token_by_collection_full_name(&self, collection_full_name: &str) {
        let Some(collection_name) = collection_name_from_path(collection_full_name) else {
            return;
        };
        let _guard = self.identity_lock.write();
        if let Some((_, rid)) = self.rid_by_name.remove(&collection_name) {
            self.tokens_by_rid.remove(&rid);
            self.name_by_rid.remove(&rid);
            debug!(collection = %collection_name, "Cleared session tokens by name");
        }
    }

    pub fn clear_token_by_resource_id(&self, resource_id: &str) {
        let Some(rid) = ResourceId::parse(resource_id).filter(ResourceId::is_collection_scoped) else {
            return;
        };
        let rid = rid.unique_document_collection_id();
        let _guard = self.identity_lock.write();
        if let Some((_, name)) = self.name_by_rid.remove(&rid) {
            self.tokens_by_rid.remove(&rid);
            self.rid_by_name.remove(&name);
            debug!(collection = %name, "Cleared session tokens by resource id");
        }
    }

    fn apply(&self, rid: u64, collection_name: &str, header: &str) {
        let parsed = parse_partitioned_tokens(header);
        if parsed.is_empty() {
            warn!(token = header, "Ignoring unparseable session token");
            return;
        }

        {
            let _guard = self.identity_lock.read();
            let known = self.rid_by_name.get(collection_name).is_some_and(|r| *r == rid)
                && self.name_by_rid.get(&rid).is_some_and(|n| n.as_str() == collection_name);
            if known {
                self.merge_tokens(rid, parsed);
                return;
            }
        }

        let _guard = self.identity_lock.write();
        if let Some(previous) = self.rid_by_name.get(collection_name).map(|r| *r) {
            if previous != rid {
                self.tokens_by_rid.remove(&previous);
                self.name_by_rid.remove(&previous);
                debug!(collection = collection_name, "Collection recreated; dropped stale session tokens");
            }
        }
        self.rid_by_name.insert(collection_name.to_string(), rid);
        self.name_by_rid.insert(rid, collection_name.to_string());
        self.merge_tokens(rid, parsed);
    }

    fn merge_tokens(&self, rid: u64, parsed: Vec<(String, SessionToken)>) {
        let tokens = Arc::clone(self.tokens_by_rid.entry(rid).or_default().value());
        for (range_id, token) in parsed {
            tokens
                .entry(range_id)
                .and_modify(|current| *current = current.merge(&token))
                .or_insert(token);
        }
    }

    fn tokens_for_request(&self, request: &ServiceRequest) -> Option<PartitionTokens> {
        let rid = if request.is_name_based {
            let name = request.collection_name()?;
            *self.rid_by_name.get(&name)?
        } else {
            let resource_id = ResourceId::parse(request.resource_id.as_deref()?)?;
            if !resource_id.is_collection_scoped() {
                return None;
            }
            resource_id.unique_document_collection_id()
        };
        self.tokens_by_rid.get(&rid).map(|t| Arc::clone(t.value()))
    }
}

fn render(tokens: &DashMap<String, SessionToken>) -> String {
    let mut pairs: Vec<(String, String)> =
        tokens.iter().map(|e| (e.key().clone(), e.value().to_string())).collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(range_id, token)| format!("{range_id}:{token}"))
        .collect::<Vec<_>>()
        .join(",")
}
