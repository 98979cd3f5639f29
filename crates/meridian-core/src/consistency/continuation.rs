//! Feed continuation tokens across partition splits and merges.
//!
//! A continuation handed to the caller is a JSON composite of
//! `{ "token": <backend continuation>, "range": { "min", "max" } }` entries.
//! Before a page is fetched the range in the head entry is re-resolved against
//! the current routing map; after the page, the next range (or the remainder
//! of a split) is written back.

use std::collections::HashMap;

use meridian_types::models::{headers, status_codes, sub_status_codes};
use meridian_types::{EpkRange, PartitionKeyRange, StoreError, MAX_EXCLUSIVE_EPK, MIN_INCLUSIVE_EPK};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DriverResult;
use crate::transport::RoutingMapProvider;

/// Order in which partition ranges are paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumerationDirection {
    /// Ascending by range boundary
    #[default]
    Forward,
    /// Descending by range boundary
    Reverse,
}

/// One entry of a composite continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub range: EpkRange,
}

/// Range a page should be read from, plus the continuation entries to persist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedRangeInfo {
    /// `None` when the range no longer exists (for example the collection was recreated)
    pub resolved_range: Option<PartitionKeyRange>,
    pub continuation_tokens: Vec<CompositeContinuationToken>,
}

fn invalid_continuation(detail: impl std::fmt::Display) -> StoreError {
    StoreError::Status {
        status: status_codes::BAD_REQUEST,
        sub_status: sub_status_codes::UNKNOWN,
        message: format!("invalid continuation token: {detail}"),
    }
}

/// Split the composite continuation in `request_headers` into its entries.
///
/// Returns the head entry's range (empty at the minimum key when there is no
/// continuation). The continuation header is rewritten to the head entry's
/// backend token, or removed if it has none.
pub fn extract_range_from_continuation(
    request_headers: &mut HashMap<String, String>,
) -> DriverResult<(EpkRange, Vec<CompositeContinuationToken>)> {
    let empty = EpkRange::empty_at(MIN_INCLUSIVE_EPK);
    let Some(provided) = request_headers.get(headers::CONTINUATION).filter(|c| !c.trim().is_empty()).cloned() else {
        request_headers.remove(headers::CONTINUATION);
        return Ok((empty, Vec::new()));
    };

    let tokens: Vec<CompositeContinuationToken> = if provided.trim_start().starts_with('[') {
        serde_json::from_str(&provided).map_err(|e| {
            warn!(continuation = %provided, "Invalid JSON in continuation token");
            invalid_continuation(e)
        })?
    } else {
        let single: CompositeContinuationToken = serde_json::from_str(&provided).map_err(|e| {
            warn!(continuation = %provided, "Invalid JSON in continuation token");
            invalid_continuation(e)
        })?;
        vec![single]
    };

    let Some(head) = tokens.first() else {
        request_headers.remove(headers::CONTINUATION);
        return Ok((empty, tokens));
    };
    match head.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => {
            request_headers.insert(headers::CONTINUATION.to_string(), token.to_string());
        },
        None => {
            request_headers.remove(headers::CONTINUATION);
        },
    }
    Ok((head.range.clone(), tokens))
}

/// Range containing `epk`, if any.
async fn range_by_epk(
    routing_map: &dyn RoutingMapProvider,
    collection_rid: &str,
    epk: &str,
    force_refresh: bool,
) -> DriverResult<Option<PartitionKeyRange>> {
    if epk >= MAX_EXCLUSIVE_EPK {
        return Ok(None);
    }
    let probe = EpkRange::new(epk, MAX_EXCLUSIVE_EPK);
    let ranges = routing_map.try_get_overlapping_ranges(collection_rid, &probe, force_refresh).await?;
    Ok(ranges.and_then(|ranges| ranges.into_iter().find(|r| r.to_range().contains(epk))))
}

/// Resolve the range a continuation points at in the current topology.
///
/// A split is answered with one entry per child, ordered by `direction`. Only
/// the first child resumes from the backend token; the others start over.
pub async fn try_get_target_range_from_continuation(
    routing_map: &dyn RoutingMapProvider,
    collection_rid: &str,
    provided_ranges: &[EpkRange],
    range_from_continuation: &EpkRange,
    supplied_tokens: Vec<CompositeContinuationToken>,
    direction: EnumerationDirection,
) -> DriverResult<ResolvedRangeInfo> {
    if provided_ranges.is_empty() {
        let first = range_by_epk(routing_map, collection_rid, MIN_INCLUSIVE_EPK, false).await?;
        return Ok(ResolvedRangeInfo { resolved_range: first, continuation_tokens: supplied_tokens });
    }

    if range_from_continuation.is_empty() {
        let resolved_range = match direction {
            EnumerationDirection::Reverse => {
                let Some(provided) = provided_ranges.iter().max_by(|a, b| a.max.cmp(&b.max)) else {
                    return Ok(ResolvedRangeInfo::default());
                };
                routing_map
                    .try_get_overlapping_ranges(collection_rid, provided, false)
                    .await?
                    .and_then(|ranges| ranges.into_iter().last())
            },
            EnumerationDirection::Forward => {
                let min = provided_ranges.iter().map(|r| r.min.as_str()).min().unwrap_or(MIN_INCLUSIVE_EPK);
                range_by_epk(routing_map, collection_rid, min, false).await?
            },
        };
        return Ok(ResolvedRangeInfo { resolved_range, continuation_tokens: supplied_tokens });
    }

    let Some(target) = range_by_epk(routing_map, collection_rid, &range_from_continuation.min, false).await? else {
        return Ok(ResolvedRangeInfo { resolved_range: None, continuation_tokens: supplied_tokens });
    };
    if target.to_range() == *range_from_continuation {
        return Ok(ResolvedRangeInfo { resolved_range: Some(target), continuation_tokens: supplied_tokens });
    }

    // The range changed under the continuation: split, or a stale routing map.
    let replaced = routing_map
        .try_get_overlapping_ranges(collection_rid, range_from_continuation, true)
        .await?
        .unwrap_or_default();
    let covers_exactly = replaced.first().is_some_and(|r| r.min_inclusive == range_from_continuation.min)
        && replaced.last().is_some_and(|r| r.max_exclusive == range_from_continuation.max);
    if !covers_exactly {
        debug!(range = %range_from_continuation, "Continuation range no longer maps onto the routing map");
        return Ok(ResolvedRangeInfo::default());
    }

    let mut children = replaced;
    if direction == EnumerationDirection::Reverse {
        children.reverse();
    }
    debug!(range = %range_from_continuation, children = children.len(), "Continuation range was split");

    let mut supplied = supplied_tokens.into_iter();
    let resumed_token = supplied.next().and_then(|head| head.token);
    let mut continuation_tokens: Vec<CompositeContinuationToken> = children
        .iter()
        .enumerate()
        .map(|(i, child)| CompositeContinuationToken {
            token: if i == 0 { resumed_token.clone() } else { None },
            range: child.to_range(),
        })
        .collect();
    continuation_tokens.extend(supplied);

    Ok(ResolvedRangeInfo { resolved_range: children.into_iter().next(), continuation_tokens })
}

/// Write the continuation for the next page into `response_headers`.
///
/// Returns `false` when the next range could not be found, which usually
/// means the collection rid is stale.
pub async fn try_add_range_to_continuation(
    response_headers: &mut HashMap<String, String>,
    provided_ranges: &[EpkRange],
    routing_map: &dyn RoutingMapProvider,
    collection_rid: &str,
    resolved: &mut ResolvedRangeInfo,
    direction: EnumerationDirection,
) -> DriverResult<bool> {
    let Some(current) = resolved.resolved_range.clone() else {
        return Ok(false);
    };
    let backend_token = response_headers.get(headers::CONTINUATION).filter(|t| !t.is_empty()).cloned();

    if resolved.continuation_tokens.len() > 1 {
        match backend_token {
            Some(token) => resolved.continuation_tokens[0].token = Some(token),
            None => {
                resolved.continuation_tokens.remove(0);
            },
        }
        let serialized = serde_json::to_string(&resolved.continuation_tokens)?;
        response_headers.insert(headers::CONTINUATION.to_string(), serialized);
        return Ok(true);
    }

    let range_to_use = if backend_token.is_some() {
        Some(current)
    } else {
        match direction {
            EnumerationDirection::Reverse => {
                let Some(provided) = provided_ranges.iter().max_by(|a, b| a.max.cmp(&b.max)) else {
                    return Ok(true);
                };
                let ranges = routing_map
                    .try_get_overlapping_ranges(collection_rid, provided, false)
                    .await?
                    .unwrap_or_default();
                // Closest range strictly before the current one.
                ranges
                    .into_iter()
                    .filter(|r| r.min_inclusive < current.min_inclusive)
                    .max_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive))
            },
            EnumerationDirection::Forward => {
                let next_provided = provided_ranges
                    .iter()
                    .filter(|r| r.max > current.max_exclusive)
                    .min_by(|a, b| a.max.cmp(&b.max));
                let Some(next_provided) = next_provided else {
                    return Ok(true);
                };
                let next_min = if next_provided.min > current.max_exclusive {
                    next_provided.min.clone()
                } else {
                    current.max_exclusive.clone()
                };
                if next_min == MAX_EXCLUSIVE_EPK {
                    return Ok(true);
                }
                match range_by_epk(routing_map, collection_rid, &next_min, false).await? {
                    Some(next) => Some(next),
                    None => return Ok(false),
                }
            },
        }
    };

    if let Some(range) = range_to_use {
        let entry = CompositeContinuationToken { token: backend_token, range: range.to_range() };
        response_headers.insert(headers::CONTINUATION.to_string(), serde_json::to_string(&entry)?);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::testing::FakeRoutingMap;

    fn split_map() -> FakeRoutingMap {
        FakeRoutingMap::new().with_ranges(
            "rid",
            vec![
                PartitionKeyRange::new("1", "", "40").with_parents(["0"]),
                PartitionKeyRange::new("2", "40", "80").with_parents(["0"]),
                PartitionKeyRange::new("3", "80", "FF"),
            ],
        )
    }

    fn entry(token: Option<&str>, min: &str, max: &str) -> CompositeContinuationToken {
        CompositeContinuationToken { token: token.map(str::to_string), range: EpkRange::new(min, max) }
    }

    #[test]
    fn test_extract_single_and_array() {
        let mut carried = HashMap::from([(
            headers::CONTINUATION.to_string(),
            r#"{"token":"abc","range":{"min":"","max":"80"}}"#.to_string(),
        )]);
        let (range, tokens) = extract_range_from_continuation(&mut carried).unwrap();
        assert_eq!(range, EpkRange::new("", "80"));
        assert_eq!(tokens, vec![entry(Some("abc"), "", "80")]);
        assert_eq!(carried.get(headers::CONTINUATION).map(String::as_str), Some("abc"));

        let mut carried = HashMap::from([(
            headers::CONTINUATION.to_string(),
            r#"[{"range":{"min":"40","max":"80"}},{"token":"x","range":{"min":"80","max":"FF"}}]"#.to_string(),
        )]);
        let (range, tokens) = extract_range_from_continuation(&mut carried).unwrap();
        assert_eq!(range, EpkRange::new("40", "80"));
        assert_eq!(tokens.len(), 2);
        assert!(!carried.contains_key(headers::CONTINUATION));
    }

    #[test]
    fn test_extract_without_continuation_and_invalid_json() {
        let mut carried = HashMap::new();
        let (range, tokens) = extract_range_from_continuation(&mut carried).unwrap();
        assert!(range.is_empty());
        assert!(tokens.is_empty());

        let mut carried = HashMap::from([(headers::CONTINUATION.to_string(), "{not json".to_string())]);
        let err = extract_range_from_continuation(&mut carried).unwrap_err();
        assert!(matches!(err, DriverError::Store(StoreError::Status { status: 400, .. })));
    }

    #[tokio::test]
    async fn test_unchanged_range_is_reused() {
        let map = split_map();
        let supplied = vec![entry(Some("t"), "80", "FF")];
        let info = try_get_target_range_from_continuation(
            &map,
            "rid",
            &[EpkRange::full()],
            &EpkRange::new("80", "FF"),
            supplied.clone(),
            EnumerationDirection::Forward,
        )
        .await
        .unwrap();
        assert_eq!(info.resolved_range.map(|r| r.id), Some("3".to_string()));
        assert_eq!(info.continuation_tokens, supplied);
    }

    #[tokio::test]
    async fn test_split_forward_first_child_keeps_token() {
        let map = split_map();
        let info = try_get_target_range_from_continuation(
            &map,
            "rid",
            &[EpkRange::full()],
            &EpkRange::new("", "80"),
            vec![entry(Some("backend"), "", "80"), entry(Some("later"), "80", "FF")],
            EnumerationDirection::Forward,
        )
        .await
        .unwrap();

        assert_eq!(info.resolved_range.map(|r| r.id), Some("1".to_string()));
        assert_eq!(
            info.continuation_tokens,
            vec![entry(Some("backend"), "", "40"), entry(None, "40", "80"), entry(Some("later"), "80", "FF")]
        );
        assert_eq!(map.forced_calls(), 1);
    }

    #[tokio::test]
    async fn test_split_reverse_orders_descending() {
        let map = split_map();
        let info = try_get_target_range_from_continuation(
            &map,
            "rid",
            &[EpkRange::full()],
            &EpkRange::new("", "80"),
            vec![entry(Some("backend"), "", "80")],
            EnumerationDirection::Reverse,
        )
        .await
        .unwrap();

        assert_eq!(info.resolved_range.map(|r| r.id), Some("2".to_string()));
        assert_eq!(info.continuation_tokens, vec![entry(Some("backend"), "40", "80"), entry(None, "", "40")]);
    }

    #[tokio::test]
    async fn test_missing_range_resolves_to_none() {
        let map = FakeRoutingMap::new();
        let info = try_get_target_range_from_continuation(
            &map,
            "rid",
            &[EpkRange::full()],
            &EpkRange::new("", "80"),
            vec![entry(Some("t"), "", "80")],
            EnumerationDirection::Forward,
        )
        .await
        .unwrap();
        assert_eq!(info.resolved_range, None);
    }

    #[tokio::test]
    async fn test_forward_advances_then_stops_at_trailing_boundary() {
        let map = split_map();
        let mut info = ResolvedRangeInfo {
            resolved_range: Some(PartitionKeyRange::new("2", "40", "80")),
            continuation_tokens: vec![],
        };
        let mut carried = HashMap::new();
        let added = try_add_range_to_continuation(
            &mut carried,
            &[EpkRange::full()],
            &map,
            "rid",
            &mut info,
            EnumerationDirection::Forward,
        )
        .await
        .unwrap();
        assert!(added);
        let next: CompositeContinuationToken =
            serde_json::from_str(carried.get(headers::CONTINUATION).unwrap()).unwrap();
        assert_eq!(next, entry(None, "80", "FF"));

        let mut info = ResolvedRangeInfo {
            resolved_range: Some(PartitionKeyRange::new("3", "80", "FF")),
            continuation_tokens: vec![],
        };
        let mut carried = HashMap::new();
        let added = try_add_range_to_continuation(
            &mut carried,
            &[EpkRange::full()],
            &map,
            "rid",
            &mut info,
            EnumerationDirection::Forward,
        )
        .await
        .unwrap();
        assert!(added);
        assert!(!carried.contains_key(headers::CONTINUATION));
    }

    #[tokio::test]
    async fn test_reverse_stops_at_leading_range() {
        let map = split_map();
        let mut info = ResolvedRangeInfo {
            resolved_range: Some(PartitionKeyRange::new("1", "", "40")),
            continuation_tokens: vec![],
        };
        let mut carried = HashMap::new();
        try_add_range_to_continuation(
            &mut carried,
            &[EpkRange::full()],
            &map,
            "rid",
            &mut info,
            EnumerationDirection::Reverse,
        )
        .await
        .unwrap();
        assert!(!carried.contains_key(headers::CONTINUATION));
    }

    #[tokio::test]
    async fn test_multi_entry_head_is_dropped_when_finished() {
        let map = split_map();
        let mut info = ResolvedRangeInfo {
            resolved_range: Some(PartitionKeyRange::new("1", "", "40")),
            continuation_tokens: vec![entry(Some("backend"), "", "40"), entry(None, "40", "80")],
        };
        let mut carried = HashMap::new();
        try_add_range_to_continuation(&mut carried, &[EpkRange::full()], &map, "rid", &mut info, EnumerationDirection::Forward)
            .await
            .unwrap();
        assert_eq!(info.continuation_tokens, vec![entry(None, "40", "80")]);

        let mut info = ResolvedRangeInfo {
            resolved_range: Some(PartitionKeyRange::new("1", "", "40")),
            continuation_tokens: vec![entry(Some("backend"), "", "40"), entry(None, "40", "80")],
        };
        let mut carried = HashMap::from([(headers::CONTINUATION.to_string(), "page2".to_string())]);
        try_add_range_to_continuation(&mut carried, &[EpkRange::full()], &map, "rid", &mut info, EnumerationDirection::Forward)
            .await
            .unwrap();
        let persisted: Vec<CompositeContinuationToken> =
            serde_json::from_str(carried.get(headers::CONTINUATION).unwrap()).unwrap();
        assert_eq!(persisted[0], entry(Some("page2"), "", "40"));
    }
}
