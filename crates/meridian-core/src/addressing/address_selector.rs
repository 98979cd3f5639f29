//! Replica selection on top of an [`AddressResolver`].

use std::sync::Arc;

use meridian_types::{PartitionAddresses, Protocol, ReplicaAddress, StoreError};
use rand::seq::SliceRandom;
use url::Url;

use crate::error::DriverResult;
use crate::request::ServiceRequest;
use crate::transport::AddressResolver;

pub struct AddressSelector {
    resolver: Arc<dyn AddressResolver>,
    protocol: Protocol,
}

impl AddressSelector {
    pub fn new(resolver: Arc<dyn AddressResolver>, protocol: Protocol) -> Self {
        Self { resolver, protocol }
    }

    pub async fn resolve_addresses(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<PartitionAddresses> {
        self.resolver.resolve(request, force_refresh).await
    }

    /// Replicas speaking the configured protocol.
    pub async fn resolve_all_addresses(
        &self,
        request: &mut ServiceRequest,
        include_primary: bool,
        force_refresh: bool,
    ) -> DriverResult<Vec<ReplicaAddress>> {
        let addresses = self.resolver.resolve(request, force_refresh).await?;
        Ok(addresses.for_protocol(self.protocol, include_primary))
    }

    /// The current primary; Gone when the replica set has none.
    pub async fn resolve_primary(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> DriverResult<ReplicaAddress> {
        let addresses = self.resolver.resolve(request, force_refresh).await?;
        addresses
            .primary()
            .filter(|p| p.protocol == self.protocol)
            .cloned()
            .ok_or_else(|| StoreError::gone(format!("no primary replica for {}", addresses.identity)).into())
    }
}

/// Shuffle replicas, then move endpoints that already failed this request to the end.
pub fn enumerate_replicas(replicas: &[ReplicaAddress], failed_endpoints: &[Url]) -> Vec<ReplicaAddress> {
    let mut shuffled = replicas.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());
    let (mut fresh, failed): (Vec<_>, Vec<_>) =
        shuffled.into_iter().partition(|r| !failed_endpoints.contains(&r.physical_uri));
    fresh.extend(failed);
    fresh
}

#[cfg(test)]
mod tests {
    use meridian_types::{OperationType, ResourceType};

    use super::*;
    use crate::testing::{replicas, FakeAddressResolver};

    #[test]
    fn test_failed_endpoints_enumerated_last() {
        let set = replicas("0", 4);
        let failed = vec![set[1].physical_uri.clone(), set[2].physical_uri.clone()];

        for _ in 0..20 {
            let order = enumerate_replicas(&set, &failed);
            assert_eq!(order.len(), 4);
            assert!(order[..2].iter().all(|r| !failed.contains(&r.physical_uri)));
            assert!(order[2..].iter().all(|r| failed.contains(&r.physical_uri)));
        }
    }

    #[tokio::test]
    async fn test_primary_and_secondaries() {
        let set = replicas("0", 4);
        let selector = AddressSelector::new(FakeAddressResolver::new(set.clone()), Protocol::Rntbd);
        let mut request = ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/d/colls/c");

        let primary = selector.resolve_primary(&mut request, false).await.unwrap();
        assert_eq!(primary, set[0]);
        let secondaries = selector.resolve_all_addresses(&mut request, false, false).await.unwrap();
        assert_eq!(secondaries, set[1..].to_vec());
    }

    #[tokio::test]
    async fn test_missing_primary_is_gone() {
        let set: Vec<_> = replicas("0", 3).into_iter().skip(1).collect();
        let selector = AddressSelector::new(FakeAddressResolver::new(set), Protocol::Rntbd);
        let mut request = ServiceRequest::new(OperationType::Create, ResourceType::Document, "dbs/d/colls/c");

        let err = selector.resolve_primary(&mut request, false).await.unwrap_err();
        assert!(err.is_gone());
    }
}
