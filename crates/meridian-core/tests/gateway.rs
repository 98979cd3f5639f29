#![allow(unused_crate_dependencies)]
#![allow(clippy::tests_outside_test_module, reason = "integration tests live in tests/ dir")]
#![allow(clippy::unwrap_used, reason = "integration test: panics are the assertion mechanism")]

use meridian_core::gateway::{GatewayAddressSource, GatewayTopologySource};
use meridian_core::transport::{AccountTopologySource, AddressSource};
use meridian_core::DriverError;
use meridian_types::FailureKind;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn topology_body(server: &MockServer) -> serde_json::Value {
    serde_json::json!({
        "writableLocations": [
            { "name": "West US", "databaseAccountEndpoint": format!("{}/west/", server.uri()) }
        ],
        "readableLocations": [
            { "name": "West US", "databaseAccountEndpoint": format!("{}/west/", server.uri()) },
            { "name": "East US", "databaseAccountEndpoint": format!("{}/east/", server.uri()) }
        ],
        "enableMultipleWriteLocations": false
    })
}

fn endpoint(server: &MockServer) -> Url {
    Url::parse(&server.uri()).unwrap()
}

#[tokio::test]
async fn test_topology_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(&server)))
        .expect(1)
        .mount(&server)
        .await;

    let source = GatewayTopologySource::new().unwrap();
    let topology = source.get_account_topology(&endpoint(&server)).await.unwrap();

    assert_eq!(topology.writable_locations.len(), 1);
    assert_eq!(topology.readable_locations[1].name, "East US");
    assert!(!topology.enable_multiple_write_locations);
}

#[tokio::test]
async fn test_topology_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such account"))
        .mount(&server)
        .await;

    let err = GatewayTopologySource::new().unwrap().get_account_topology(&endpoint(&server)).await.unwrap_err();
    assert!(matches!(err, DriverError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn test_topology_malformed_body_is_json_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = GatewayTopologySource::new().unwrap().get_account_topology(&endpoint(&server)).await.unwrap_err();
    assert!(matches!(err, DriverError::Json(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_error() {
    let unreachable = Url::parse("http://127.0.0.1:1/").unwrap();
    let err = GatewayTopologySource::new().unwrap().get_account_topology(&unreachable).await.unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::ServiceUnavailable);
}

#[tokio::test]
async fn test_address_fetch_batches_ranges() {
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "addresses": [
            { "physicalUri": "rntbd://10.0.0.1:14000/p/0/r1/", "isPrimary": true, "protocol": "rntbd", "partitionKeyRangeId": "0" },
            { "physicalUri": "rntbd://10.0.0.2:14000/p/0/r2/", "partitionKeyRangeId": "0" },
            { "physicalUri": "rntbd://10.0.0.3:14000/p/1/r1/", "isPrimary": true, "partitionKeyRangeId": "1" }
        ]
    });
    Mock::given(method("GET"))
        .and(path("/addresses"))
        .and(query_param("collection", "rid1"))
        .and(query_param("partitionKeyRangeIds", "0,1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let source = GatewayAddressSource::new().unwrap();
    let addresses = source
        .get_addresses(&endpoint(&server), "rid1", &["0".to_string(), "1".to_string()], false)
        .await
        .unwrap();

    assert_eq!(addresses.len(), 3);
    assert!(addresses[0].is_primary);
    assert!(!addresses[1].is_primary);
    assert_eq!(addresses[2].partition_key_range_id, "1");
}

#[tokio::test]
async fn test_forced_address_fetch_sends_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/addresses/master"))
        .and(header("x-ms-force-refresh", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "addresses": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let addresses = GatewayAddressSource::new().unwrap().get_master_addresses(&endpoint(&server), true).await.unwrap();
    assert!(addresses.is_empty());
}

#[tokio::test]
async fn test_address_gone_maps_to_gone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/addresses"))
        .respond_with(ResponseTemplate::new(410).insert_header("x-ms-substatus", "1002"))
        .mount(&server)
        .await;

    let err = GatewayAddressSource::new()
        .unwrap()
        .get_addresses(&endpoint(&server), "rid1", &["0".to_string()], false)
        .await
        .unwrap_err();
    assert!(err.is_gone());
    assert_eq!(err.failure_kind(), FailureKind::PartitionKeyRangeGone);

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;
    let err = GatewayAddressSource::new()
        .unwrap()
        .get_addresses(&endpoint(&server), "rid1", &["0".to_string()], false)
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::Gone);
}
