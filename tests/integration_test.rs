//! Integration tests for the Altaro exporter
//!
//! These tests use mockito to simulate Altaro REST API responses

use altaro_exporter::{
    client::{AltaroClient, ApiHealth},
    config::{AltaroConfig, OptionsConfig, Settings},
    metrics::MetricsCollector,
    AltaroError,
};
use mockito::{Mock, Server};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Helper to create a test Altaro config pointing to mock server
fn create_test_config(server: &Server) -> AltaroConfig {
    let addr = server.socket_address();
    let mut config = Settings::default().altaro_server;
    config.rest_host = format!("http://{}", addr.ip());
    config.rest_port = addr.port();
    config.username = "Administrator".to_string();
    config.password = "test-secret".to_string();
    config.timeout_seconds = 5;
    config
}

/// Login mock handing out `tok-1`, `tok-2`, ... on successive logins.
async fn mock_login(server: &mut Server, expected: usize) -> Mock {
    let counter = Arc::new(AtomicUsize::new(0));
    server
        .mock("POST", "/api/sessions/start")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!(r#"{{"Success": true, "Data": "tok-{}"}}"#, n).into_bytes()
        })
        .expect(expected)
        .create_async()
        .await
}

async fn mock_logout(server: &mut Server, token: &str, expected: usize) -> Mock {
    server
        .mock("POST", format!("/api/sessions/end/{}", token).as_str())
        .with_status(200)
        .with_body(r#"{"Success": true}"#)
        .expect(expected)
        .create_async()
        .await
}

async fn mock_listing(server: &mut Server, path: &str, status: usize, body: &str) -> Mock {
    server
        .mock("GET", path)
        .with_status(status)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(1)
        .create_async()
        .await
}

fn vm_json(name: &str, last_backup_time: Option<&str>, next_backup_time: Option<&str>) -> String {
    let quote = |v: Option<&str>| match v {
        Some(s) => format!("\"{}\"", s),
        None => "null".to_string(),
    };
    format!(
        r#"{{
            "VirtualMachineName": "{name}",
            "HostName": "hyperv01",
            "HypervisorVirtualMachineUuid": "uuid-{name}",
            "LastBackupTime": {last},
            "LastBackupDuration": 95,
            "LastBackupTransferSizeCompressed": 1048576,
            "LastBackupTransferSizeUncompressed": 3145728,
            "LastBackupResult": "Success",
            "LastOffsiteCopyTime": null,
            "LastOffsiteCopyDuration": 0,
            "LastOffsiteCopyTransferSizeCompressed": 0,
            "LastOffsiteCopyTransferSizeUncompressed": 0,
            "LastOffsiteCopyResult": null,
            "NextBackupTime": {next},
            "NextOffsiteCopyTime": null
        }}"#,
        name = name,
        last = quote(last_backup_time),
        next = quote(next_backup_time),
    )
}

fn listing_json(vms: &[String]) -> String {
    format!(
        r#"{{"Success": true, "ErrorMessage": null, "VirtualMachines": [{}]}}"#,
        vms.join(",")
    )
}

const INVALID_TOKEN: &str = r#"{"Success": false, "ErrorMessage": "Invalid Token"}"#;

#[tokio::test]
async fn test_list_vms_success() {
    let mut server = Server::new_async().await;

    let login = mock_login(&mut server, 1).await;
    let listing = mock_listing(
        &mut server,
        "/api/vms/list/tok-1/1",
        200,
        &listing_json(&[
            vm_json("dc01", Some("2024-08-13-01-53-14"), Some("2024-08-14-01-00-00")),
            vm_json("web01", None, Some("2024-08-14-01-00-00")),
        ]),
    )
    .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let vms = client.list_vms(false, true).await.unwrap();

    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].vm_name, "dc01");
    assert_eq!(vms[0].host_name, "hyperv01");
    assert_eq!(vms[0].vm_uuid, "uuid-dc01");
    assert!(vms[0].last_backup.timestamp.is_some());
    assert_eq!(vms[0].last_backup.duration_seconds, Some(95.0));
    assert_eq!(vms[1].last_backup.timestamp, None);
    assert_eq!(client.health(), ApiHealth::Healthy);
    assert_eq!(client.session().token(), Some("tok-1"));

    login.assert_async().await;
    listing.assert_async().await;
}

#[tokio::test]
async fn test_include_unconfigured_uses_full_listing() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 1).await;
    let listing = mock_listing(&mut server, "/api/vms/list/tok-1", 200, &listing_json(&[])).await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let vms = client.list_vms(true, true).await.unwrap();

    assert!(vms.is_empty());
    listing.assert_async().await;
}

#[tokio::test]
async fn test_invalid_token_reauthenticates_once() {
    let mut server = Server::new_async().await;

    let login = mock_login(&mut server, 2).await;
    let logout = mock_logout(&mut server, "tok-1", 1).await;
    let rejected = mock_listing(&mut server, "/api/vms/list/tok-1/1", 200, INVALID_TOKEN).await;
    let accepted = mock_listing(
        &mut server,
        "/api/vms/list/tok-2/1",
        200,
        &listing_json(&[vm_json("dc01", None, Some("2024-08-14-01-00-00"))]),
    )
    .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let vms = client.list_vms(false, true).await.unwrap();

    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].vm_name, "dc01");
    assert_eq!(client.health(), ApiHealth::Healthy);
    assert_eq!(client.session().token(), Some("tok-2"));

    login.assert_async().await;
    logout.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test]
async fn test_invalid_token_twice_is_api_error() {
    let mut server = Server::new_async().await;

    let login = mock_login(&mut server, 2).await;
    let logout = mock_logout(&mut server, "tok-1", 1).await;
    let _first = mock_listing(&mut server, "/api/vms/list/tok-1/1", 200, INVALID_TOKEN).await;
    let second = mock_listing(&mut server, "/api/vms/list/tok-2/1", 200, INVALID_TOKEN).await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let result = client.list_vms(false, true).await;

    assert!(matches!(result, Err(AltaroError::InvalidToken(_))));
    assert_eq!(client.health(), ApiHealth::ApiError);

    // Exactly one retry
    login.assert_async().await;
    logout.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_other_api_error_is_not_retried() {
    let mut server = Server::new_async().await;

    let login = mock_login(&mut server, 1).await;
    let logout = mock_logout(&mut server, "tok-1", 0).await;
    let listing = mock_listing(
        &mut server,
        "/api/vms/list/tok-1/1",
        200,
        r#"{"Success": false, "ErrorMessage": "Access denied"}"#,
    )
    .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let result = client.list_vms(false, true).await;

    assert!(matches!(result, Err(AltaroError::Api(_))));
    assert_eq!(client.health(), ApiHealth::ApiError);

    login.assert_async().await;
    logout.assert_async().await;
    listing.assert_async().await;
}

#[tokio::test]
async fn test_http_error_retries_then_cannot_connect() {
    let mut server = Server::new_async().await;

    let login = mock_login(&mut server, 2).await;
    let logout = mock_logout(&mut server, "tok-1", 1).await;
    let _first = mock_listing(&mut server, "/api/vms/list/tok-1/1", 500, "").await;
    let second = mock_listing(&mut server, "/api/vms/list/tok-2/1", 500, "").await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let result = client.list_vms(false, true).await;

    assert!(matches!(result, Err(AltaroError::Transport(_))));
    assert_eq!(client.health(), ApiHealth::CannotConnect);

    login.assert_async().await;
    logout.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_http_error_recovered_by_retry() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 2).await;
    let _logout = mock_logout(&mut server, "tok-1", 1).await;
    let _first = mock_listing(&mut server, "/api/vms/list/tok-1/1", 502, "").await;
    let _second = mock_listing(
        &mut server,
        "/api/vms/list/tok-2/1",
        200,
        &listing_json(&[vm_json("dc01", None, None)]),
    )
    .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let vms = client.list_vms(false, true).await.unwrap();

    assert_eq!(vms.len(), 1);
    assert_eq!(client.health(), ApiHealth::Healthy);
}

#[tokio::test]
async fn test_transport_error_does_not_expose_token() {
    let mut server = Server::new_async().await;

    let _login = server
        .mock("POST", "/api/sessions/start")
        .with_status(200)
        .with_body(r#"{"Success": true, "Data": "SECRETTOKEN"}"#)
        .expect(2)
        .create_async()
        .await;
    let _logout = mock_logout(&mut server, "SECRETTOKEN", 1).await;
    let listing = server
        .mock("GET", "/api/vms/list/SECRETTOKEN/1")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let err = client.list_vms(false, true).await.unwrap_err();

    assert!(matches!(err, AltaroError::Transport(_)));
    assert!(!err.to_string().contains("SECRETTOKEN"));
    assert!(!format!("{:?}", err).contains("SECRETTOKEN"));
    listing.assert_async().await;
}

#[tokio::test]
async fn test_null_labels_do_not_drop_the_listing() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 1).await;
    let unconfigured = r#"{
        "VirtualMachineName": "unconf",
        "HostName": null,
        "HypervisorVirtualMachineUuid": null,
        "LastBackupResult": 7
    }"#;
    let _listing = mock_listing(
        &mut server,
        "/api/vms/list/tok-1",
        200,
        &listing_json(&[
            vm_json("dc01", Some("2024-08-13-01-53-14"), Some("2024-08-14-01-00-00")),
            unconfigured.to_string(),
        ]),
    )
    .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let vms = client.list_vms(true, true).await.unwrap();

    assert_eq!(client.health(), ApiHealth::Healthy);
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].vm_name, "dc01");
    assert!(vms[0].last_backup.timestamp.is_some());
    assert_eq!(vms[1].labels(), ["unconf", "", ""]);
    assert_eq!(vms[1].last_backup.result, None);
}

#[tokio::test]
async fn test_unreachable_api_is_cannot_connect() {
    // Grab a free port, then close it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = Settings::default().altaro_server;
    config.rest_host = "http://127.0.0.1".to_string();
    config.rest_port = port;
    config.username = "Administrator".to_string();
    config.password = "test-secret".to_string();
    config.timeout_seconds = 2;

    let mut client = AltaroClient::new(config).unwrap();
    let result = client.list_vms(false, true).await;

    assert!(matches!(result, Err(AltaroError::Transport(_))));
    assert_eq!(client.health(), ApiHealth::CannotConnect);
    assert!(!client.session().is_active());
}

#[tokio::test]
async fn test_busy_session_is_not_retried() {
    let mut server = Server::new_async().await;

    let login = server
        .mock("POST", "/api/sessions/start")
        .with_status(200)
        .with_body(r#"{"Success": false, "ErrorMessage": "User already has an open session"}"#)
        .expect(1)
        .create_async()
        .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();
    let result = client.list_vms(false, true).await;

    assert!(matches!(result, Err(AltaroError::SessionBusy(_))));
    assert_eq!(client.health(), ApiHealth::ApiError);
    login.assert_async().await;
}

#[tokio::test]
async fn test_scheduling_filter() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 1).await;
    let body = listing_json(&[
        vm_json("scheduled", None, Some("2024-08-14-01-00-00")),
        vm_json("template", None, None),
    ]);
    let _listing = server
        .mock("GET", "/api/vms/list/tok-1/1")
        .with_status(200)
        .with_body(&body)
        .expect(2)
        .create_async()
        .await;

    let mut client = AltaroClient::new(create_test_config(&server)).unwrap();

    let all = client.list_vms(false, true).await.unwrap();
    assert_eq!(all.len(), 2);

    let scheduled_only = client.list_vms(false, false).await.unwrap();
    assert_eq!(scheduled_only.len(), 1);
    assert_eq!(scheduled_only[0].vm_name, "scheduled");
}

#[tokio::test]
async fn test_metrics_collection_success() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 1).await;
    let _listing = mock_listing(
        &mut server,
        "/api/vms/list/tok-1",
        200,
        &listing_json(&[
            vm_json("dc01", Some("2024-08-13-01-53-14"), Some("2024-08-14-01-00-00")),
            vm_json("web01", None, Some("2024-08-14-01-00-00")),
        ]),
    )
    .await;

    let client = AltaroClient::new(create_test_config(&server)).unwrap();
    let collector = MetricsCollector::new(client, OptionsConfig::default()).unwrap();

    let result = collector.collect().await;
    assert!(result.is_ok());

    let metrics_output = collector.encode().unwrap();

    assert!(metrics_output.contains("# HELP"));
    assert!(metrics_output.contains("# TYPE"));
    assert!(metrics_output.contains("altaro_api_success 0"));
    assert!(metrics_output.contains("altaro_vms 2"));
    assert!(metrics_output.contains(
        r#"altaro_lastbackup_timestamp{hostname="hyperv01",vmname="dc01",vmuuid="uuid-dc01"}"#
    ));
    assert!(metrics_output.contains(
        r#"altaro_lastbackup_result{hostname="hyperv01",vmname="web01",vmuuid="uuid-web01"} 0"#
    ));

    // web01 was never backed up: no timestamp sample at all, not zero
    assert!(!metrics_output.contains(
        r#"altaro_lastbackup_timestamp{hostname="hyperv01",vmname="web01",vmuuid="uuid-web01"}"#
    ));
    // Null offsite results produce no sample
    assert!(!metrics_output.contains("altaro_lastoffsitecopy_result{"));
}

#[tokio::test]
async fn test_stale_vms_removed_between_collections() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 1).await;
    let both = listing_json(&[
        vm_json("vm-a", Some("2024-08-13-01-53-14"), Some("2024-08-14-01-00-00")),
        vm_json("vm-b", Some("2024-08-13-02-10-00"), Some("2024-08-14-01-00-00")),
    ]);
    let only_a = listing_json(&[vm_json(
        "vm-a",
        Some("2024-08-13-01-53-14"),
        Some("2024-08-14-01-00-00"),
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    let _listing = server
        .mock("GET", "/api/vms/list/tok-1")
        .with_status(200)
        .with_body_from_request(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                both.clone().into_bytes()
            } else {
                only_a.clone().into_bytes()
            }
        })
        .expect(2)
        .create_async()
        .await;

    let client = AltaroClient::new(create_test_config(&server)).unwrap();
    let collector = MetricsCollector::new(client, OptionsConfig::default()).unwrap();

    collector.collect().await.unwrap();
    assert!(collector.encode().unwrap().contains(r#"vmname="vm-b""#));

    collector.collect().await.unwrap();
    let metrics_output = collector.encode().unwrap();
    assert!(metrics_output.contains(r#"vmname="vm-a""#));
    assert!(!metrics_output.contains(r#"vmname="vm-b""#));
}

#[tokio::test]
async fn test_metrics_collection_failure_keeps_previous_snapshot() {
    let mut server = Server::new_async().await;

    let _login = mock_login(&mut server, 2).await;
    let _logout = mock_logout(&mut server, "tok-1", 1).await;
    let ok = mock_listing(
        &mut server,
        "/api/vms/list/tok-1",
        200,
        &listing_json(&[vm_json("dc01", None, Some("2024-08-14-01-00-00"))]),
    )
    .await;

    let client = AltaroClient::new(create_test_config(&server)).unwrap();
    let collector = MetricsCollector::new(client, OptionsConfig::default()).unwrap();
    collector.collect().await.unwrap();

    // Session tok-1 is now rejected, and so is the fresh one
    ok.remove_async().await;
    let _rejected = mock_listing(&mut server, "/api/vms/list/tok-1", 200, INVALID_TOKEN).await;
    let _rejected_again =
        mock_listing(&mut server, "/api/vms/list/tok-2", 200, INVALID_TOKEN).await;

    let result = collector.collect().await;
    assert!(result.is_err());

    let metrics_output = collector.encode().unwrap();
    assert!(metrics_output.contains("altaro_api_success 2"));
    assert!(metrics_output.contains(r#"vmname="dc01""#));
}
