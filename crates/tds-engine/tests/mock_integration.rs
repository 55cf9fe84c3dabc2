//! Client behaviour against the mock TDS server.
//!
//! No SQL Server is needed:
//!   cargo test -p tds-engine --test mock_integration

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use futures_util::StreamExt;
use tds_engine::{Client, Config, Error, LifecycleState, QueryResults, RpcRequest, Segment};
use tds_protocol::ProtocolError;
use tds_testing::mock_server::{MockColumn, MockResponse, MockTdsServer, ScalarValue};

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config_for(server: &MockTdsServer) -> Config {
    Config::new()
        .host(server.host())
        .port(server.port())
        .credentials("sa", "secret")
        .database("app")
}

async fn connect(server: &MockTdsServer) -> Client {
    init_tracing();
    Client::connect(config_for(server)).await.unwrap()
}

/// Drain every result; each entry is a result's segments or the error that
/// ended it.
async fn collect(mut results: QueryResults) -> Vec<Result<Vec<Segment>, Error>> {
    let mut out = Vec::new();
    while let Some(result) = results.next().await {
        match result {
            Ok(mut result) => {
                let mut segments = Vec::new();
                let mut failure = None;
                while let Some(segment) = result.next().await {
                    match segment {
                        Ok(segment) => segments.push(segment),
                        Err(e) => failure = Some(e),
                    }
                }
                out.push(failure.map_or(Ok(segments), Err));
            }
            Err(e) => out.push(Err(e)),
        }
    }
    out
}

async fn wait_for_requests(server: &MockTdsServer, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.log().requests().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server never saw the request");
}

fn users() -> MockResponse {
    MockResponse::rows(
        vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
        vec![
            vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())],
            vec![ScalarValue::Int(2), ScalarValue::Null],
        ],
    )
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_login_reaches_ready() {
    let server = MockTdsServer::builder()
        .with_server_name("MockSQL")
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    assert_eq!(client.state(), LifecycleState::Ready);
    let session = client.session();
    assert_eq!(session.database.as_deref(), Some("app"));
    assert_eq!(session.packet_size, 4096);
    assert_eq!(session.server_program.as_deref(), Some("MockSQL"));
}

#[tokio::test]
async fn test_login_failure() {
    init_tracing();
    let server = MockTdsServer::builder()
        .with_login_error(18456, "Login failed for user 'sa'.")
        .build()
        .await
        .unwrap();

    let err = Client::connect(config_for(&server)).await.unwrap_err();
    assert!(matches!(&err, Error::LoginFailed(text) if text.contains("18456")));
}

#[tokio::test]
async fn test_server_enabling_mars_is_refused() {
    init_tracing();
    let server = MockTdsServer::builder().with_mars(true).build().await.unwrap();

    let err = Client::connect(config_for(&server)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::InvalidField {
            field: "prelogin MARS",
            ..
        })
    ));
    assert!(server.log().requests().is_empty());
}

#[tokio::test]
async fn test_connect_over_duplex_stream() {
    init_tracing();
    let (stream, log) = MockTdsServer::builder()
        .with_response("SELECT 7", MockResponse::scalar_int(7))
        .build_duplex();
    let client = Client::connect_with(stream, Config::new().credentials("sa", "secret"))
        .await
        .unwrap();

    let results = collect(client.execute("SELECT 7").unwrap()).await;
    assert_eq!(results.len(), 1);
    let segments = results[0].as_ref().unwrap();
    let row = segments[0].as_row().unwrap();
    assert_eq!(row.get(0).unwrap().unwrap().as_ref(), &[7, 0, 0, 0]);
    assert_eq!(segments[1].update_count(), Some(1));
    assert_eq!(log.requests().len(), 1);
}

// =============================================================================
// Result mapping
// =============================================================================

#[tokio::test]
async fn test_rows_then_count_form_one_result() {
    let server = MockTdsServer::builder()
        .with_response("SELECT id, name FROM users", users())
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("SELECT id, name FROM users").unwrap()).await;
    assert_eq!(results.len(), 1, "no phantom result after the rows");

    let segments = results[0].as_ref().unwrap();
    assert_eq!(segments.len(), 3);
    let first = segments[0].as_row().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(
        first.get_by_name("name").unwrap().unwrap().as_ref(),
        "Alice".encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<_>>().as_slice()
    );
    assert_eq!(segments[1].as_row().unwrap().get(1), Some(None));
    assert_eq!(segments[2].update_count(), Some(2));
}

#[tokio::test]
async fn test_lone_done_yields_one_result() {
    let server = MockTdsServer::builder()
        .with_response("DELETE FROM t", MockResponse::affected(5))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("DELETE FROM t").unwrap()).await;
    assert_eq!(results.len(), 1);
    let segments = results[0].as_ref().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].update_count(), Some(5));
}

#[tokio::test]
async fn test_multiple_results() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::results(vec![
            MockResponse::affected(3),
            users(),
        ]))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("UPDATE t SET x = 1; SELECT * FROM users").unwrap()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap()[0].update_count(), Some(3));
    assert_eq!(results[1].as_ref().unwrap().len(), 3);
}

#[tokio::test]
async fn test_server_error_aborts_only_its_result() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::results(vec![
            MockResponse::error(208, "Invalid object name 'nope'."),
            MockResponse::affected(1),
        ]))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("SELECT * FROM nope; DELETE FROM t").unwrap()).await;
    assert_eq!(results.len(), 2);
    let err = results[0].as_ref().unwrap_err();
    assert!(err.is_server_error(208));
    assert!(!err.is_fatal());
    assert_eq!(results[1].as_ref().unwrap()[0].update_count(), Some(1));
    assert_eq!(client.state(), LifecycleState::Ready);
}

#[tokio::test]
async fn test_fatal_error_closes_connection() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::error_with_severity(
            3980,
            20,
            "The request failed to run because the batch is aborted.",
        ))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("SELECT 1").unwrap()).await;
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| matches!(
        r,
        Err(Error::Server { number: 3980, class: 20, .. })
    )));
    assert_eq!(client.state(), LifecycleState::Closed);
    assert!(matches!(client.execute("SELECT 1"), Err(Error::Closed)));
}

#[tokio::test]
async fn test_server_disconnect_fails_request() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Disconnect)
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute("SELECT 1").unwrap()).await;
    assert!(matches!(results.as_slice(), [Err(Error::Closed)]));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_rpc_request() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(0))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = collect(client.execute_rpc(RpcRequest::named("sp_who")).unwrap()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(
        server.log().requests()[0].packet_type,
        tds_engine::PacketType::Rpc
    );
}

// =============================================================================
// Request discipline
// =============================================================================

#[tokio::test]
async fn test_half_duplex() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = connect(&server).await;

    let first = client.execute("SELECT 1").unwrap();
    assert!(matches!(
        client.execute("SELECT 2"),
        Err(Error::InvalidState(_))
    ));

    collect(first).await;
    let second = collect(client.execute("SELECT 2").unwrap()).await;
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn test_env_change_updates_session() {
    let server = MockTdsServer::builder()
        .with_response("USE reporting", MockResponse::UseDatabase("reporting".into()))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    collect(client.execute("USE reporting").unwrap()).await;
    assert_eq!(client.session().database.as_deref(), Some("reporting"));
}

#[tokio::test]
async fn test_reset_applies_to_next_request_only() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = connect(&server).await;

    client.reset_on_next_request();
    collect(client.execute("SELECT 1").unwrap()).await;
    collect(client.execute("SELECT 2").unwrap()).await;

    let requests = server.log().requests();
    assert!(requests[0].reset_requested());
    assert!(!requests[1].reset_requested());
}

#[tokio::test]
async fn test_reset_ack_returns_session_to_defaults() {
    let server = MockTdsServer::builder()
        .with_server_name("MockSQL")
        .with_response("USE reporting", MockResponse::UseDatabase("reporting".into()))
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;
    let before = client.session();

    collect(client.execute("USE reporting").unwrap()).await;
    assert_eq!(client.session().database.as_deref(), Some("reporting"));

    client.reset_on_next_request();
    let results = collect(client.execute("SELECT 1").unwrap()).await;
    assert!(results[0].is_ok());

    let after = client.session();
    assert_eq!(after.database, None);
    assert_eq!(after.tds_version, before.tds_version);
    assert_eq!(after.server_program.as_deref(), Some("MockSQL"));
    assert_eq!(client.state(), LifecycleState::Ready);

    // The channel stays open after the reset.
    let results = collect(client.execute("SELECT 2").unwrap()).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
}

// =============================================================================
// Cancellation and close
// =============================================================================

#[tokio::test]
async fn test_cancel_in_flight_request() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let results = client.execute("WAITFOR DELAY '01:00'").unwrap();
    wait_for_requests(&server, 1).await;
    client.cancel();

    let results = tokio::time::timeout(Duration::from_secs(5), collect(results))
        .await
        .unwrap();
    assert!(matches!(results.as_slice(), [Err(Error::Cancelled)]));
    assert_eq!(server.log().attention_count(), 1);

    // The connection survives the cancel.
    let next = collect(client.execute("SELECT 1").unwrap()).await;
    assert_eq!(next.len(), 1);
    assert_eq!(client.state(), LifecycleState::Ready);
}

#[tokio::test]
async fn test_cancel_before_request_is_written() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    // No await in between: the driver has not had a chance to write.
    let results = client.execute("WAITFOR DELAY '01:00'").unwrap();
    client.cancel();

    let results = tokio::time::timeout(Duration::from_secs(5), collect(results))
        .await
        .unwrap();
    assert!(matches!(results.as_slice(), [Err(Error::Cancelled)]));

    let next = collect(client.execute("SELECT 1").unwrap()).await;
    assert_eq!(next.len(), 1);
    let requests = server.log().requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].sql.as_deref(), Some("SELECT 1"));
    assert_eq!(server.log().attention_count(), 0);
}

#[tokio::test]
async fn test_dropping_results_cancels_request() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let mut results = client.execute("WAITFOR DELAY '01:00'").unwrap();
    wait_for_requests(&server, 1).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(50), results.next())
            .await
            .is_err()
    );
    drop(results);

    // Served only after the attention is acknowledged.
    let next = tokio::time::timeout(
        Duration::from_secs(5),
        collect(client.execute("SELECT 1").unwrap()),
    )
    .await
    .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(server.log().attention_count(), 1);
}

#[tokio::test]
async fn test_close() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = connect(&server).await;

    client.close().await;
    assert_eq!(client.state(), LifecycleState::Closed);
    assert!(matches!(client.execute("SELECT 1"), Err(Error::Closed)));
    // Closing again is harmless.
    client.close().await;
}
