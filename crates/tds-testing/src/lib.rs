//! # tds-testing
//!
//! Test infrastructure for tds-engine.
//!
//! The [`mock_server`] module provides a scripted TDS server that runs the
//! handshake and answers requests from canned responses, either on a local
//! TCP port or over an in-memory pipe. No SQL Server instance is needed.
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockTdsServer, MockResponse, MockColumn, ScalarValue};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     // Create a mock server with pre-configured responses
//!     let server = MockTdsServer::builder()
//!         .with_response(
//!             "SELECT * FROM users WHERE id = 1",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect your client to server.addr()
//!     let addr = server.addr();
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;

pub use mock_server::{
    MockColumn, MockResponse, MockServerBuilder, MockServerConfig, MockServerError, MockTdsServer,
    RecordedRequest, RequestLog, ScalarValue,
};
