//! End-to-end test utilities for DerTunnel
//!
//! Runs a real tunnel server on an ephemeral port with generated
//! certificates, plus local services for clients to expose.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod visitor;

pub use certificates::TestCertificates;
pub use harness::{TestServer, TEST_TOKEN, TEST_USER};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use visitor::Visitor;
