//! Remote Store Connector
//!
//! Streaming HTTP client for the durable object store, built on a narrow
//! transport capability.

pub mod connector;
pub mod transport;

pub use connector::{ErrorEntry, ProgressFn, RemoteObject, RemoteStore, UploadOptions};
pub use transport::{HttpTransport, RequestBody, Transport, TransportRequest, TransportResponse};
