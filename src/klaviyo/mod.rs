//! Klaviyo API integration
//!
//! This module provides the client, transport and types for talking to the Klaviyo REST API.
//! The client pages through segment profiles and profile events and patches profile
//! properties; the transport applies authentication, timeouts and the retry rules.

/// Typed API operations and the `ProfileApi` seam used by the sync workflow
mod client;
/// HTTP transport with retry and rate-limit back-off
mod transport;
/// Type definitions for API documents, domain values and errors
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{KlaviyoClient, ProfileApi};
pub use transport::{
    ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, RetryPolicy, TransportError,
    send_with_retry,
};
pub use types::*;
