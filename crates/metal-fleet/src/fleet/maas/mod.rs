//! MAAS (Metal as a Service) fleet API.
//!
//! Implements the [`FleetApi`](crate::fleet::FleetApi) trait against the
//! MAAS 1.0 REST API, authenticating with OAuth 1.0 PLAINTEXT signatures.

mod client;
mod models;

pub use client::MaasClient;
pub use models::{Credentials, NodeDetails};
