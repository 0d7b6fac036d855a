//! Client for a legacy binary push notification gateway and its companion
//! feedback service.
//!
//! # Purpose
//! Accepts notification requests from application code, batches them over a
//! single persistent mutually-authenticated TLS connection to the gateway,
//! observes the error frame the gateway emits before closing, and drains
//! the feedback service into a map of unreachable device tokens.
//!
//! # Design notes
//! One bounded queue feeds one dispatch worker that owns the gateway
//! session's write side. The session is opened lazily when traffic arrives
//! and closed again after an idle interval; frames that fail to send are
//! requeued ahead of newer traffic. Feedback drains run one at a time on
//! their own session.
pub mod client;
pub mod config;

pub use client::service::{Client, EnqueueError, FetchError};
pub use config::ClientOptions;
pub use courier_transport::{
    ClientIdentity, Endpoint, Endpoints, Error as TransportError, TransportConfig,
};
pub use courier_wire::{DeviceToken, GatewayResponse, ResponseStatus};
