//! Transport contract.
//!
//! The scheduler never speaks HTTP itself. A transport receives a request,
//! performs the exchange and reports either a response or an error. When a
//! request is aborted the queue stops polling the transport future, so
//! implementations get cancellation by drop; long-running ones may also watch
//! [`Request::cancellation_token`].

use async_trait::async_trait;

use super::request::Request;
use super::response::Response;
use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}
