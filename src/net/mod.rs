//! Network value types and collaborator contracts.
//!
//! Requests, responses, request selection, and the transport and observer
//! interfaces the scheduler consumes.

mod matcher;
mod observer;
mod request;
mod response;
mod transport;

pub use matcher::{RequestMatcher, UrlPattern};
pub(crate) use observer::guarded;
pub use observer::{NetworkObserver, NoopObserver, SendDecision};
pub(crate) use request::push_escaped;
pub use request::{Request, RequestBuilder, RequestId, RequestState, Settlement};
pub use response::{is_success_status, parse_vary, Response, ResponseBuilder};
pub use transport::Transport;
