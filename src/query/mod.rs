//! Query side of the service: event envelopes, the per-event handler and the
//! dispatcher that fans events out to concurrent tasks.

pub mod dispatcher;
pub mod event;
pub mod handler;

pub use dispatcher::QueryDispatcher;
pub use event::{decode_delivery, Envelope, ResponseEvent};
pub use handler::QueryHandler;
