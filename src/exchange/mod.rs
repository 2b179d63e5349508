pub mod errors;
pub mod rest;
pub mod ws;

pub use errors::{DecodeError, StreamError, TransportError};
pub use rest::ExchangeClientREST;
pub use ws::{ExchangeClientWS, ExchangeEvent};
