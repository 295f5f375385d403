//! Exchange connectivity modules

pub mod backoff;
pub mod errors;
pub mod okx;
pub mod types;
pub mod websocket;

pub use backoff::{Backoff, BackoffConfig};
pub use errors::{ErrorKind, FeedError, FeedResult};
pub use types::{BookLevel, BookSnapshot, CanonicalEvent, Exchange, Payload, TradePrint};
pub use websocket::{
    Connection, RawFrame, StreamConfig, StreamSource, StreamStats, Transport,
    TungsteniteTransport, WireFrame,
};
