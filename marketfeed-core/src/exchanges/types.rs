//! Canonical market data types

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::fmt;

/// Exchange identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exchange {
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Okx => "okx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single order book level: price, size and number of orders.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
    pub count: u64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64, count: u64) -> Self {
        Self { price, size, count }
    }
}

// Levels go on the wire as compact `[price, size, count]` arrays.
impl Serialize for BookLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.price)?;
        tuple.serialize_element(&self.size)?;
        tuple.serialize_element(&self.count)?;
        tuple.end()
    }
}

/// Top-N book snapshot payload
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BookSnapshot {
    pub n: usize,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookSnapshot {
    /// Build a snapshot whose best prices come from the first level of each
    /// side, or zero when a side is empty.
    pub fn from_levels(n: usize, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        let best_bid = bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(0.0);
        Self {
            n,
            best_bid,
            best_ask,
            bids,
            asks,
        }
    }

    pub fn spread(&self) -> f64 {
        self.best_ask - self.best_bid
    }
}

/// Public trade payload
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TradePrint {
    pub price: f64,
    pub size: f64,
    pub side: String,
    pub trade_id: Option<String>,
}

/// Event payload, one of the two supported observation kinds.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Book(BookSnapshot),
    Trade(TradePrint),
}

/// Normalized, exchange-agnostic market data observation.
///
/// `ts_exchange_ms` and `ts_recv_epoch_ms` live in the wall-clock domain;
/// the three `*_mono_ns` stamps share the monotonic domain and satisfy
/// `recv <= decoded <= proc`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalEvent {
    pub exchange: String,
    pub symbol: String,
    pub channel: String,
    pub event_type: String,
    pub ts_exchange_ms: i64,
    pub ts_recv_epoch_ms: i64,
    pub ts_recv_mono_ns: u64,
    pub ts_decoded_mono_ns: u64,
    pub ts_proc_mono_ns: u64,
    pub payload: Payload,
}

impl CanonicalEvent {
    /// Exchange to local receipt latency in milliseconds (wall clock).
    /// Saturates on out-of-range exchange timestamps.
    pub fn exchange_to_recv_ms(&self) -> i64 {
        self.ts_recv_epoch_ms.saturating_sub(self.ts_exchange_ms)
    }

    /// Receipt to decode latency in nanoseconds (monotonic).
    pub fn recv_to_decode_ns(&self) -> u64 {
        self.ts_decoded_mono_ns.saturating_sub(self.ts_recv_mono_ns)
    }

    /// Decode to processed latency in nanoseconds (monotonic).
    pub fn decode_to_proc_ns(&self) -> u64 {
        self.ts_proc_mono_ns.saturating_sub(self.ts_decoded_mono_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_event() -> CanonicalEvent {
        CanonicalEvent {
            exchange: Exchange::Okx.to_string(),
            symbol: "ETH-USDT".to_string(),
            channel: "trades".to_string(),
            event_type: "trade".to_string(),
            ts_exchange_ms: 1_000,
            ts_recv_epoch_ms: 1_012,
            ts_recv_mono_ns: 10,
            ts_decoded_mono_ns: 40,
            ts_proc_mono_ns: 45,
            payload: Payload::Trade(TradePrint {
                price: 2500.5,
                size: 0.1,
                side: "buy".to_string(),
                trade_id: None,
            }),
        }
    }

    #[test]
    fn test_stage_latencies() {
        let event = trade_event();
        assert_eq!(event.exchange_to_recv_ms(), 12);
        assert_eq!(event.recv_to_decode_ns(), 30);
        assert_eq!(event.decode_to_proc_ns(), 5);
    }

    #[test]
    fn test_extreme_exchange_ts_saturates() {
        let mut event = trade_event();
        event.ts_exchange_ms = i64::MIN;
        assert_eq!(event.exchange_to_recv_ms(), i64::MAX);
        event.ts_exchange_ms = i64::MAX;
        event.ts_recv_epoch_ms = -1;
        assert_eq!(event.exchange_to_recv_ms(), i64::MIN);
    }

    #[test]
    fn test_book_snapshot_best_prices() {
        let book = BookSnapshot::from_levels(
            5,
            vec![BookLevel::new(100.0, 1.0, 2), BookLevel::new(99.5, 3.0, 1)],
            vec![],
        );
        assert_eq!(book.best_bid, 100.0);
        assert_eq!(book.best_ask, 0.0);
    }

    #[test]
    fn test_book_payload_serializes_levels_as_arrays() {
        let payload = Payload::Book(BookSnapshot::from_levels(
            5,
            vec![BookLevel::new(100.0, 1.0, 2)],
            vec![BookLevel::new(101.0, 0.5, 3)],
        ));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["n"], 5);
        assert_eq!(value["bids"], serde_json::json!([[100.0, 1.0, 2]]));
        assert_eq!(value["asks"], serde_json::json!([[101.0, 0.5, 3]]));
    }

    #[test]
    fn test_trade_event_serializes_flat_payload() {
        let value = serde_json::to_value(trade_event()).unwrap();
        assert_eq!(value["exchange"], "okx");
        assert_eq!(value["ts_proc_mono_ns"], 45);
        assert_eq!(value["payload"]["side"], "buy");
        assert!(value["payload"]["trade_id"].is_null());
    }
}
