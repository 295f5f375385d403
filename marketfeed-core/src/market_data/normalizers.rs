//! Exchange-specific normalizers

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::trace;

use super::{check_clock_ordering, MarketDataNormalizer, NormalizeError};
use crate::clock::Clock;
use crate::exchanges::okx::{ChannelKind, EVENT_TYPE_BOOK_TOPN, EVENT_TYPE_TRADE};
use crate::exchanges::{
    BookLevel, BookSnapshot, CanonicalEvent, Exchange, Payload, RawFrame, TradePrint,
};

/// OKX public channel normalizer.
///
/// Stateless apart from the clock used to stamp the processed time. The
/// decode stamp is shared by every event of a frame, so for trade bursts the
/// decode to processed latency of later trades includes the earlier ones.
pub struct OkxNormalizer {
    clock: Arc<dyn Clock>,
}

impl OkxNormalizer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn build_event(
        &self,
        frame: &RawFrame,
        symbol: &str,
        channel: &str,
        event_type: &str,
        ts_exchange_ms: i64,
        payload: Payload,
    ) -> Result<CanonicalEvent, NormalizeError> {
        let ts_proc_mono_ns = self.clock.now_mono_ns();
        check_clock_ordering(frame.recv_mono_ns, frame.decoded_mono_ns, ts_proc_mono_ns)?;
        trace!(
            symbol,
            channel,
            recv_ns = frame.recv_mono_ns,
            decoded_ns = frame.decoded_mono_ns,
            proc_ns = ts_proc_mono_ns,
            "Normalized event"
        );

        Ok(CanonicalEvent {
            exchange: Exchange::Okx.to_string(),
            symbol: symbol.to_string(),
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            ts_exchange_ms,
            ts_recv_epoch_ms: frame.recv_epoch_ms,
            ts_recv_mono_ns: frame.recv_mono_ns,
            ts_decoded_mono_ns: frame.decoded_mono_ns,
            ts_proc_mono_ns,
            payload,
        })
    }

    fn normalize_book(
        &self,
        frame: &RawFrame,
        symbol: &str,
        channel: &str,
        depth: usize,
        data: &[Value],
    ) -> Result<Vec<CanonicalEvent>, NormalizeError> {
        let Some(snapshot) = data.first().and_then(Value::as_object) else {
            return Ok(Vec::new());
        };
        let Some(ts_exchange_ms) = parse_exchange_ts(snapshot) else {
            return Ok(Vec::new());
        };

        let bids = parse_levels(snapshot.get("bids"));
        let asks = parse_levels(snapshot.get("asks"));
        let payload = Payload::Book(BookSnapshot::from_levels(depth, bids, asks));

        let event = self.build_event(
            frame,
            symbol,
            channel,
            EVENT_TYPE_BOOK_TOPN,
            ts_exchange_ms,
            payload,
        )?;
        Ok(vec![event])
    }

    fn normalize_trades(
        &self,
        frame: &RawFrame,
        symbol: &str,
        channel: &str,
        data: &[Value],
    ) -> Result<Vec<CanonicalEvent>, NormalizeError> {
        let mut events = Vec::with_capacity(data.len());
        for item in data {
            let Some(trade) = item.as_object() else {
                continue;
            };
            let Some(ts_exchange_ms) = parse_exchange_ts(trade) else {
                continue;
            };
            let Some(payload) = parse_trade(trade) else {
                continue;
            };
            events.push(self.build_event(
                frame,
                symbol,
                channel,
                EVENT_TYPE_TRADE,
                ts_exchange_ms,
                Payload::Trade(payload),
            )?);
        }
        Ok(events)
    }
}

impl MarketDataNormalizer for OkxNormalizer {
    fn normalize(&self, frame: &RawFrame) -> Result<Vec<CanonicalEvent>, NormalizeError> {
        let message = &frame.message;

        if let Some(event) = message.get("event").and_then(Value::as_str) {
            if matches!(event, "subscribe" | "unsubscribe" | "error") {
                return Ok(Vec::new());
            }
        }

        let arg = message.get("arg").and_then(Value::as_object);
        let channel = arg
            .and_then(|a| a.get("channel"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty());
        let data = message
            .get("data")
            .and_then(Value::as_array)
            .filter(|d| !d.is_empty());
        let (Some(channel), Some(data)) = (channel, data) else {
            return Ok(Vec::new());
        };
        let Some(symbol) = arg
            .and_then(|a| a.get("instId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Ok(Vec::new());
        };

        match ChannelKind::from_channel(channel) {
            Some(ChannelKind::BookSnapshot { depth }) => {
                self.normalize_book(frame, symbol, channel, depth, data)
            }
            Some(ChannelKind::Trades) => self.normalize_trades(frame, symbol, channel, data),
            None => Ok(Vec::new()),
        }
    }

    fn exchange_name(&self) -> &str {
        Exchange::Okx.as_str()
    }
}

/// Exchange timestamp in epoch ms. An absent `ts` reads as zero; a present
/// one that is not an integer (string or number) rejects the element.
fn parse_exchange_ts(element: &Map<String, Value>) -> Option<i64> {
    match element.get("ts") {
        None => Some(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        Some(_) => None,
    }
}

fn parse_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Levels arrive as `[price, size, liquidated_orders, order_count]`; malformed
/// entries are dropped one by one.
fn parse_levels(raw: Option<&Value>) -> Vec<BookLevel> {
    let Some(levels) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    levels
        .iter()
        .filter_map(|level| {
            let fields = level.as_array().filter(|f| f.len() >= 4)?;
            Some(BookLevel::new(
                parse_decimal(&fields[0])?,
                parse_decimal(&fields[1])?,
                parse_count(&fields[3])?,
            ))
        })
        .collect()
}

fn parse_trade(trade: &Map<String, Value>) -> Option<TradePrint> {
    let price = trade.get("px").and_then(parse_decimal)?;
    let size = trade.get("sz").and_then(parse_decimal)?;
    let side = trade.get("side").and_then(Value::as_str)?.to_string();
    let trade_id = match trade.get("tradeId") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    Some(TradePrint {
        price,
        size,
        side,
        trade_id,
    })
}
