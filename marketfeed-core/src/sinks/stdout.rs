//! Console sink printing one compact line per event

use async_trait::async_trait;

use super::{EventSink, SinkResult};
use crate::exchanges::{CanonicalEvent, Payload};

#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }

    pub fn format_line(event: &CanonicalEvent) -> String {
        let latencies = format!(
            "Ex→Recv={}ms Recv→Decode={:.3}us Decode→Proc={:.3}us",
            event.exchange_to_recv_ms(),
            event.recv_to_decode_ns() as f64 / 1000.0,
            event.decode_to_proc_ns() as f64 / 1000.0,
        );
        match &event.payload {
            Payload::Book(book) => format!(
                "{} | bid={:.2} ask={:.2} spread={:.2} | {}",
                event.symbol,
                book.best_bid,
                book.best_ask,
                book.spread(),
                latencies
            ),
            Payload::Trade(trade) => format!(
                "{} | trade {} price={:.2} size={:.6} | {}",
                event.symbol, trade.side, trade.price, trade.size, latencies
            ),
        }
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&mut self, event: &CanonicalEvent) -> SinkResult<()> {
        println!("{}", Self::format_line(event));
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}
