//! OKX public WebSocket protocol details

use serde::Serialize;

use super::errors::FeedResult;

pub const DEFAULT_PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub const CHANNEL_BOOKS5: &str = "books5";
pub const CHANNEL_BBO_TBT: &str = "bbo-tbt";
pub const CHANNEL_TRADES: &str = "trades";

pub const EVENT_TYPE_BOOK_TOPN: &str = "book_topn";
pub const EVENT_TYPE_TRADE: &str = "trade";

/// How a channel's data elements are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Top-N book snapshot with the given depth
    BookSnapshot { depth: usize },
    /// Public trade prints
    Trades,
}

impl ChannelKind {
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            CHANNEL_BOOKS5 => Some(Self::BookSnapshot { depth: 5 }),
            CHANNEL_BBO_TBT => Some(Self::BookSnapshot { depth: 1 }),
            CHANNEL_TRADES => Some(Self::Trades),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionArg<'a> {
    channel: &'a str,
    #[serde(rename = "instId")]
    inst_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    op: &'static str,
    args: Vec<SubscriptionArg<'a>>,
}

/// Build the subscribe request covering every symbol x channel pair.
pub fn subscription_message(symbols: &[String], channels: &[String]) -> FeedResult<String> {
    let args = symbols
        .iter()
        .flat_map(|symbol| {
            channels.iter().map(move |channel| SubscriptionArg {
                channel,
                inst_id: symbol,
            })
        })
        .collect();

    let request = SubscriptionRequest {
        op: "subscribe",
        args,
    };
    Ok(serde_json::to_string(&request)?)
}
