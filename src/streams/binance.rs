//! Binance combined-stream ticker payloads

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::types::PriceTick;

pub const TICKER_EVENT: &str = "24hrTicker";

/// `{stream, data}` envelope of the combined-stream endpoint
#[derive(Debug, Deserialize)]
pub struct CombinedFrame {
    #[serde(default)]
    pub stream: String,
    pub data: Option<TickerPayload>,
}

#[derive(Debug, Deserialize)]
pub struct TickerPayload {
    #[serde(rename = "e", default)]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close: Option<String>,
    #[serde(rename = "v")]
    pub volume: Option<String>,
    #[serde(rename = "h")]
    pub high: Option<String>,
    #[serde(rename = "l")]
    pub low: Option<String>,
    #[serde(rename = "o")]
    pub open: Option<String>,
    #[serde(rename = "p")]
    pub price_change: Option<String>,
}

/// Outcome of decoding one upstream text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Tick(PriceTick),
    /// Not a ticker event, or no symbol: dropped silently
    Ignored,
    /// Corrupt payload: dropped with sampled logging
    Invalid(String),
}

pub fn decode_frame(text: &str) -> Decoded {
    let frame: CombinedFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return Decoded::Invalid(format!("unparsable frame: {e}")),
    };
    let Some(payload) = frame.data else {
        return Decoded::Ignored;
    };
    if payload.event_type != TICKER_EVENT || payload.symbol.is_empty() {
        return Decoded::Ignored;
    }

    let price = match parse_decimal(payload.close.as_deref()) {
        Some(p) if p > Decimal::ZERO => p,
        _ => return Decoded::Invalid(format!("bad price {:?} for {}", payload.close, payload.symbol)),
    };
    let volume = match parse_decimal(payload.volume.as_deref()) {
        Some(v) if v >= Decimal::ZERO => v,
        _ => return Decoded::Invalid(format!("bad volume {:?} for {}", payload.volume, payload.symbol)),
    };
    let Some(event_time) = Utc.timestamp_millis_opt(payload.event_time).single() else {
        return Decoded::Invalid(format!("bad event time {}", payload.event_time));
    };

    match PriceTick::new(payload.symbol, price, volume, event_time) {
        Ok(tick) => Decoded::Tick(tick),
        Err(e) => Decoded::Invalid(e.to_string()),
    }
}

fn parse_decimal(raw: Option<&str>) -> Option<Decimal> {
    raw.and_then(|s| Decimal::from_str(s.trim()).ok())
}
