/// Adaptateur D: couverture de symboles restreinte, pagination par curseur
/// `since` (pas de borne supérieure), ordre natif newest-first qu'il faut
/// inverser avant de retourner les bougies canoniques. C'est aussi
/// l'adaptateur de repli du planificateur quand aucun provider ne supporte
/// la pagination par borne supérieure pour la fenêtre demandée.
use super::{Capability, ProviderAdapter, classify_status};
use crate::model::{Candle, FetchRequest, FetchResult, Outcome, ProviderId, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

const PROVIDER: ProviderId = "kraken";
const BASE_URL: &str = "https://api.kraken.com/0/public/OHLC";

pub struct KrakenAdapter {
    capability: Capability,
}

impl KrakenAdapter {
    pub fn new() -> Self {
        KrakenAdapter {
            capability: Capability {
                supported_timeframes: &[
                    Timeframe::M1,
                    Timeframe::M5,
                    Timeframe::M15,
                    Timeframe::M30,
                    Timeframe::H1,
                    Timeframe::D1,
                ],
                max_candles_per_call: 720,
                supports_to_timestamp: false,
                native_newest_first: true,
            },
        }
    }

    /// Limited, hand-maintained symbol table: Kraken's native pair naming
    /// doesn't follow a mechanical transform, so unmapped symbols are
    /// rejected rather than guessed at.
    fn native_pair(symbol: &str) -> Option<&'static str> {
        match symbol.to_uppercase().as_str() {
            "BTC" => Some("XXBTZUSD"),
            "ETH" => Some("XETHZUSD"),
            "LTC" => Some("XLTCZUSD"),
            _ => None,
        }
    }

    fn interval_minutes(timeframe: Timeframe) -> i64 {
        match timeframe {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    error: Vec<String>,
    result: Option<HashMap<String, serde_json::Value>>,
}

#[async_trait]
impl ProviderAdapter for KrakenAdapter {
    fn id(&self) -> ProviderId {
        PROVIDER
    }

    fn capability(&self) -> &Capability {
        &self.capability
    }

    fn symbol_map(&self, symbol: &str) -> Option<String> {
        Self::native_pair(symbol).map(str::to_string)
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(30)
    }

    async fn fetch(&self, client: &reqwest::Client, request: &FetchRequest) -> FetchResult {
        let started = Instant::now();

        if !self.capability.supports(request.timeframe) {
            return FetchResult::terminal_error(PROVIDER, 0, "unsupported timeframe");
        }
        let native_pair = match self.symbol_map(&request.symbol) {
            Some(s) => s,
            None => return FetchResult::terminal_error(PROVIDER, 0, "symbol not mappable"),
        };

        let mut url = format!(
            "{}?pair={}&interval={}",
            BASE_URL,
            native_pair,
            Self::interval_minutes(request.timeframe)
        );
        // `since` is a lower-bound cursor, not an upper-bound anchor: Kraken
        // cannot page backward from an arbitrary `to_timestamp`, which is
        // why supports_to_timestamp is false for this adapter.
        if let Some(to_ts) = request.to_timestamp {
            let interval_secs = Self::interval_minutes(request.timeframe) * 60;
            let since = to_ts - interval_secs * i64::from(request.limit.min(self.capability.max_candles_per_call));
            url.push_str(&format!("&since={}", since.max(0)));
        }

        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                return FetchResult::rate_limited(
                    PROVIDER,
                    started.elapsed().as_millis() as u64,
                    format!("transport error: {e}"),
                );
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;

        if let Some(outcome) = classify_status(resp.status()) {
            let reason = format!("http {}", resp.status());
            return match outcome {
                Outcome::RateLimited => FetchResult::rate_limited(PROVIDER, latency_ms, reason),
                _ => FetchResult::terminal_error(PROVIDER, latency_ms, reason),
            };
        }

        let envelope: Envelope = match resp.json().await {
            Ok(e) => e,
            Err(e) => {
                return FetchResult::terminal_error(
                    PROVIDER,
                    latency_ms,
                    format!("schema violation: {e}"),
                );
            }
        };

        if !envelope.error.is_empty() {
            let joined = envelope.error.join("; ");
            return if joined.to_lowercase().contains("too many requests")
                || joined.to_lowercase().contains("busy")
            {
                FetchResult::rate_limited(PROVIDER, latency_ms, joined)
            } else {
                FetchResult::terminal_error(PROVIDER, latency_ms, joined)
            };
        }

        let raw_rows = match envelope
            .result
            .and_then(|mut m| m.remove(&native_pair))
            .and_then(|v| v.as_array().cloned())
        {
            Some(rows) => rows,
            None => return FetchResult::ok(Vec::new(), PROVIDER, latency_ms),
        };

        let mut candles = Vec::with_capacity(raw_rows.len());
        for row in &raw_rows {
            let get_str = |idx: usize| row.get(idx).and_then(|v| v.as_str());
            let time = match row.first().and_then(|v| v.as_i64()) {
                Some(t) => t,
                None => continue,
            };
            let (open, high, low, close, volume) = match (
                get_str(1).and_then(|s| Decimal::from_str(s).ok()),
                get_str(2).and_then(|s| Decimal::from_str(s).ok()),
                get_str(3).and_then(|s| Decimal::from_str(s).ok()),
                get_str(4).and_then(|s| Decimal::from_str(s).ok()),
                get_str(6).and_then(|s| Decimal::from_str(s).ok()),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
                _ => continue,
            };
            candles.push(Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                request.timeframe.align(time),
                open,
                high,
                low,
                close,
                volume,
                PROVIDER,
            ));
        }

        // Kraken returns newest-first; reverse to the canonical oldest-first order.
        candles.reverse();

        FetchResult::ok(candles, PROVIDER, latency_ms)
    }
}
