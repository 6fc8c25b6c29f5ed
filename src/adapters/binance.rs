/// Adaptateur C: pagination par fenêtre temporelle (`startTime`/`endTime`),
/// plafond de 1000 bougies par appel, convention de paire `{SYMBOL}USDT`.
use super::{Capability, ProviderAdapter, classify_status};
use crate::model::{Candle, FetchRequest, FetchResult, Outcome, ProviderId, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;

const PROVIDER: ProviderId = "binance";
const BASE_URL: &str = "https://api.binance.com/api/v3/klines";

pub struct BinanceAdapter {
    capability: Capability,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        BinanceAdapter {
            capability: Capability {
                supported_timeframes: &[
                    Timeframe::M1,
                    Timeframe::M5,
                    Timeframe::M15,
                    Timeframe::M30,
                    Timeframe::H1,
                ],
                max_candles_per_call: 1000,
                supports_to_timestamp: true,
                native_newest_first: false,
            },
        }
    }
}

/// Chaque kline Binance est un tableau hétérogène:
/// [openTime, open, high, low, close, volume, closeTime, ...]
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BinanceResponse {
    Klines(Vec<Vec<serde_json::Value>>),
    Error { code: i64, msg: String },
}

#[async_trait]
impl ProviderAdapter for BinanceAdapter {
    fn id(&self) -> ProviderId {
        PROVIDER
    }

    fn capability(&self) -> &Capability {
        &self.capability
    }

    fn symbol_map(&self, symbol: &str) -> Option<String> {
        if symbol.is_empty() {
            None
        } else {
            Some(format!("{}USDT", symbol.to_uppercase()))
        }
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(20)
    }

    async fn fetch(&self, client: &reqwest::Client, request: &FetchRequest) -> FetchResult {
        let started = Instant::now();

        if !self.capability.supports(request.timeframe) {
            return FetchResult::terminal_error(PROVIDER, 0, "unsupported timeframe");
        }
        let native_symbol = match self.symbol_map(&request.symbol) {
            Some(s) => s,
            None => return FetchResult::terminal_error(PROVIDER, 0, "symbol not mappable"),
        };

        let limit = request.limit.min(self.capability.max_candles_per_call);
        let mut url = format!(
            "{}?symbol={}&interval={}&limit={}",
            BASE_URL,
            native_symbol,
            request.timeframe.as_str(),
            limit
        );
        if let Some(to_ts) = request.to_timestamp {
            url.push_str(&format!("&endTime={}", to_ts * 1000));
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

        let body: BinanceResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                return FetchResult::terminal_error(
                    PROVIDER,
                    latency_ms,
                    format!("schema violation: {e}"),
                );
            }
        };

        let rows = match body {
            BinanceResponse::Klines(rows) => rows,
            BinanceResponse::Error { code, msg } => {
                return FetchResult::terminal_error(PROVIDER, latency_ms, format!("{code}: {msg}"));
            }
        };

        if rows.is_empty() {
            return FetchResult::ok(Vec::new(), PROVIDER, latency_ms);
        }

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let open_time_ms = match row.first().and_then(|v| v.as_i64()) {
                Some(t) => t,
                None => continue,
            };
            let get_str = |idx: usize| row.get(idx).and_then(|v| v.as_str());
            let (open, high, low, close, volume) = match (
                get_str(1).and_then(|s| Decimal::from_str(s).ok()),
                get_str(2).and_then(|s| Decimal::from_str(s).ok()),
                get_str(3).and_then(|s| Decimal::from_str(s).ok()),
                get_str(4).and_then(|s| Decimal::from_str(s).ok()),
                get_str(5).and_then(|s| Decimal::from_str(s).ok()),
            ) {
                (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
                _ => continue,
            };
            candles.push(Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                request.timeframe.align(open_time_ms / 1000),
                open,
                high,
                low,
                close,
                volume,
                PROVIDER,
            ));
        }

        // Binance klines are already returned oldest-first.
        FetchResult::ok(candles, PROVIDER, latency_ms)
    }
}
