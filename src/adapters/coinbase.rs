/// Adaptateur E: granularité exprimée en secondes, convention de paire
/// `{SYMBOL}-USD`, plafond de 300 bougies par appel.
use super::{Capability, ProviderAdapter, classify_status};
use crate::model::{Candle, FetchRequest, FetchResult, Outcome, ProviderId, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;

const PROVIDER: ProviderId = "coinbase";
const BASE_URL: &str = "https://api.exchange.coinbase.com/products";

pub struct CoinbaseAdapter {
    capability: Capability,
}

impl CoinbaseAdapter {
    pub fn new() -> Self {
        CoinbaseAdapter {
            capability: Capability {
                supported_timeframes: &[Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1],
                max_candles_per_call: 300,
                supports_to_timestamp: true,
                native_newest_first: true,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoinbaseResponse {
    Candles(Vec<Vec<serde_json::Number>>),
    Error { message: String },
}

#[async_trait]
impl ProviderAdapter for CoinbaseAdapter {
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
            Some(format!("{}-USD", symbol.to_uppercase()))
        }
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(40)
    }

    async fn fetch(&self, client: &reqwest::Client, request: &FetchRequest) -> FetchResult {
        let started = Instant::now();

        if !self.capability.supports(request.timeframe) {
            return FetchResult::terminal_error(PROVIDER, 0, "unsupported timeframe");
        }
        let native_product = match self.symbol_map(&request.symbol) {
            Some(s) => s,
            None => return FetchResult::terminal_error(PROVIDER, 0, "symbol not mappable"),
        };

        let granularity = request.timeframe.seconds();
        let limit = request.limit.min(self.capability.max_candles_per_call);
        let end_ts = request.to_timestamp.unwrap_or_else(|| Utc::now().timestamp());
        let start_ts = end_ts - granularity * i64::from(limit);

        let start_iso = DateTime::<Utc>::from_timestamp(start_ts, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let end_iso = DateTime::<Utc>::from_timestamp(end_ts, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        let url = format!(
            "{}/{}/candles?granularity={}&start={}&end={}",
            BASE_URL, native_product, granularity, start_iso, end_iso
        );

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

        let body: CoinbaseResponse = match resp.json().await {
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
            CoinbaseResponse::Candles(rows) => rows,
            CoinbaseResponse::Error { message } => {
                return FetchResult::terminal_error(PROVIDER, latency_ms, message);
            }
        };

        if rows.is_empty() {
            return FetchResult::ok(Vec::new(), PROVIDER, latency_ms);
        }

        // Row layout: [time, low, high, open, close, volume]
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            if row.len() < 6 {
                continue;
            }
            let time = match row[0].as_i64() {
                Some(t) => t,
                None => continue,
            };
            let (open, high, low, close, volume) = match (
                Decimal::from_str(row[3].as_str()),
                Decimal::from_str(row[2].as_str()),
                Decimal::from_str(row[1].as_str()),
                Decimal::from_str(row[4].as_str()),
                Decimal::from_str(row[5].as_str()),
            ) {
                (Ok(o), Ok(h), Ok(l), Ok(c), Ok(v)) => (o, h, l, c, v),
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

        // The exchange returns candles newest-first; sort to canonical oldest-first.
        candles.sort_by_key(|c| c.timestamp);

        FetchResult::ok(candles, PROVIDER, latency_ms)
    }
}
