/// Adaptateur A: provider primaire nécessitant un credential API.
///
/// Supporte 1m/1h/1d avec pagination par borne supérieure (`time_end`) et un
/// plafond de 2000 bougies par appel. Préféré pour les trois timeframes
/// qu'il couvre (priorité 0).
use super::{Capability, ProviderAdapter, classify_status};
use crate::model::{Candle, FetchRequest, FetchResult, Outcome, ProviderId, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;

const PROVIDER: ProviderId = "coinapi";
const BASE_URL: &str = "https://rest.coinapi.io/v1/ohlcv";

pub struct CoinApiAdapter {
    api_key: String,
    capability: Capability,
}

impl CoinApiAdapter {
    pub fn new(api_key: String) -> Self {
        CoinApiAdapter {
            api_key,
            capability: Capability {
                supported_timeframes: &[Timeframe::M1, Timeframe::H1, Timeframe::D1],
                max_candles_per_call: 2000,
                supports_to_timestamp: true,
                native_newest_first: false,
            },
        }
    }

    fn period_id(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1MIN",
            Timeframe::H1 => "1HRS",
            Timeframe::D1 => "1DAY",
            _ => unreachable!("capability gates unsupported timeframes"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Bar {
    time_period_start: String,
    price_open: String,
    price_high: String,
    price_low: String,
    price_close: String,
    volume_traded: String,
}

#[async_trait]
impl ProviderAdapter for CoinApiAdapter {
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
            Some(format!("BINANCE_SPOT_{}_USD", symbol.to_uppercase()))
        }
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(0)
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
        if self.api_key.is_empty() {
            return FetchResult::terminal_error(PROVIDER, 0, "missing API credential");
        }

        let limit = request.limit.min(self.capability.max_candles_per_call);
        let mut url = format!(
            "{}/{}/history?period_id={}&limit={}",
            BASE_URL,
            native_symbol,
            Self::period_id(request.timeframe),
            limit
        );
        if let Some(to_ts) = request.to_timestamp {
            if let Some(dt) = DateTime::<Utc>::from_timestamp(to_ts, 0) {
                url.push_str(&format!("&time_end={}", dt.to_rfc3339()));
            }
        }

        let resp = match client.get(&url).header("X-CoinAPI-Key", &self.api_key).send().await {
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

        let bars: Vec<Bar> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                return FetchResult::terminal_error(
                    PROVIDER,
                    latency_ms,
                    format!("schema violation: {e}"),
                );
            }
        };

        if bars.is_empty() {
            return FetchResult::ok(Vec::new(), PROVIDER, latency_ms);
        }

        let mut candles = Vec::with_capacity(bars.len());
        for bar in &bars {
            let timestamp = match DateTime::parse_from_rfc3339(&bar.time_period_start) {
                Ok(dt) => request.timeframe.align(dt.timestamp()),
                Err(_) => continue,
            };
            let (open, high, low, close, volume) = match (
                Decimal::from_str(&bar.price_open),
                Decimal::from_str(&bar.price_high),
                Decimal::from_str(&bar.price_low),
                Decimal::from_str(&bar.price_close),
                Decimal::from_str(&bar.volume_traded),
            ) {
                (Ok(o), Ok(h), Ok(l), Ok(c), Ok(v)) => (o, h, l, c, v),
                _ => continue,
            };
            candles.push(Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                timestamp,
                open,
                high,
                low,
                close,
                volume,
                PROVIDER,
            ));
        }

        // CoinAPI returns ascending (oldest-first) order natively.
        FetchResult::ok(candles, PROVIDER, latency_ms)
    }
}
