/// Adaptateur B: couvre 1h/1d via un seul appel par fenêtre, sans
/// pagination historique au-delà de la fenêtre initiale.
///
/// Le volume est exposé à la fois en devise de cotation (`volumeto`) et en
/// devise de base (`volumefrom`); on préfère `volumeto`, repli sur
/// `volumefrom` s'il est nul.
/// L'enveloppe de réponse porte un champ `Response` distinct du code HTTP,
/// que cet adaptateur doit inspecter pour détecter une erreur applicative.
use super::{Capability, ProviderAdapter, classify_status};
use crate::model::{Candle, FetchRequest, FetchResult, Outcome, ProviderId, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;

const PROVIDER: ProviderId = "cryptocompare";
const BASE_URL: &str = "https://min-api.cryptocompare.com/data/v2";

pub struct CryptoCompareAdapter {
    capability: Capability,
}

impl CryptoCompareAdapter {
    pub fn new() -> Self {
        CryptoCompareAdapter {
            capability: Capability {
                supported_timeframes: &[Timeframe::H1, Timeframe::D1],
                // Daily windows cap at 365 points per call; see max_for_timeframe
                // for the tighter 90-day (2160 hour) cap used on hourly requests.
                max_candles_per_call: 365,
                supports_to_timestamp: false,
                native_newest_first: false,
            },
        }
    }

    fn max_for_timeframe(timeframe: Timeframe) -> u32 {
        match timeframe {
            Timeframe::H1 => 90 * 24,
            Timeframe::D1 => 365,
            _ => unreachable!("capability gates unsupported timeframes"),
        }
    }

    fn endpoint(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::H1 => "histohour",
            Timeframe::D1 => "histoday",
            _ => unreachable!("capability gates unsupported timeframes"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: String,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "Data")]
    data: Option<DataWrapper>,
}

#[derive(Debug, Deserialize)]
struct DataWrapper {
    #[serde(rename = "Data")]
    data: Vec<Bar>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    time: i64,
    open: serde_json::Number,
    high: serde_json::Number,
    low: serde_json::Number,
    close: serde_json::Number,
    volumefrom: serde_json::Number,
    volumeto: serde_json::Number,
}

#[async_trait]
impl ProviderAdapter for CryptoCompareAdapter {
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
            Some(symbol.to_uppercase())
        }
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(10)
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

        let limit = request
            .limit
            .min(Self::max_for_timeframe(request.timeframe));
        let mut url = format!(
            "{}/{}?fsym={}&tsym=USD&limit={}",
            BASE_URL,
            Self::endpoint(request.timeframe),
            native_symbol,
            limit.saturating_sub(1),
        );
        if let Some(to_ts) = request.to_timestamp {
            url.push_str(&format!("&toTs={}", to_ts));
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

        if envelope.response != "Success" {
            return FetchResult::terminal_error(
                PROVIDER,
                latency_ms,
                envelope
                    .message
                    .unwrap_or_else(|| "envelope reported non-Success Response".to_string()),
            );
        }

        let bars = envelope.data.map(|d| d.data).unwrap_or_default();
        if bars.is_empty() {
            return FetchResult::ok(Vec::new(), PROVIDER, latency_ms);
        }

        let mut candles = Vec::with_capacity(bars.len());
        for bar in &bars {
            let (open, high, low, close, volumefrom, volumeto) = match (
                Decimal::from_str(bar.open.as_str()),
                Decimal::from_str(bar.high.as_str()),
                Decimal::from_str(bar.low.as_str()),
                Decimal::from_str(bar.close.as_str()),
                Decimal::from_str(bar.volumefrom.as_str()),
                Decimal::from_str(bar.volumeto.as_str()),
            ) {
                (Ok(o), Ok(h), Ok(l), Ok(c), Ok(vf), Ok(vt)) => (o, h, l, c, vf, vt),
                _ => continue,
            };
            // volumeto (quote currency) preferred over volumefrom (base currency).
            let volume = if volumeto > Decimal::ZERO {
                volumeto
            } else {
                volumefrom
            };
            candles.push(Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                request.timeframe.align(bar.time),
                open,
                high,
                low,
                close,
                volume,
                PROVIDER,
            ));
        }

        // CryptoCompare's histo* endpoints return ascending (oldest-first) order natively.
        FetchResult::ok(candles, PROVIDER, latency_ms)
    }
}
