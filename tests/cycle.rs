use async_trait::async_trait;
use candle_backfill::adapters::{Capability, ProviderAdapter};
use candle_backfill::config::{FetchPolicy, PipelineConfig, TimeframeTarget};
use candle_backfill::model::{Candle, FetchRequest, FetchResult, ProviderId, Timeframe};
use candle_backfill::orchestrator::Orchestrator;
use candle_backfill::store::CandleStore;
use rust_decimal_macros::dec;

/// Stand-in for a single real provider: always returns `bars_per_call`
/// aligned, ascending candles ending just before `to_timestamp` (or `now`
/// on the first, unanchored call).
struct FixedAdapter {
    capability: Capability,
    bars_per_call: u32,
}

#[async_trait]
impl ProviderAdapter for FixedAdapter {
    fn id(&self) -> ProviderId {
        "fixed"
    }

    fn capability(&self) -> &Capability {
        &self.capability
    }

    fn symbol_map(&self, symbol: &str) -> Option<String> {
        if symbol.is_empty() {
            None
        } else {
            Some(symbol.to_string())
        }
    }

    fn priority(&self, timeframe: Timeframe) -> Option<u8> {
        self.capability.supports(timeframe).then_some(0)
    }

    async fn fetch(&self, _client: &reqwest::Client, request: &FetchRequest) -> FetchResult {
        let interval = request.timeframe.seconds();
        let anchor = request
            .to_timestamp
            .unwrap_or_else(|| request.timeframe.align(10_000_000));
        let count = request.limit.min(self.bars_per_call);

        let mut candles = Vec::with_capacity(count as usize);
        for i in 0..count {
            let ts = request.timeframe.align(anchor) - interval * i64::from(i);
            candles.push(Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                ts,
                dec!(100),
                dec!(101),
                dec!(99),
                dec!(100),
                dec!(10),
                "fixed",
            ));
        }
        candles.sort_by_key(|c| c.timestamp);
        FetchResult::ok(candles, "fixed", 1)
    }
}

fn fast_policy() -> FetchPolicy {
    FetchPolicy {
        max_retries: 1,
        base_backoff_ms: 1,
        max_backoff_ms: 1,
        inter_call_delay_ms: 0,
        jitter: 0.0,
    }
}

/// Cold start: one pair, one provider, budgeted cycle.
#[tokio::test]
async fn cold_start_fills_target_horizon_in_one_call() {
    let registry: Vec<Box<dyn ProviderAdapter>> = vec![Box::new(FixedAdapter {
        capability: Capability {
            supported_timeframes: &[Timeframe::H1],
            max_candles_per_call: 1000,
            supports_to_timestamp: true,
            native_newest_first: false,
        },
        bars_per_call: 72,
    })];
    let store = CandleStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(registry, store);

    let config = PipelineConfig::new(
        vec!["BTC".to_string()],
        vec![TimeframeTarget::new(Timeframe::H1, 3)],
    )
    .with_fetch_policy(fast_policy())
    .with_max_calls_per_cycle(10);

    let report = orchestrator.run_cycle(&config).await.unwrap();

    assert_eq!(report.total_inserted, 72);
    assert_eq!(report.total_skipped, 0);
    assert_eq!(report.total_api_calls, 1);
    assert!(report.per_pair.iter().all(|(_, p)| p.errors.is_empty()));

    let coverage = orchestrator
        .store()
        .coverage("BTC", Timeframe::H1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coverage.candle_count, 72);
}

/// An unsupported symbol falls through without aborting the cycle,
/// and doesn't touch state for other (symbol, timeframe) pairs.
#[tokio::test]
async fn unsupported_symbol_is_a_pair_level_error_not_a_cycle_abort() {
    let registry: Vec<Box<dyn ProviderAdapter>> = vec![Box::new(FixedAdapter {
        capability: Capability {
            supported_timeframes: &[Timeframe::H1],
            max_candles_per_call: 1000,
            supports_to_timestamp: true,
            native_newest_first: false,
        },
        bars_per_call: 24,
    })];
    let store = CandleStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(registry, store);

    let config = PipelineConfig::new(
        vec!["BTC".to_string(), "".to_string()],
        vec![TimeframeTarget::new(Timeframe::H1, 1)],
    )
    .with_fetch_policy(fast_policy());

    let report = orchestrator.run_cycle(&config).await.unwrap();

    let btc_report = report
        .per_pair
        .iter()
        .find(|((s, _), _)| s == "BTC")
        .expect("BTC pair should be reported");
    assert!(btc_report.1.errors.is_empty());
    assert!(btc_report.1.inserted > 0);

    let unsupported_report = report
        .per_pair
        .iter()
        .find(|((s, _), _)| s.is_empty())
        .expect("unsupported pair should still be reported");
    assert!(!unsupported_report.1.errors.is_empty());
    assert_eq!(unsupported_report.1.inserted, 0);
}

/// Once coverage reaches the target horizon, a subsequent cycle
/// performs zero fetches for that pair.
#[tokio::test]
async fn completed_pair_requires_no_further_fetches() {
    let registry: Vec<Box<dyn ProviderAdapter>> = vec![Box::new(FixedAdapter {
        capability: Capability {
            supported_timeframes: &[Timeframe::H1],
            max_candles_per_call: 1000,
            supports_to_timestamp: true,
            native_newest_first: false,
        },
        bars_per_call: 24,
    })];
    let store = CandleStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(registry, store);

    let config = PipelineConfig::new(
        vec!["BTC".to_string()],
        vec![TimeframeTarget::new(Timeframe::H1, 1)],
    )
    .with_fetch_policy(fast_policy());

    // The planner's first window covers exactly `target_horizon/interval`
    // candles, which can land one interval short of the horizon boundary;
    // a second cycle closes that remainder before the pair latches complete.
    let mut report = orchestrator.run_cycle(&config).await.unwrap();
    let mut guard = 0;
    while !report.is_complete && guard < 5 {
        report = orchestrator.run_cycle(&config).await.unwrap();
        guard += 1;
    }
    assert!(report.is_complete);

    let next = orchestrator.run_cycle(&config).await.unwrap();
    assert_eq!(next.total_api_calls, 0);
    assert_eq!(next.total_inserted, 0);
    assert!(next.is_complete);
}
