/// Backfill Orchestrator (C5)
///
/// Boucle de cycle: pour chaque (symbol, timeframe) déclaré, consulte le
/// planificateur, invoque le fetcher, filtre et merge dans le store, puis
/// passe à la paire suivante sans jamais laisser une panne de provider
/// interrompre le cycle entier.
use crate::adapters::ProviderAdapter;
use crate::config::PipelineConfig;
use crate::model::{CycleReport, Outcome, PairReport, Timeframe};
use crate::planner;
use crate::store::CandleStore;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::time::Instant;

pub struct Orchestrator {
    registry: Vec<Box<dyn ProviderAdapter>>,
    client: reqwest::Client,
    store: CandleStore,
}

impl Orchestrator {
    pub fn new(registry: Vec<Box<dyn ProviderAdapter>>, store: CandleStore) -> Self {
        Orchestrator {
            registry,
            client: reqwest::Client::new(),
            store,
        }
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    /// Exécute un cycle complet. Les paires sont regroupées par adaptateur
    /// choisi: un groupe de tâches par provider serialise ses propres appels
    /// (respecte `inter_call_delay_ms`), les providers distincts tournent en
    /// parallèle via `join_all`.
    pub async fn run_cycle(&self, config: &PipelineConfig) -> crate::error::Result<CycleReport> {
        config.validate()?;

        let started = Instant::now();
        let now = now_unix();

        let mut groups: HashMap<&'static str, Vec<(String, Timeframe, i64)>> = HashMap::new();
        let mut immediately_complete: Vec<(String, Timeframe)> = Vec::new();
        let mut unsupported: Vec<((String, Timeframe), String)> = Vec::new();

        for symbol in &config.symbols {
            for target in &config.timeframes {
                let coverage = self.store.coverage(symbol, target.timeframe).await?;
                let planned = planner::next_window(
                    &self.registry,
                    symbol,
                    target.timeframe,
                    target.target_horizon_secs(),
                    now,
                    coverage.as_ref(),
                );
                match planned {
                    Some(p) => {
                        groups
                            .entry(p.adapter_id)
                            .or_default()
                            .push((symbol.clone(), target.timeframe, target.target_horizon_secs()));
                    }
                    None if coverage.is_some() => {
                        immediately_complete.push((symbol.clone(), target.timeframe));
                    }
                    None => {
                        unsupported.push((
                            (symbol.clone(), target.timeframe),
                            "no adapter resolves this symbol/timeframe".to_string(),
                        ));
                    }
                }
            }
        }

        let calls_budget = std::sync::atomic::AtomicU32::new(config.max_calls_per_cycle);
        let deadline_ms = config.cycle_budget_ms;

        let tasks = groups.into_iter().map(|(adapter_id, pairs)| {
            self.run_provider_group(adapter_id, pairs, config, started, deadline_ms, &calls_budget)
        });

        let per_provider_reports = join_all(tasks).await;

        let mut report = CycleReport::default();
        for pair_reports in per_provider_reports {
            for (key, pair_report) in pair_reports {
                report.total_inserted += pair_report.inserted;
                report.total_skipped += pair_report.skipped;
                report.total_api_calls += pair_report.api_calls;
                report.total_rate_limit_events += pair_report.rate_limit_events;
                report.per_pair.push((key, pair_report));
            }
        }
        for (key, _) in &immediately_complete {
            report.per_pair.push((
                key.clone(),
                PairReport {
                    complete: true,
                    ..Default::default()
                },
            ));
        }
        for (key, reason) in unsupported {
            report.per_pair.push((
                key,
                PairReport {
                    errors: vec![reason],
                    complete: false,
                    ..Default::default()
                },
            ));
        }

        report.wall_duration_ms = started.elapsed().as_millis() as u64;
        report.is_complete = self.evaluate_global_completeness(config, now).await?;

        Ok(report)
    }

    /// Une tâche par provider: sérialise ses propres paires (le fetcher
    /// impose déjà `inter_call_delay_ms` entre deux appels au même
    /// adaptateur), continue sur erreur de provider sans jamais abandonner
    /// le cycle.
    async fn run_provider_group(
        &self,
        adapter_id: &'static str,
        pairs: Vec<(String, Timeframe, i64)>,
        config: &PipelineConfig,
        started: Instant,
        deadline_ms: u64,
        calls_budget: &std::sync::atomic::AtomicU32,
    ) -> Vec<((String, Timeframe), PairReport)> {
        let adapter = self
            .registry
            .iter()
            .find(|a| a.id() == adapter_id)
            .expect("group key is always a registered adapter id");

        let mut results = Vec::with_capacity(pairs.len());

        for (symbol, timeframe, target_horizon) in pairs {
            if started.elapsed().as_millis() as u64 >= deadline_ms {
                break;
            }
            if calls_budget.load(std::sync::atomic::Ordering::Relaxed) == 0 {
                break;
            }

            let mut pair_report = PairReport::default();
            let now = now_unix();

            let coverage = match self.store.coverage(&symbol, timeframe).await {
                Ok(c) => c,
                Err(e) => {
                    pair_report.errors.push(e.to_string());
                    results.push(((symbol, timeframe), pair_report));
                    continue;
                }
            };

            let planned = planner::next_window(
                &self.registry,
                &symbol,
                timeframe,
                target_horizon,
                now,
                coverage.as_ref(),
            );
            let Some(planned) = planned else {
                pair_report.complete = true;
                results.push(((symbol, timeframe), pair_report));
                continue;
            };

            calls_budget.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            pair_report.api_calls += 1;

            let invoked = crate::fetcher::invoke(
                adapter.as_ref(),
                &self.client,
                &planned.request,
                &config.fetch_policy,
            )
            .await;

            pair_report.rate_limit_events += invoked.rate_limit_events;

            match invoked.result.outcome {
                Outcome::RateLimited | Outcome::TerminalError => {
                    let reason = invoked
                        .result
                        .reason
                        .unwrap_or_else(|| "unspecified provider failure".to_string());
                    pair_report.errors.push(format!("{adapter_id}: {reason}"));
                    results.push(((symbol, timeframe), pair_report));
                    continue;
                }
                Outcome::Empty => {
                    if coverage.is_some() {
                        pair_report
                            .errors
                            .push(format!("{adapter_id}: source exhausted at this provider"));
                    }
                    results.push(((symbol, timeframe), pair_report));
                    continue;
                }
                Outcome::Ok => {}
            }

            let oldest_bound = coverage.map(|c| c.oldest_timestamp);
            let candles: Vec<_> = invoked
                .result
                .candles
                .into_iter()
                .filter(|c| oldest_bound.map(|bound| c.timestamp < bound).unwrap_or(true))
                .collect();

            match self
                .store
                .merge(&symbol, timeframe, &candles, config.batch_size)
                .await
            {
                Ok((outcome, rejected)) => {
                    pair_report.inserted += outcome.inserted;
                    pair_report.skipped += outcome.skipped;
                    for r in rejected {
                        pair_report
                            .errors
                            .push(format!("rejected candle at {}: {}", r.timestamp, r.reason));
                    }
                }
                Err(e) => pair_report.errors.push(e.to_string()),
            }

            results.push(((symbol, timeframe), pair_report));
        }

        results
    }

    async fn evaluate_global_completeness(
        &self,
        config: &PipelineConfig,
        now: i64,
    ) -> crate::error::Result<bool> {
        for symbol in &config.symbols {
            for target in &config.timeframes {
                let coverage = self.store.coverage(symbol, target.timeframe).await?;
                let complete = coverage
                    .map(|c| c.oldest_timestamp <= now - target.target_horizon_secs())
                    .unwrap_or(false);
                if !complete {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeframeTarget;
    use crate::model::{Candle, FetchRequest, FetchResult, ProviderId};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OneShotAdapter {
        capability: crate::adapters::Capability,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for OneShotAdapter {
        fn id(&self) -> ProviderId {
            "oneshot"
        }
        fn capability(&self) -> &crate::adapters::Capability {
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            let candle = Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                request.timeframe.align(request.to_timestamp.unwrap_or(7_200)),
                dec!(100),
                dec!(101),
                dec!(99),
                dec!(100),
                dec!(5),
                "oneshot",
            );
            FetchResult::ok(vec![candle], "oneshot", 1)
        }
    }

    fn registry() -> Vec<Box<dyn ProviderAdapter>> {
        vec![Box::new(OneShotAdapter {
            capability: crate::adapters::Capability {
                supported_timeframes: &[Timeframe::H1],
                max_candles_per_call: 100,
                supports_to_timestamp: true,
                native_newest_first: false,
            },
            calls: AtomicU32::new(0),
        })]
    }

    #[tokio::test]
    async fn cycle_inserts_and_reports_incomplete_for_short_history() {
        let store = CandleStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(registry(), store);
        let config = PipelineConfig::new(
            vec!["BTC".to_string()],
            vec![TimeframeTarget::new(Timeframe::H1, 730)],
        )
        .with_fetch_policy(crate::config::FetchPolicy {
            max_retries: 1,
            base_backoff_ms: 1,
            max_backoff_ms: 1,
            inter_call_delay_ms: 0,
            jitter: 0.0,
        });

        let report = orchestrator.run_cycle(&config).await.unwrap();
        assert_eq!(report.total_inserted, 1);
        assert!(!report.is_complete);
        assert_eq!(report.per_pair.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_symbol_is_reported_as_pair_error_not_fatal() {
        let store = CandleStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(registry(), store);
        let config = PipelineConfig::new(
            vec!["".to_string()],
            vec![TimeframeTarget::new(Timeframe::H1, 730)],
        );

        let report = orchestrator.run_cycle(&config).await.unwrap();
        assert_eq!(report.per_pair.len(), 1);
        assert!(!report.per_pair[0].1.errors.is_empty());
    }

    struct FlakyThenOkAdapter {
        capability: crate::adapters::Capability,
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyThenOkAdapter {
        fn id(&self) -> ProviderId {
            "flaky"
        }
        fn capability(&self) -> &crate::adapters::Capability {
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
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return FetchResult::rate_limited("flaky", 1, "simulated 429");
            }
            let candle = Candle::from_observation(
                request.symbol.clone(),
                request.timeframe,
                request.timeframe.align(request.to_timestamp.unwrap_or(7_200)),
                dec!(100),
                dec!(101),
                dec!(99),
                dec!(100),
                dec!(5),
                "flaky",
            );
            FetchResult::ok(vec![candle], "flaky", 1)
        }
    }

    /// Scenario C: two `rate_limited` outcomes before a third, successful
    /// attempt must still surface as exactly 2 rate-limit events in the
    /// Cycle Report, even though `api_calls` only counts the one logical call.
    #[tokio::test]
    async fn rate_limit_events_survive_into_the_cycle_report() {
        let registry: Vec<Box<dyn ProviderAdapter>> = vec![Box::new(FlakyThenOkAdapter {
            capability: crate::adapters::Capability {
                supported_timeframes: &[Timeframe::H1],
                max_candles_per_call: 100,
                supports_to_timestamp: true,
                native_newest_first: false,
            },
            fail_times: 2,
            calls: AtomicU32::new(0),
        })];
        let store = CandleStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(registry, store);
        let config = PipelineConfig::new(
            vec!["BTC".to_string()],
            vec![TimeframeTarget::new(Timeframe::H1, 730)],
        )
        .with_fetch_policy(crate::config::FetchPolicy {
            max_retries: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 1,
            inter_call_delay_ms: 0,
            jitter: 0.0,
        });

        let report = orchestrator.run_cycle(&config).await.unwrap();
        assert_eq!(report.total_api_calls, 1);
        assert_eq!(report.total_rate_limit_events, 2);
        assert_eq!(report.per_pair[0].1.rate_limit_events, 2);
    }

    #[tokio::test]
    async fn empty_symbols_list_is_fatal_configuration_error() {
        let store = CandleStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(registry(), store);
        let config = PipelineConfig::new(vec![], vec![TimeframeTarget::new(Timeframe::H1, 730)]);

        let result = orchestrator.run_cycle(&config).await;
        assert!(matches!(
            result,
            Err(crate::error::PipelineError::Configuration(_))
        ));
    }
}
