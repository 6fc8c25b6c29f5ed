/// Coverage Planner (C4)
///
/// Décide quelle fenêtre demander ensuite pour un (symbol, timeframe), en ne
/// consultant que la Coverage Record matérialisée (O(1), jamais un scan de
/// `candles`). Ne fait aucun appel réseau lui-même.
use crate::adapters::ProviderAdapter;
use crate::model::{CoverageRecord, FetchRequest, Timeframe};

/// Une fenêtre à récupérer, accompagnée de l'identifiant de l'adaptateur
/// choisi pour la servir.
pub struct PlannedFetch {
    pub adapter_id: &'static str,
    pub request: FetchRequest,
}

/// Calcule la prochaine fenêtre à récupérer pour `(symbol, timeframe)`, ou
/// `None` si la paire est déjà complète pour `target_horizon_secs`.
pub fn next_window(
    registry: &[Box<dyn ProviderAdapter>],
    symbol: &str,
    timeframe: Timeframe,
    target_horizon_secs: i64,
    now: i64,
    coverage: Option<&CoverageRecord>,
) -> Option<PlannedFetch> {
    let target_oldest = now - target_horizon_secs;
    let interval = timeframe.seconds();

    let (mut to_timestamp, mut candles_needed): (Option<i64>, u32) = match coverage {
        None => {
            let candles_to_fill_target = (target_horizon_secs / interval).max(1) as u32;
            (None, candles_to_fill_target)
        }
        Some(record) => {
            if record.oldest_timestamp <= target_oldest {
                return None;
            }
            let span = record.oldest_timestamp - target_oldest;
            let candles_from_target_oldest_to_oldest = (span / interval).max(1) as u32;
            (Some(record.oldest_timestamp - 1), candles_from_target_oldest_to_oldest)
        }
    };

    let wants_upper_bound = to_timestamp.is_some();

    let mut candidates: Vec<&Box<dyn ProviderAdapter>> = registry
        .iter()
        .filter(|a| a.priority(timeframe).is_some() && a.symbol_map(symbol).is_some())
        .collect();
    candidates.sort_by_key(|a| (a.priority(timeframe).unwrap(), a.id()));

    // Primary choice: the first (by priority, then id) candidate that can
    // serve this window directly — any candidate at all when no upper bound
    // is needed, or one that supports upper-bound paging when it is.
    let paging_candidate = candidates
        .iter()
        .find(|a| !wants_upper_bound || a.capability().supports_to_timestamp);

    // No candidate supports upper-bound paging for a continuation window:
    // fall back to a newest-first adapter (§4.4 step 6), clamping the limit
    // so the fetch is guaranteed to reach past the current oldest coverage.
    let (chosen, is_newest_first_fallback) = match paging_candidate {
        Some(a) => (Some(a), false),
        None if wants_upper_bound => (
            candidates
                .iter()
                .find(|a| a.capability().native_newest_first)
                .or_else(|| candidates.first()),
            true,
        ),
        None => (candidates.first(), false),
    };

    let adapter = chosen?;

    if is_newest_first_fallback {
        if let Some(record) = coverage {
            // This adapter can only page from "now" backward by count, not
            // from an arbitrary upper bound, so anchor there instead and
            // request enough bars that its oldest returned candle precedes
            // the existing coverage.
            let span_to_oldest = (now - record.oldest_timestamp).max(interval);
            candles_needed = (span_to_oldest / interval + 1) as u32;
        }
        to_timestamp = None;
    }

    let limit = candles_needed.min(adapter.capability().max_candles_per_call);

    Some(PlannedFetch {
        adapter_id: adapter.id(),
        request: FetchRequest {
            provider: adapter.id(),
            symbol: symbol.to_string(),
            timeframe,
            limit,
            to_timestamp,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_registry, Capability};
    use crate::model::{FetchResult, ProviderId};
    use async_trait::async_trait;

    const DAY: i64 = 86_400;

    /// Fixture adapter whose only relevant trait is `supports_to_timestamp`/
    /// `native_newest_first`; `fetch` is never exercised by planner tests.
    struct NoPagingAdapter {
        id: &'static str,
        capability: Capability,
    }

    #[async_trait]
    impl ProviderAdapter for NoPagingAdapter {
        fn id(&self) -> ProviderId {
            self.id
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
        async fn fetch(&self, _client: &reqwest::Client, _request: &FetchRequest) -> FetchResult {
            unimplemented!("planner tests never invoke fetch")
        }
    }

    #[test]
    fn cold_start_anchors_at_now_with_no_upper_bound_preference() {
        let registry = build_registry("test-key");
        let planned = next_window(&registry, "BTC", Timeframe::H1, 730 * DAY, 10_000_000, None)
            .expect("cold start should always produce a request");
        assert!(planned.request.to_timestamp.is_none());
        assert!(planned.request.limit > 0);
    }

    #[test]
    fn complete_coverage_returns_none() {
        let registry = build_registry("test-key");
        let now = 10_000_000;
        let coverage = CoverageRecord {
            oldest_timestamp: now - 800 * DAY,
            newest_timestamp: now,
            candle_count: 1000,
            last_updated: now,
        };
        let planned = next_window(&registry, "BTC", Timeframe::H1, 730 * DAY, now, Some(&coverage));
        assert!(planned.is_none());
    }

    #[test]
    fn partial_coverage_anchors_just_before_oldest() {
        let registry = build_registry("test-key");
        let now = 10_000_000;
        let coverage = CoverageRecord {
            oldest_timestamp: now - 100 * DAY,
            newest_timestamp: now,
            candle_count: 500,
            last_updated: now,
        };
        let planned = next_window(&registry, "BTC", Timeframe::H1, 730 * DAY, now, Some(&coverage))
            .expect("partial coverage should request more");
        assert_eq!(planned.request.to_timestamp, Some(coverage.oldest_timestamp - 1));
    }

    #[test]
    fn unsupported_symbol_yields_no_candidate() {
        let registry = build_registry("test-key");
        let planned = next_window(&registry, "", Timeframe::H1, 730 * DAY, 10_000_000, None);
        assert!(planned.is_none());
    }

    #[test]
    fn tie_break_prefers_lowest_priority_then_lexicographic_id() {
        let registry = build_registry("test-key");
        let planned = next_window(&registry, "BTC", Timeframe::H1, 730 * DAY, 10_000_000, None)
            .expect("should plan a fetch");
        // coinapi has priority 0 and is alphabetically first among equals.
        assert_eq!(planned.adapter_id, "coinapi");
    }

    #[test]
    fn continuation_falls_back_to_newest_first_adapter_when_none_page_by_upper_bound() {
        let registry: Vec<Box<dyn ProviderAdapter>> = vec![
            Box::new(NoPagingAdapter {
                id: "ascending_only",
                capability: Capability {
                    supported_timeframes: &[Timeframe::H1],
                    max_candles_per_call: 720,
                    supports_to_timestamp: false,
                    native_newest_first: false,
                },
            }),
            Box::new(NoPagingAdapter {
                id: "newest_first",
                capability: Capability {
                    supported_timeframes: &[Timeframe::H1],
                    max_candles_per_call: 720,
                    supports_to_timestamp: false,
                    native_newest_first: true,
                },
            }),
        ];
        let now = 10_000_000;
        let coverage = CoverageRecord {
            oldest_timestamp: now - 10 * DAY,
            newest_timestamp: now,
            candle_count: 240,
            last_updated: now,
        };

        let planned = next_window(&registry, "BTC", Timeframe::H1, 730 * DAY, now, Some(&coverage))
            .expect("fallback should still produce a request");

        assert_eq!(planned.adapter_id, "newest_first");
        assert!(
            planned.request.to_timestamp.is_none(),
            "fallback adapter can't page by an upper bound, so it must anchor at now instead"
        );

        let interval = Timeframe::H1.seconds();
        let span_to_oldest = now - coverage.oldest_timestamp;
        // clamped so the fetch, anchored at now, returns an oldest candle
        // strictly older than the current coverage.
        assert!(i64::from(planned.request.limit) * interval > span_to_oldest);
        assert!(planned.request.limit <= 720);
    }
}
