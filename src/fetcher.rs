/// Rate-Limited Fetcher (C2)
///
/// Exécute un appel adaptateur avec retries bornés et back-off exponentiel.
/// Sans état entre invocations: tout l'état de back-off vit à l'intérieur
/// d'un seul appel à `invoke`.
use crate::adapters::ProviderAdapter;
use crate::config::FetchPolicy;
use crate::model::{FetchRequest, FetchResult, Outcome};
use rand::Rng;
use std::time::Duration;

/// Nombre d'événements rate_limited observés durant un appel à `invoke`,
/// utile pour le compte-rendu de cycle.
pub struct InvokeOutcome {
    pub result: FetchResult,
    pub rate_limit_events: u32,
}

pub async fn invoke(
    adapter: &dyn ProviderAdapter,
    client: &reqwest::Client,
    request: &FetchRequest,
    policy: &FetchPolicy,
) -> InvokeOutcome {
    let mut attempt = 0u32;
    let mut rate_limit_events = 0u32;

    loop {
        let result = adapter.fetch(client, request).await;

        match result.outcome {
            Outcome::Ok | Outcome::Empty => {
                sleep_with_jitter(policy.inter_call_delay_ms, policy.jitter).await;
                return InvokeOutcome {
                    result,
                    rate_limit_events,
                };
            }
            Outcome::TerminalError => {
                return InvokeOutcome {
                    result,
                    rate_limit_events,
                };
            }
            Outcome::RateLimited => {
                rate_limit_events += 1;
                if attempt >= policy.max_retries {
                    return InvokeOutcome {
                        result,
                        rate_limit_events,
                    };
                }
                let backoff_ms = (policy.base_backoff_ms.saturating_mul(1 << attempt))
                    .min(policy.max_backoff_ms);
                sleep_with_jitter(backoff_ms, policy.jitter).await;
                attempt += 1;
            }
        }
    }
}

async fn sleep_with_jitter(base_ms: u64, jitter: f64) {
    let delay_ms = if jitter > 0.0 {
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        ((base_ms as f64) * factor).max(0.0) as u64
    } else {
        base_ms
    };
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}
