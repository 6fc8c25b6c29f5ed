/// Provider Adapters (C1)
///
/// Chaque adaptateur traduit un FetchRequest canonique en un appel HTTP
/// spécifique à un provider, puis normalise la réponse en Candle canoniques.
/// Les adaptateurs sont sans état (le back-off vit dans le Fetcher, pas ici)
/// et ne doivent jamais paniquer sur une erreur de transport: tout se
/// résout en un Outcome.
use crate::model::{FetchRequest, FetchResult, ProviderId, Timeframe};
use async_trait::async_trait;

pub mod binance;
pub mod coinapi;
pub mod coinbase;
pub mod cryptocompare;
pub mod kraken;

/// Descripteur déclaratif des capacités d'un provider.
#[derive(Debug, Clone)]
pub struct Capability {
    pub supported_timeframes: &'static [Timeframe],
    pub max_candles_per_call: u32,
    pub supports_to_timestamp: bool,
    /// True when the provider's wire format is natively newest-first (before
    /// the adapter reverses/sorts it into canonical oldest-first order). The
    /// planner uses this to pick a sensible fallback when no candidate
    /// supports upper-bound paging (§4.4 step 6).
    pub native_newest_first: bool,
}

impl Capability {
    pub fn supports(&self, timeframe: Timeframe) -> bool {
        self.supported_timeframes.contains(&timeframe)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn capability(&self) -> &Capability;

    /// Traduit un symbole canonique (p. ex. "BTC") vers la paire native du
    /// provider (p. ex. "XXBTZUSD"), ou None si non supporté.
    fn symbol_map(&self, symbol: &str) -> Option<String>;

    /// Ordonnancement utilisé par le planificateur; plus petit = préféré.
    /// None si le timeframe n'est pas supporté par ce provider.
    fn priority(&self, timeframe: Timeframe) -> Option<u8>;

    /// Exécute l'appel réseau et normalise la réponse. Ne doit jamais
    /// paniquer: toute défaillance se résout en un Outcome classifié.
    async fn fetch(&self, client: &reqwest::Client, request: &FetchRequest) -> FetchResult;
}

/// Construit le registre complet des adaptateurs connus. `coinapi_api_key`
/// est requis: son absence est une erreur de configuration fatale détectée
/// en amont par `PipelineConfig::validate`, pas ici.
pub fn build_registry(coinapi_api_key: &str) -> Vec<Box<dyn ProviderAdapter>> {
    vec![
        Box::new(binance::BinanceAdapter::new()),
        Box::new(coinapi::CoinApiAdapter::new(coinapi_api_key.to_string())),
        Box::new(coinbase::CoinbaseAdapter::new()),
        Box::new(cryptocompare::CryptoCompareAdapter::new()),
        Box::new(kraken::KrakenAdapter::new()),
    ]
}

/// Classifie un code de statut HTTP en issue de fetch.
pub(crate) fn classify_status(status: reqwest::StatusCode) -> Option<crate::model::Outcome> {
    use crate::model::Outcome;
    if status == 429 || status == 503 || status.is_server_error() {
        Some(Outcome::RateLimited)
    } else if status.is_client_error() {
        Some(Outcome::TerminalError)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_five_adapters() {
        let registry = build_registry("test-key");
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn registry_ids_are_lexicographically_distinct() {
        let registry = build_registry("test-key");
        let mut ids: Vec<&str> = registry.iter().map(|a| a.id()).collect();
        let original = ids.clone();
        ids.sort_unstable();
        assert_eq!(ids, original, "registry should already be in id order for determinism");
    }
}
