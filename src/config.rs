/// Configuration de la pipeline
///
/// Collecte en un seul endroit les options de pipeline. Pas de
/// chargement depuis un fichier: comme pour `BackfillOptions` dans le
/// prototype dont ce crate descend, la configuration est construite par
/// l'appelant (binaire CLI ou tests) via un petit pattern builder.
use crate::model::Timeframe;

/// Politique passée au fetcher (C2).
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub inter_call_delay_ms: u64,
    /// Jitter uniforme appliqué à chaque attente, exprimé en fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            max_retries: 3,
            base_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            inter_call_delay_ms: 1_000,
            jitter: 0.2,
        }
    }
}

/// Horizon de couverture cible pour un timeframe donné.
#[derive(Debug, Clone, Copy)]
pub struct TimeframeTarget {
    pub timeframe: Timeframe,
    pub target_days: u32,
}

impl TimeframeTarget {
    pub fn new(timeframe: Timeframe, target_days: u32) -> Self {
        TimeframeTarget {
            timeframe,
            target_days,
        }
    }

    pub fn target_horizon_secs(&self) -> i64 {
        i64::from(self.target_days) * 86_400
    }
}

/// Configuration d'un cycle d'orchestration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<TimeframeTarget>,
    pub fetch_policy: FetchPolicy,
    pub batch_size: usize,
    pub cycle_budget_ms: u64,
    pub max_calls_per_cycle: u32,
}

impl PipelineConfig {
    pub fn new(symbols: Vec<String>, timeframes: Vec<TimeframeTarget>) -> Self {
        PipelineConfig {
            symbols,
            timeframes,
            fetch_policy: FetchPolicy::default(),
            batch_size: 500,
            cycle_budget_ms: 50_000,
            max_calls_per_cycle: 60,
        }
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cycle_budget_ms(mut self, budget_ms: u64) -> Self {
        self.cycle_budget_ms = budget_ms;
        self
    }

    pub fn with_max_calls_per_cycle(mut self, max_calls: u32) -> Self {
        self.max_calls_per_cycle = max_calls;
        self
    }

    /// Valide la configuration avant de lancer un cycle. Une config
    /// invalide (symboles vides) est une erreur de configuration fatale,
    /// c'est une erreur de configuration, pas une erreur de paire.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.symbols.is_empty() {
            return Err(crate::error::PipelineError::Configuration(
                "symbols list is empty".to_string(),
            ));
        }
        if self.timeframes.is_empty() {
            return Err(crate::error::PipelineError::Configuration(
                "timeframes list is empty".to_string(),
            ));
        }
        Ok(())
    }
}
