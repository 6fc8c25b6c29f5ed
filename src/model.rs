/// Types canoniques partagés par tous les composants de la pipeline
///
/// Un Candle ne quitte jamais ce module sans être passé par la validation
/// d'invariants (voir Candle::validate); les adaptateurs (C1) construisent
/// des Candle "bruts" à partir des réponses provider, et c'est le Store
/// qui est responsable de rejeter ceux qui violent ces invariants.
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Le jeu fermé de granularités supportées par la pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Durée du timeframe en secondes. Sert à l'alignement des timestamps
    /// et au calcul des fenêtres de pagination.
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// Aligne un timestamp Unix (secondes) sur la frontière du timeframe
    /// (floor, jamais ceil: on ne veut pas inventer un bar qui n'a pas
    /// encore fini).
    pub fn align(&self, timestamp: i64) -> i64 {
        let interval = self.seconds();
        (timestamp.div_euclid(interval)) * interval
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTimeframeError;

impl fmt::Display for ParseTimeframeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unrecognized timeframe tag")
    }
}

impl std::error::Error for ParseTimeframeError {}

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            _ => Err(ParseTimeframeError),
        }
    }
}

/// Identifiant de provider, utilisé partout comme clé de tri déterministe et
/// comme étiquette de colonne dans le store.
pub type ProviderId = &'static str;

/// Une bougie OHLCV canonique, éventuellement collationnée à partir de
/// plusieurs providers.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub providers: Vec<String>,
    pub data_points: u32,
    pub variance: Decimal,
}

impl Candle {
    /// Construit une bougie fraîchement observée par un seul provider
    /// (data_points=1, variance=0).
    pub fn from_observation(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        timestamp: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        source: ProviderId,
    ) -> Self {
        Candle {
            symbol: symbol.into(),
            timeframe,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            providers: vec![source.to_string()],
            data_points: 1,
            variance: Decimal::ZERO,
        }
    }

    /// Vérifie les invariants OHLCV: low <= min(open, close), high >=
    /// max(open, close), low <= high, timestamp aligné sur la frontière.
    pub fn validate(&self) -> Result<(), String> {
        let min_oc = self.open.min(self.close);
        let max_oc = self.open.max(self.close);

        if self.low > min_oc {
            return Err(format!(
                "low ({}) > min(open, close) ({})",
                self.low, min_oc
            ));
        }
        if self.high < max_oc {
            return Err(format!(
                "high ({}) < max(open, close) ({})",
                self.high, max_oc
            ));
        }
        if self.low > self.high {
            return Err(format!("low ({}) > high ({})", self.low, self.high));
        }
        if self.timestamp % self.timeframe.seconds() != 0 {
            return Err(format!(
                "timestamp {} not aligned to {} boundary",
                self.timestamp, self.timeframe
            ));
        }
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err("open/high/low/close must be strictly positive".to_string());
        }
        if self.volume < Decimal::ZERO {
            return Err("volume must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Enregistrement de couverture pour un (symbol, timeframe), matérialisé pour
/// un lookup O(1) par le planificateur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageRecord {
    pub oldest_timestamp: i64,
    pub newest_timestamp: i64,
    pub candle_count: i64,
    pub last_updated: i64,
}

impl CoverageRecord {
    pub fn years_of_data(&self, timeframe: Timeframe) -> f64 {
        let span = (self.newest_timestamp - self.oldest_timestamp) as f64 + timeframe.seconds() as f64;
        span / (365.25 * 86_400.0)
    }
}

/// Requête de fetch transitoire transmise au fetcher.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub provider: ProviderId,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: u32,
    /// Borne supérieure (inclusive) en secondes Unix. None = "maintenant".
    pub to_timestamp: Option<i64>,
}

/// Classification d'issue d'un appel adaptateur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Empty,
    RateLimited,
    TerminalError,
}

/// Résultat transitoire d'un fetch, avant merge dans le store.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub candles: Vec<Candle>,
    pub source: ProviderId,
    pub latency_ms: u64,
    pub outcome: Outcome,
    /// Raison diagnostique, peuplée pour rate_limited/terminal_error/empty.
    pub reason: Option<String>,
}

impl FetchResult {
    pub fn ok(candles: Vec<Candle>, source: ProviderId, latency_ms: u64) -> Self {
        let outcome = if candles.is_empty() {
            Outcome::Empty
        } else {
            Outcome::Ok
        };
        FetchResult {
            candles,
            source,
            latency_ms,
            outcome,
            reason: None,
        }
    }

    pub fn rate_limited(source: ProviderId, latency_ms: u64, reason: impl Into<String>) -> Self {
        FetchResult {
            candles: Vec::new(),
            source,
            latency_ms,
            outcome: Outcome::RateLimited,
            reason: Some(reason.into()),
        }
    }

    pub fn terminal_error(source: ProviderId, latency_ms: u64, reason: impl Into<String>) -> Self {
        FetchResult {
            candles: Vec::new(),
            source,
            latency_ms,
            outcome: Outcome::TerminalError,
            reason: Some(reason.into()),
        }
    }
}

/// Compte-rendu d'un (symbol, timeframe) pour un cycle donné.
#[derive(Debug, Clone, Default)]
pub struct PairReport {
    pub inserted: i64,
    pub skipped: i64,
    pub api_calls: u32,
    /// Nombre d'événements `rate_limited` observés par le fetcher pour cette
    /// paire, avant le succès ou l'épuisement des retries (§6.4, Scenario C).
    pub rate_limit_events: u32,
    pub errors: Vec<String>,
    pub complete: bool,
}

/// Compte-rendu agrégé d'un cycle d'orchestration.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub per_pair: Vec<((String, Timeframe), PairReport)>,
    pub total_inserted: i64,
    pub total_skipped: i64,
    pub total_api_calls: u32,
    pub total_rate_limit_events: u32,
    pub wall_duration_ms: u64,
    pub is_complete: bool,
}
