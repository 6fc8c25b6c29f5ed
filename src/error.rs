/// Taxonomie d'erreurs de la pipeline de backfill
///
/// Chaque variante correspond à une des catégories décrites dans la conception:
/// erreurs de configuration (fatales), erreurs de transport transitoires,
/// erreurs provider terminales, et violations d'invariant côté store.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Identifiant de credential manquant, liste de symboles vide, ou aucun
    /// adaptateur ne sait servir un (symbol, timeframe) demandé. Fatal: le
    /// cycle s'arrête avant de faire le moindre travail.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Candidat invariant violé avant insertion (OHLC incohérent, timestamp
    /// non aligné sur la frontière du timeframe).
    #[error("candle rejected: {reason} (symbol={symbol}, timeframe={timeframe}, ts={timestamp})")]
    InvalidCandle {
        symbol: String,
        timeframe: String,
        timestamp: i64,
        reason: String,
    },

    /// Erreur de connexion ou de requête SQLite.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Adaptateur incapable de traduire un symbole vers sa paire native.
    #[error("no adapter supports {symbol}/{timeframe}")]
    NoAdapter { symbol: String, timeframe: String },

    /// Erreur de transport réseau (non classifiée en rate_limited/terminal
    /// par l'appelant — utilisée uniquement pour des échecs hors HTTP, par
    /// exemple une panne d'horloge système).
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
