/// Collated Candle Store (C3)
///
/// Persiste les bougies canoniques de façon idempotente, collationne les
/// observations multi-providers et matérialise une Coverage Record par
/// (symbol, timeframe) pour une planification en O(1).
///
/// ARCHITECTURE: comme dans `database.rs` du prototype dont ce module
/// descend, une seule connexion SQLite encapsulée; elle est ici protégée par
/// un verrou async pour être partagée entre les tâches par-provider de
/// l'orchestrateur, la seule ressource mutable partagée du pipeline.
use crate::error::{PipelineError, Result};
use crate::model::{Candle, CoverageRecord, Timeframe};
use rust_decimal::Decimal;
use rust_decimal::prelude::MathematicalOps;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

pub struct CandleStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub inserted: i64,
    pub skipped: i64,
}

/// Une bougie candidate qui a violé un invariant OHLCV et n'a donc pas été
/// écrite; comptée en `errors`, jamais en `skipped`.
#[derive(Debug, Clone)]
pub struct RejectedCandle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub reason: String,
}

impl CandleStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(CandleStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(CandleStore {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS candle_observations (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                provider TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, timestamp, provider)
            );

            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                providers TEXT NOT NULL,
                data_points INTEGER NOT NULL,
                variance TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, timestamp)
            );

            CREATE INDEX IF NOT EXISTS idx_candles_range
                ON candles (symbol, timeframe, timestamp ASC);

            CREATE TABLE IF NOT EXISTS coverage (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                oldest_timestamp INTEGER NOT NULL,
                newest_timestamp INTEGER NOT NULL,
                candle_count INTEGER NOT NULL,
                last_updated INTEGER NOT NULL,
                PRIMARY KEY (symbol, timeframe)
            );",
        )
    }

    /// Ingestion idempotente d'un lot de bougies pour un (symbol, timeframe).
    /// Découpe en transactions de `batch_size` (typiquement 500);
    /// chaque transaction est all-or-nothing pour les bougies valides
    /// qu'elle contient. Les bougies qui violent un invariant sont
    /// retournées séparément et ne comptent ni en `inserted` ni en `skipped`.
    pub async fn merge(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
        batch_size: usize,
    ) -> Result<(MergeOutcome, Vec<RejectedCandle>)> {
        let mut valid = Vec::with_capacity(candles.len());
        let mut rejected = Vec::new();

        for candle in candles {
            match candle.validate() {
                Ok(()) => valid.push(candle),
                Err(reason) => rejected.push(RejectedCandle {
                    symbol: candle.symbol.clone(),
                    timeframe: candle.timeframe,
                    timestamp: candle.timestamp,
                    reason,
                }),
            }
        }

        let mut outcome = MergeOutcome::default();
        let batch_size = batch_size.max(1);

        let mut conn = self.conn.lock().await;
        for chunk in valid.chunks(batch_size) {
            let tx = conn.transaction()?;
            for candle in chunk {
                let inserted = Self::merge_one(&tx, candle)?;
                if inserted {
                    outcome.inserted += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            tx.commit()?;
            Self::refresh_coverage(&conn, symbol, timeframe)?;
        }

        Ok((outcome, rejected))
    }

    /// Ingère une bougie individuelle dans `candle_observations` (no-op si le
    /// (symbol, timeframe, timestamp, provider) existe déjà — c'est ce qui
    /// rend un replay de `merge` idempotent), recalcule l'agrégat collationné
    /// et l'upsert dans `candles`. Retourne `true` si le (symbol, timeframe,
    /// timestamp) était absent de `candles` avant cet appel.
    fn merge_one(tx: &rusqlite::Transaction<'_>, candle: &Candle) -> rusqlite::Result<bool> {
        let existed_before: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3",
                params![candle.symbol, candle.timeframe.as_str(), candle.timestamp],
                |row| row.get(0),
            )
            .optional()?;

        let provider = candle
            .providers
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        tx.execute(
            "INSERT OR IGNORE INTO candle_observations
                (symbol, timeframe, timestamp, provider, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                candle.symbol,
                candle.timeframe.as_str(),
                candle.timestamp,
                provider,
                candle.open.to_string(),
                candle.high.to_string(),
                candle.low.to_string(),
                candle.close.to_string(),
                candle.volume.to_string(),
            ],
        )?;

        let mut stmt = tx.prepare(
            "SELECT provider, open, high, low, close, volume FROM candle_observations
             WHERE symbol = ?1 AND timeframe = ?2 AND timestamp = ?3
             ORDER BY rowid ASC",
        )?;
        let rows: Vec<(String, Decimal, Decimal, Decimal, Decimal, Decimal)> = stmt
            .query_map(
                params![candle.symbol, candle.timeframe.as_str(), candle.timestamp],
                |row| {
                    let parse = |s: String| Decimal::from_str(&s).unwrap_or(Decimal::ZERO);
                    Ok((
                        row.get::<_, String>(0)?,
                        parse(row.get::<_, String>(1)?),
                        parse(row.get::<_, String>(2)?),
                        parse(row.get::<_, String>(3)?),
                        parse(row.get::<_, String>(4)?),
                        parse(row.get::<_, String>(5)?),
                    ))
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        let mut providers: Vec<String> = rows.iter().map(|r| r.0.clone()).collect();
        providers.sort();
        providers.dedup();

        let open = rows.first().map(|r| r.1).unwrap_or(candle.open);
        let high = rows
            .iter()
            .map(|r| r.2)
            .skip(1)
            .fold(rows[0].2, |acc, v| acc.max(v));
        let low = rows
            .iter()
            .map(|r| r.3)
            .skip(1)
            .fold(rows[0].3, |acc, v| acc.min(v));
        let closes: Vec<Decimal> = rows.iter().map(|r| r.4).collect();
        let volumes: Vec<Decimal> = rows.iter().map(|r| r.5).collect();
        let close = median(&closes);
        let volume = median(&volumes);
        let variance = coefficient_of_variation(&closes);

        tx.execute(
            "INSERT OR REPLACE INTO candles
                (symbol, timeframe, timestamp, open, high, low, close, volume, providers, data_points, variance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                candle.symbol,
                candle.timeframe.as_str(),
                candle.timestamp,
                open.to_string(),
                high.to_string(),
                low.to_string(),
                close.to_string(),
                volume.to_string(),
                providers.join(","),
                providers.len() as i64,
                variance.to_string(),
            ],
        )?;

        Ok(existed_before.is_none())
    }

    fn refresh_coverage(conn: &Connection, symbol: &str, timeframe: Timeframe) -> rusqlite::Result<()> {
        let row: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp), COUNT(*) FROM candles
                 WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((oldest, newest, count)) = row else {
            return Ok(());
        };

        let now = now_unix();
        conn.execute(
            "INSERT INTO coverage (symbol, timeframe, oldest_timestamp, newest_timestamp, candle_count, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol, timeframe) DO UPDATE SET
                oldest_timestamp = excluded.oldest_timestamp,
                newest_timestamp = excluded.newest_timestamp,
                candle_count = excluded.candle_count,
                last_updated = excluded.last_updated",
            params![symbol, timeframe.as_str(), oldest, newest, count, now],
        )?;
        Ok(())
    }

    pub async fn coverage(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<CoverageRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT oldest_timestamp, newest_timestamp, candle_count, last_updated
                 FROM coverage WHERE symbol = ?1 AND timeframe = ?2",
                params![symbol, timeframe.as_str()],
                |row| {
                    Ok(CoverageRecord {
                        oldest_timestamp: row.get(0)?,
                        newest_timestamp: row.get(1)?,
                        candle_count: row.get(2)?,
                        last_updated: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Lecture ordonnée pour les collaborateurs en aval. Ne bloque
    /// jamais un cycle en cours au-delà d'un court verrou de lecture.
    pub async fn get(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, open, high, low, close, volume, providers, data_points, variance
             FROM candles
             WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;
        let parse = |s: String| Decimal::from_str(&s).unwrap_or(Decimal::ZERO);
        let rows = stmt
            .query_map(params![symbol, timeframe.as_str(), start, end], |row| {
                Ok(Candle {
                    symbol: row.get::<_, String>(0)?,
                    timeframe,
                    timestamp: row.get(1)?,
                    open: parse(row.get::<_, String>(2)?),
                    high: parse(row.get::<_, String>(3)?),
                    low: parse(row.get::<_, String>(4)?),
                    close: parse(row.get::<_, String>(5)?),
                    volume: parse(row.get::<_, String>(6)?),
                    providers: row
                        .get::<_, String>(7)?
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    data_points: row.get::<_, i64>(8)? as u32,
                    variance: parse(row.get::<_, String>(9)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Vue d'ensemble pour l'interface de lecture en aval.
    pub async fn progress(&self) -> Result<(Vec<((String, Timeframe), CoverageRecord)>, i64)> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT symbol, timeframe, oldest_timestamp, newest_timestamp, candle_count, last_updated
             FROM coverage ORDER BY symbol, timeframe",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let tf_str: String = row.get(1)?;
                Ok((
                    row.get::<_, String>(0)?,
                    tf_str,
                    CoverageRecord {
                        oldest_timestamp: row.get(2)?,
                        newest_timestamp: row.get(3)?,
                        candle_count: row.get(4)?,
                        last_updated: row.get(5)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut per_pair = Vec::with_capacity(rows.len());
        let mut total_candles = 0i64;
        for (symbol, tf_str, record) in rows {
            let Ok(timeframe) = Timeframe::from_str(&tf_str) else {
                continue;
            };
            total_candles += record.candle_count;
            per_pair.push(((symbol, timeframe), record));
        }
        Ok((per_pair, total_candles))
    }

    /// Diagnostic en lecture seule: compte les intervalles internes plus
    /// larges que l'intervalle attendu du timeframe, sans rien combler
    /// La fabrication de bougies interpolées est volontairement exclue.
    pub async fn count_gaps(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT timestamp FROM candles WHERE symbol = ?1 AND timeframe = ?2 ORDER BY timestamp ASC",
        )?;
        let timestamps: Vec<i64> = stmt
            .query_map(params![symbol, timeframe.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let interval = timeframe.seconds();
        let mut gaps = 0i64;
        for pair in timestamps.windows(2) {
            let diff = pair[1] - pair[0];
            if diff > interval {
                gaps += diff / interval - 1;
            }
        }
        Ok(gaps)
    }
}

fn median(values: &[Decimal]) -> Decimal {
    let mut sorted = values.to_vec();
    sorted.sort();
    let n = sorted.len();
    if n == 0 {
        return Decimal::ZERO;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / Decimal::from(2u8)
    }
}

/// Coefficient de variation (écart-type d'échantillon / moyenne), clampé à
/// [0, 1]. Renvoie 0 pour une seule observation.
fn coefficient_of_variation(values: &[Decimal]) -> Decimal {
    if values.len() < 2 {
        return Decimal::ZERO;
    }
    let n = Decimal::from(values.len() as u64);
    let mean = values.iter().sum::<Decimal>() / n;
    if mean.is_zero() {
        return Decimal::ZERO;
    }
    let sum_sq: Decimal = values.iter().map(|v| (*v - mean) * (*v - mean)).sum();
    let sample_variance = sum_sq / (n - Decimal::ONE);
    let stddev = sample_variance.sqrt().unwrap_or(Decimal::ZERO);
    let cv = (stddev / mean).abs();
    cv.clamp(Decimal::ZERO, Decimal::ONE)
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
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, tf: Timeframe, ts: i64, close: Decimal, provider: &'static str) -> Candle {
        Candle::from_observation(symbol, tf, ts, close, close, close, close, dec!(10), provider)
    }

    #[tokio::test]
    async fn insert_then_duplicate_is_idempotent() {
        let store = CandleStore::open_in_memory().unwrap();
        let c = candle("BTC", Timeframe::H1, 3600, dec!(100), "binance");

        let (outcome1, rejected1) = store
            .merge("BTC", Timeframe::H1, &[c.clone()], 500)
            .await
            .unwrap();
        assert_eq!(outcome1.inserted, 1);
        assert_eq!(outcome1.skipped, 0);
        assert!(rejected1.is_empty());

        let (outcome2, _) = store.merge("BTC", Timeframe::H1, &[c], 500).await.unwrap();
        assert_eq!(outcome2.inserted, 0);
        assert_eq!(outcome2.skipped, 1);

        let coverage = store.coverage("BTC", Timeframe::H1).await.unwrap().unwrap();
        assert_eq!(coverage.candle_count, 1);
    }

    #[tokio::test]
    async fn collation_from_two_providers_uses_mean_close() {
        let store = CandleStore::open_in_memory().unwrap();
        let c1 = candle("BTC", Timeframe::H1, 3600, dec!(50000), "binance");
        let c2 = candle("BTC", Timeframe::H1, 3600, dec!(50010), "kraken");

        store.merge("BTC", Timeframe::H1, &[c1], 500).await.unwrap();
        let (outcome, _) = store.merge("BTC", Timeframe::H1, &[c2], 500).await.unwrap();
        assert_eq!(outcome.skipped, 1);

        let rows = store
            .get("BTC", Timeframe::H1, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.close, dec!(50005));
        assert_eq!(row.data_points, 2);
        assert!(row.variance > Decimal::ZERO && row.variance < dec!(0.01));
        assert_eq!(row.providers, vec!["binance".to_string(), "kraken".to_string()]);
    }

    #[tokio::test]
    async fn rejects_invariant_violation() {
        let store = CandleStore::open_in_memory().unwrap();
        let mut bad = candle("BTC", Timeframe::H1, 3600, dec!(100), "binance");
        bad.high = dec!(50); // high < close, violates invariant

        let (outcome, rejected) = store
            .merge("BTC", Timeframe::H1, &[bad], 500)
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn count_gaps_detects_missing_interior_bars() {
        let store = CandleStore::open_in_memory().unwrap();
        let c1 = candle("BTC", Timeframe::H1, 0, dec!(100), "binance");
        let c2 = candle("BTC", Timeframe::H1, 3 * 3600, dec!(101), "binance");
        store
            .merge("BTC", Timeframe::H1, &[c1, c2], 500)
            .await
            .unwrap();

        let gaps = store.count_gaps("BTC", Timeframe::H1).await.unwrap();
        assert_eq!(gaps, 2);
    }
}
