use anyhow::Result;
use candle_backfill::adapters::build_registry;
use candle_backfill::config::{PipelineConfig, TimeframeTarget};
use candle_backfill::model::Timeframe;
use candle_backfill::orchestrator::Orchestrator;
use candle_backfill::store::CandleStore;
use clap::Parser;
use std::str::FromStr;

const DB_FILE: &str = "candles.db";

/// Arguments CLI du binaire de backfill.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Symboles à traiter, séparés par des virgules (ex: BTC,ETH,LTC).
    #[arg(short, long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Timeframes à couvrir, séparés par des virgules (ex: 1h,1d).
    #[arg(short, long, value_delimiter = ',', default_value = "1h,1d")]
    timeframes: Vec<String>,

    /// Horizon cible en jours, appliqué à tous les timeframes demandés.
    #[arg(short = 'd', long, default_value_t = 730)]
    target_days: u32,

    /// Clé API CoinAPI (adaptateur prioritaire). Obligatoire: son absence
    /// est traitée comme une erreur de configuration fatale (voir plus bas).
    #[arg(long, env = "COINAPI_KEY", default_value = "")]
    coinapi_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let timeframes: Vec<TimeframeTarget> = args
        .timeframes
        .iter()
        .map(|s| {
            Timeframe::from_str(s)
                .map(|tf| TimeframeTarget::new(tf, args.target_days))
                .map_err(|_| anyhow::anyhow!("unrecognized timeframe: {s}"))
        })
        .collect::<Result<_>>()?;

    let config = PipelineConfig::new(args.symbols.clone(), timeframes);
    config.validate()?;

    // Missing credential is a fatal configuration error: abort before any
    // work starts rather than let the coinapi adapter silently lose every
    // race to the other four providers for its whole cycle.
    if args.coinapi_key.is_empty() {
        anyhow::bail!("configuration error: missing CoinAPI credential (--coinapi-key or COINAPI_KEY)");
    }

    println!("╔════════════════════════════════════════════════════════════");
    println!("║ BACKFILL CYCLE");
    println!("╠════════════════════════════════════════════════════════════");
    println!("║ Symboles: {}", args.symbols.join(", "));
    println!("║ Timeframes: {}", args.timeframes.join(", "));
    println!("║ Horizon cible: {} jours", args.target_days);
    println!("╚════════════════════════════════════════════════════════════\n");

    let registry = build_registry(&args.coinapi_key);
    let store = CandleStore::open(DB_FILE)?;
    let orchestrator = Orchestrator::new(registry, store);

    let report = orchestrator.run_cycle(&config).await?;

    println!(
        "Cycle terminé en {} ms: {} bougies insérées, {} ignorées, {} appels API, {} throttling(s).",
        report.wall_duration_ms,
        report.total_inserted,
        report.total_skipped,
        report.total_api_calls,
        report.total_rate_limit_events
    );
    for ((symbol, timeframe), pair) in &report.per_pair {
        if pair.errors.is_empty() {
            println!(
                "  {symbol}/{timeframe}: +{} bougies ({} appels, complet={})",
                pair.inserted, pair.api_calls, pair.complete
            );
        } else {
            for err in &pair.errors {
                eprintln!("  {symbol}/{timeframe}: {err}");
            }
        }
        // Logged distinctly from the insert/error summary above so operators
        // can grep throttling separately from hard failures (§6.4).
        if pair.rate_limit_events > 0 {
            eprintln!(
                "  {symbol}/{timeframe}: rate-limited {} time(s) before this cycle's call settled",
                pair.rate_limit_events
            );
        }
    }

    if report.is_complete {
        println!("\nCouverture cible atteinte pour toutes les paires.");
    }

    Ok(())
}
