use anyhow::Result;
use candle_backfill::model::Timeframe;
use candle_backfill::store::CandleStore;
use chrono::{DateTime, Utc};
use clap::Parser;
use std::str::FromStr;

const DB_FILE: &str = "candles.db";

/// Inspecte la couverture persistée pour un (symbol, timeframe) et rapporte
/// les trous internes restants, sans jamais les combler.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    symbol: String,

    #[arg(short, long)]
    timeframe: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let timeframe = Timeframe::from_str(&args.timeframe)
        .map_err(|_| anyhow::anyhow!("unrecognized timeframe: {}", args.timeframe))?;

    let store = CandleStore::open(DB_FILE)?;

    println!(
        "\n=== Vérification de la couverture pour {}/{} ===",
        args.symbol, args.timeframe
    );

    match store.coverage(&args.symbol, timeframe).await? {
        None => {
            println!("Aucune donnée en base pour cette paire.");
        }
        Some(coverage) => {
            println!("Bougies stockées: {}", coverage.candle_count);
            println!("Plus ancienne: {}", format_timestamp(coverage.oldest_timestamp));
            println!("Plus récente: {}", format_timestamp(coverage.newest_timestamp));
            println!("Années de données: {:.2}", coverage.years_of_data(timeframe));

            let gaps = store.count_gaps(&args.symbol, timeframe).await?;
            if gaps == 0 {
                println!("\n✓ Aucun trou détecté - la couverture est continue.");
            } else {
                println!("\n--- {gaps} bougies manquantes détectées dans la plage couverte ---");
                println!("(diagnostic en lecture seule: aucune valeur n'est fabriquée)");
            }
        }
    }

    println!("\n{:=<60}\n", "");
    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Invalid timestamp".to_string())
}
