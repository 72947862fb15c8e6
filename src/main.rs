use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use weather_trader::alerts::Alerts;
use weather_trader::calibration::CalibrationStore;
use weather_trader::config::Config;
use weather_trader::db::Database;
use weather_trader::executor::Executor;
use weather_trader::forecast::ForecastEngine;
use weather_trader::observations::ObservationFeed;
use weather_trader::scanner::Scanner;
use weather_trader::sources::SourceClient;
use weather_trader::venue::{VenueClient, VENUES};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("weather_trader=info")),
        )
        .init();

    info!(
        "weather-trader starting in {} mode: {} cities, scan every {}s",
        config.trading_mode,
        config.cities.len(),
        config.scan_interval_secs,
    );

    let db = Arc::new(Mutex::new(Database::open(&config.database_path)?));
    info!("Database initialized at {}", config.database_path);

    let sources = Arc::new(SourceClient::new(
        config.forecasts.cache_minutes,
        config.request_timeout_secs,
    )?);
    let calibration = Arc::new(CalibrationStore::new(
        db.clone(),
        config.forecasts.clone(),
        config.calibration.clone(),
        config.cities.clone(),
    ));
    let engine = Arc::new(ForecastEngine::new(
        sources,
        calibration.clone(),
        db.clone(),
        config.forecasts.clone(),
        config.platforms.clone(),
    ));
    let venues = Arc::new(VenueClient::new(
        &config.polymarket_api_url,
        &config.kalshi_api_url,
        config.trading_mode,
        config.request_timeout_secs,
    )?);
    let observations = Arc::new(ObservationFeed::new(db.clone()));
    let alerts = Arc::new(Alerts::new());

    let scanner = Arc::new(Scanner::new(
        db.clone(),
        engine,
        calibration.clone(),
        venues.clone(),
        observations,
        alerts.clone(),
        config.clone(),
    ));
    let executor = Arc::new(Mutex::new(
        Executor::new(
            db.clone(),
            venues.clone(),
            alerts.clone(),
            config.sizing.clone(),
            config.guaranteed_entry.clone(),
        )
        .await?,
    ));

    // Warm the calibration snapshot before the first cycle.
    calibration.snapshot().await;

    // ── Snapshot loop: periodic market state captures + position marks. ──
    {
        let db = db.clone();
        let venues = venues.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.snapshot_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = snapshot_cycle(&db, &venues, &config).await {
                    warn!("Snapshot cycle failed: {}", e);
                }
            }
        });
    }

    // ── Observation fast-poll: guaranteed-win detection. ──
    {
        let scanner = scanner.clone();
        let executor = executor.clone();
        let fast_poll_secs = config.fast_poll_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(fast_poll_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match scanner.scan_guaranteed_wins().await {
                    Ok(approved) if !approved.is_empty() => {
                        let mut executor = executor.lock().await;
                        let trades = executor.execute_guaranteed_wins(approved).await;
                        if !trades.is_empty() {
                            info!("Guaranteed-win pass placed {} trades", trades.len());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Guaranteed-win scan failed: {}", e),
                }
            }
        });
    }

    // ── Scan loop. Non-reentrant: the work runs inline on this task and a
    // cycle that overruns its period is cut off at the next await. ──
    let scan_period = Duration::from_secs(config.scan_interval_secs);
    let mut ticker = tokio::time::interval(scan_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;

        let cycle = {
            let db = db.lock().await;
            match db.get_next_cycle_number() {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to allocate cycle number: {}", e);
                    continue;
                }
            }
        };
        info!("═══ Cycle {} starting ═══", cycle);

        let scan = tokio::time::timeout(scan_period, scanner.scan(cycle)).await;
        let approved = match scan {
            Ok(Ok(approved)) => approved,
            Ok(Err(e)) => {
                error!("Scan cycle {} failed: {}", cycle, e);
                continue;
            }
            Err(_) => {
                warn!("Scan cycle {} overran its period and was aborted", cycle);
                continue;
            }
        };

        let approved_count = approved.len() as i64;
        let trades = {
            let mut executor = executor.lock().await;
            executor.execute(approved).await
        };

        {
            let db = db.lock().await;
            let evaluations = db.count_opportunities(cycle).unwrap_or(0);
            if let Err(e) = db.log_cycle(cycle, evaluations, approved_count, trades.len() as i64) {
                warn!("Failed to log cycle {}: {}", cycle, e);
            }
        }
        info!(
            "═══ Cycle {} done: {} approved, {} trades ═══",
            cycle,
            approved_count,
            trades.len()
        );
    }
}

/// Capture the current book for every (city, date, venue) and refresh the
/// marks on open positions.
async fn snapshot_cycle(
    db: &Arc<Mutex<Database>>,
    venues: &Arc<VenueClient>,
    config: &Config,
) -> Result<()> {
    let cycle = {
        let db = db.lock().await;
        db.get_next_cycle_number()?
    };

    let open_trades = {
        let db = db.lock().await;
        db.get_open_trades()?
    };

    for city in &config.cities {
        let Ok(tz) = city.tz() else { continue };
        let today = chrono::Utc::now().with_timezone(&tz).date_naive();
        for offset in 0..config.forecasts.scan_days {
            let date = (today + chrono::Duration::days(offset as i64))
                .format("%Y-%m-%d")
                .to_string();
            for &venue in VENUES {
                let ranges = match venues.get_markets(city, &date, venue).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Snapshot fetch failed for {}/{}: {}", city.key, venue, e);
                        continue;
                    }
                };
                let db = db.lock().await;
                for range in &ranges {
                    if let Err(e) = db.insert_snapshot(
                        cycle,
                        &city.key,
                        &date,
                        venue.as_str(),
                        &range.market_id,
                        &range.name,
                        range.bid,
                        range.ask,
                        range.spread,
                        range.volume,
                    ) {
                        warn!("Failed to insert snapshot row: {}", e);
                        break;
                    }
                    // Monitor touch: mark open positions at the current book.
                    for trade in open_trades.iter().filter(|t| {
                        t.status == "open"
                            && t.city == city.key
                            && t.date == date
                            && t.venue == venue.as_str()
                            && t.range_name == range.name
                    }) {
                        let price = match trade.side.as_str() {
                            "NO" => range.no_bid(),
                            _ => range.bid,
                        };
                        if let Err(e) = db.update_trade_market(&trade.trade_id, price, None, None) {
                            warn!("Failed to mark trade {}: {}", trade.trade_id, e);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
