use std::sync::Arc;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use weather_trader::alerts::Alerts;
use weather_trader::calibration::CalibrationStore;
use weather_trader::config::{Config, TradingMode};
use weather_trader::db::{Database, OpportunityRecord};
use weather_trader::executor::Executor;
use weather_trader::forecast::ForecastEngine;
use weather_trader::observations::ObservationFeed;
use weather_trader::scanner::{EntryReason, Opportunity, Scanner, Side};
use weather_trader::sources::{SourceClient, SourceEndpoints};
use weather_trader::units::TempUnit;
use weather_trader::venue::{Range, RangeKind, Venue, VenueClient};

fn base_config(server_uri: &str, extra_cities: &str) -> Config {
    let toml = format!(
        r#"
trading_mode = "paper"
polymarket_api_url = "{uri}"
kalshi_api_url = "{uri}"

[[cities]]
key = "nyc"
name = "New York"
lat = 40.7128
lon = -74.0060
timezone = "America/New_York"
unit = "F"
station_polymarket = "KLGA"
station_kalshi = "KLGA"
blocked_venues = ["kalshi"]
{extra}

[forecasts]
scan_days = 2

[sizing]
yes_bankroll = 1000.0
no_bankroll = 1000.0
"#,
        uri = server_uri,
        extra = extra_cities,
    );
    Config::from_toml(&toml).unwrap()
}

struct Harness {
    db: Arc<Mutex<Database>>,
    scanner: Scanner,
    executor: Executor,
}

async fn build_harness(server: &MockServer, config: Config) -> Harness {
    let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let sources = Arc::new(
        SourceClient::with_endpoints(SourceEndpoints::single_base(&server.uri()), 30, 5).unwrap(),
    );
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
    let venues = Arc::new(
        VenueClient::new(&server.uri(), &server.uri(), TradingMode::Paper, 5).unwrap(),
    );
    let observations = Arc::new(ObservationFeed::new(db.clone()));
    let alerts = Arc::new(Alerts::new());

    let scanner = Scanner::new(
        db.clone(),
        engine,
        calibration,
        venues.clone(),
        observations,
        alerts.clone(),
        config.clone(),
    );
    let executor = Executor::new(
        db.clone(),
        venues,
        alerts,
        config.sizing.clone(),
        config.guaranteed_entry.clone(),
    )
    .await
    .unwrap();

    Harness { db, scanner, executor }
}

fn nyc_dates() -> (String, String) {
    let tz: chrono_tz::Tz = "America/New_York".parse().unwrap();
    let today = chrono::Utc::now().with_timezone(&tz).date_naive();
    (
        today.format("%Y-%m-%d").to_string(),
        (today + chrono::Duration::days(1)).format("%Y-%m-%d").to_string(),
    )
}

async fn mount_weather(server: &MockServer, today: &str, tomorrow: &str, gfs: f64, ecmwf: f64) {
    let body = |t0: f64, t1: f64| {
        serde_json::json!({
            "daily": {"time": [today, tomorrow], "temperature_2m_max": [t0, t1]}
        })
    };
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("models", "gfs_seamless"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body(gfs, gfs)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("models", "ecmwf_ifs025"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body(ecmwf, ecmwf)))
        .mount(server)
        .await;
}

async fn mount_market(server: &MockServer, date: &str, contracts: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/markets/daily-high"))
        .and(query_param("date", date))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"market_id": format!("mkt-{}", date), "contracts": contracts}
        ])))
        .mount(server)
        .await;
}

async fn mount_fallbacks(server: &MockServer) {
    // Everything not explicitly mocked (other sources, other dates) fails
    // or is empty.
    Mock::given(method("GET"))
        .and(path("/markets/daily-high"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(server)
        .await;
}

// ── Scenario 1 + 4: clean YES entry, then duplicate suppression. ──

#[tokio::test]
async fn clean_yes_entry_then_duplicate_suppression() {
    let server = MockServer::start().await;
    let (today, tomorrow) = nyc_dates();

    mount_weather(&server, &today, &tomorrow, 72.0, 73.0).await;
    // The second contract is outranked AND dead; its log row must carry its
    // real filter reason, not "better_candidate_selected".
    mount_market(
        &server,
        &tomorrow,
        serde_json::json!([
            {"token_id": "tok-70-75", "name": "70-75°F", "best_bid": 0.35, "best_ask": 0.38, "volume": 5000.0},
            {"token_id": "tok-75-80", "name": "75-80°F", "best_bid": 0.10, "best_ask": 0.14, "volume": 0.0}
        ]),
    )
    .await;
    mount_fallbacks(&server).await;

    let config = base_config(&server.uri(), "");
    let mut h = build_harness(&server, config).await;

    let approved = h.scanner.scan(1).await.unwrap();
    let yes: Vec<&Opportunity> = approved.iter().filter(|o| o.side == Side::Yes).collect();
    assert_eq!(yes.len(), 1, "exactly one approved YES expected");
    let op = yes[0];
    assert_eq!(op.venue, Venue::Polymarket);
    assert!((op.ask - 0.38).abs() < 1e-9);
    assert!(op.raw_probability > 0.45 && op.raw_probability < 0.85);
    assert_eq!(op.entry_reason, EntryReason::Model);

    // Approved entries satisfy the expected-value invariant (no bypass).
    let ev = op.corrected_probability * (1.0 - op.ask - op.fee)
        - (1.0 - op.corrected_probability) * op.ask;
    assert!(ev >= 0.0, "approved opportunity has negative EV: {}", ev);

    let trades = h.executor.execute(approved).await;
    assert_eq!(trades.len(), 1);
    let t = &trades[0];
    assert_eq!(t.side, "YES");
    assert!(t.shares >= 1.0);
    assert!((t.cost - t.shares * t.entry_price).abs() < 0.01);
    assert!(t.cost <= 1000.0);
    assert!((h.executor.yes_bankroll() - (1000.0 - t.cost)).abs() < 1e-9);

    {
        let db = h.db.lock().await;
        // Evaluations were logged; exactly one entered row
        let entered: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM opportunities WHERE cycle = 1 AND action = 'entered'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(entered, 1);
        // The trade links back to its opportunity row
        assert!(t.opportunity_id.is_some());

        // The dead second candidate keeps its own filter reason even though
        // the first one outranked it
        let loser_reason: String = db
            .conn
            .query_row(
                "SELECT filter_reason FROM opportunities WHERE cycle = 1 \
                 AND token_id = 'tok-75-80' AND side = 'YES'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(
            loser_reason.contains("zero_volume"),
            "expected real filter reason, got: {}",
            loser_reason
        );
        assert!(!loser_reason.contains("better_candidate_selected"));
    }

    // Scenario 4: the same cycle repeated after the fill.
    let approved2 = h.scanner.scan(2).await.unwrap();
    assert!(approved2.is_empty(), "duplicate must not be re-approved");
    assert!((h.executor.yes_bankroll() - (1000.0 - t.cost)).abs() < 1e-9);

    {
        let db = h.db.lock().await;
        let dup_filtered: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM opportunities WHERE cycle = 2 AND side = 'YES' \
                 AND filter_reason LIKE '%existing_position%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(dup_filtered >= 1, "duplicate evaluation must be logged");
    }
}

// ── Scenario 2: calibration-confirmation bypass. ──

#[tokio::test]
async fn calibration_bypass_approves_negative_edge() {
    let server = MockServer::start().await;
    let (today, tomorrow) = nyc_dates();

    // Forecast well below the range: model probability is small, edge
    // negative at ask 0.28.
    mount_weather(&server, &today, &tomorrow, 67.0, 67.0).await;
    mount_market(
        &server,
        &tomorrow,
        serde_json::json!([
            {"token_id": "tok-70-75", "name": "70-75°F", "best_bid": 0.26, "best_ask": 0.28, "volume": 5000.0}
        ]),
    )
    .await;
    mount_fallbacks(&server).await;

    let config = base_config(&server.uri(), "");
    let h = build_harness(&server, config).await;
    let mut executor = h.executor;

    // Seed 40 resolved evaluations in the (polymarket, bounded, next-day,
    // 25-30c, nyc) bucket with a 42.5% win rate.
    {
        let db = h.db.lock().await;
        let today_naive = chrono::Utc::now().date_naive();
        for i in 0..40i64 {
            let date = (today_naive - chrono::Duration::days(i)).format("%Y-%m-%d").to_string();
            let record = OpportunityRecord {
                cycle: 0,
                city: "nyc".to_string(),
                date,
                venue: "polymarket".to_string(),
                market_id: "m".to_string(),
                token_id: "tok".to_string(),
                range_name: "70-75°F".to_string(),
                range_min: Some(70.0),
                range_max: Some(75.0),
                range_kind: "bounded".to_string(),
                side: "YES".to_string(),
                raw_probability: 0.28,
                corrected_probability: 0.28,
                correction_ratio: 1.0,
                edge_pct: 0.0,
                kelly: 0.0,
                bid: 0.26,
                ask: 0.27,
                spread: 0.02,
                volume: 1000.0,
                hours_to_resolution: Some(30.0),
                forecast_temp: None,
                forecast_stddev: None,
                action: "entered".to_string(),
                filter_reason: None,
                entry_reason: Some("model".to_string()),
                calibration_bucket: None,
                forecast_to_near_edge: None,
                forecast_to_far_edge: None,
                forecast_in_range: None,
                source_disagreement_deg: None,
                market_implied_divergence: None,
            };
            let id = db.insert_opportunity(&record).unwrap();
            let won = i < 17; // 17/40 = 42.5%
            db.conn
                .execute(
                    "UPDATE opportunities SET outcome_yes = ?1 WHERE id = ?2",
                    rusqlite::params![won, id],
                )
                .unwrap();
        }
    }

    let approved = h.scanner.scan(1).await.unwrap();
    let yes: Vec<&Opportunity> = approved.iter().filter(|o| o.side == Side::Yes).collect();
    assert_eq!(yes.len(), 1, "bypass should approve the YES");
    let op = yes[0];
    assert_eq!(op.entry_reason, EntryReason::CalConfirms);
    assert!(op.edge_pct < 5.0, "edge was supposed to be below the minimum");
    assert!(op.kelly > 0.0, "Kelly must be resized from the empirical rate");
    assert_eq!(
        op.calibration_bucket.as_deref(),
        Some("polymarket|bounded|next-day|25-30c|nyc")
    );

    let trades = executor.execute(approved).await;
    assert_eq!(trades.len(), 1, "YES fills; opposite-side NO on the same range is blocked");
    assert_eq!(trades[0].entry_reason, "cal_confirms");
}

// ── Scenario 3: guaranteed-win NO. ──

#[tokio::test]
async fn guaranteed_win_no_entry() {
    let server = MockServer::start().await;
    let tz: chrono_tz::Tz = "America/New_York".parse().unwrap();
    let today = chrono::Utc::now().with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string();

    mount_market(
        &server,
        &today,
        serde_json::json!([
            {"token_id": "tok-60-65", "name": "60-65°F", "best_bid": 0.10, "best_ask": 0.12, "volume": 5000.0}
        ]),
    )
    .await;
    mount_fallbacks(&server).await;

    let config = base_config(&server.uri(), "");
    let h = build_harness(&server, config).await;
    let mut executor = h.executor;

    // Both observation sources have the running high at 68°F, 3°F past the
    // 65°F ceiling.
    {
        let db = h.db.lock().await;
        db.upsert_observation("nyc", &today, "KLGA", Some(20.0), Some(68.0), Some(20.0), Some(68.0), "t1")
            .unwrap();
    }

    let approved = h.scanner.scan_guaranteed_wins().await.unwrap();
    assert_eq!(approved.len(), 1);
    let op = &approved[0];
    assert_eq!(op.side, Side::No);
    assert_eq!(op.entry_reason, EntryReason::GuaranteedWin);
    assert!((op.ask - 0.90).abs() < 1e-9); // 1 − yes_bid
    assert!((op.raw_probability - 1.0).abs() < 1e-12);

    let trades = executor.execute_guaranteed_wins(approved).await;
    assert_eq!(trades.len(), 1);
    let t = &trades[0];
    assert_eq!(t.entry_reason, "guaranteed_win");
    assert!((t.entry_probability - 1.0).abs() < 1e-12);
    // dollars = 0.10 × $1000 NO bankroll → floor(100 / 0.90) = 111 shares
    assert_eq!(t.shares, 111.0);
}

#[tokio::test]
async fn guaranteed_win_metar_only_requires_gap() {
    let server = MockServer::start().await;
    let tz: chrono_tz::Tz = "America/New_York".parse().unwrap();
    let today = chrono::Utc::now().with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string();

    mount_market(
        &server,
        &today,
        serde_json::json!([
            {"token_id": "tok-60-65", "name": "60-65°F", "best_bid": 0.10, "best_ask": 0.12, "volume": 5000.0}
        ]),
    )
    .await;
    mount_fallbacks(&server).await;

    let config = base_config(&server.uri(), "");
    let h = build_harness(&server, config).await;

    // Primary barely over the ceiling (65.5 < 65 + 1.0°F gap), secondary
    // silent → parked as a pending event, not entered.
    {
        let db = h.db.lock().await;
        db.upsert_observation("nyc", &today, "KLGA", Some(18.6), Some(65.5), None, None, "t1")
            .unwrap();
    }
    let approved = h.scanner.scan_guaranteed_wins().await.unwrap();
    assert!(approved.is_empty());
    {
        let db = h.db.lock().await;
        let pending: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM metar_pending_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending, 1);
    }

    // The high climbs past the gap → metar-only entry fires.
    {
        let db = h.db.lock().await;
        db.upsert_observation("nyc", &today, "KLGA", Some(19.4), Some(67.0), None, None, "t2")
            .unwrap();
    }
    let approved = h.scanner.scan_guaranteed_wins().await.unwrap();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].entry_reason, EntryReason::GuaranteedWinMetarOnly);
}

// ── Scenario 5: bankroll depletion. ──

#[tokio::test]
async fn bankroll_depletion_skips_entry() {
    let server = MockServer::start().await;
    let mut config = base_config(&server.uri(), "");
    config.sizing.yes_bankroll = 20.0; // < MIN_BET 25

    let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let venues = Arc::new(
        VenueClient::new(&server.uri(), &server.uri(), TradingMode::Paper, 5).unwrap(),
    );
    let mut executor = Executor::new(
        db.clone(),
        venues,
        Arc::new(Alerts::new()),
        config.sizing.clone(),
        config.guaranteed_entry.clone(),
    )
    .await
    .unwrap();

    let range = Range {
        venue: Venue::Polymarket,
        market_id: "mkt1".to_string(),
        token_id: "tok1".to_string(),
        name: "70-75°F".to_string(),
        min: Some(70.0),
        max: Some(75.0),
        kind: RangeKind::Bounded,
        unit: TempUnit::Fahrenheit,
        bid: 0.35,
        ask: 0.38,
        spread: 0.03,
        volume: 5000.0,
        bid_depth: None,
        ask_depth: None,
    };
    let op = Opportunity {
        opportunity_id: None,
        city: "nyc".to_string(),
        date: "2026-02-20".to_string(),
        venue: Venue::Polymarket,
        range,
        side: Side::Yes,
        raw_probability: 0.52,
        corrected_probability: 0.52,
        correction_ratio: 1.0,
        edge_pct: 14.2,
        kelly: 0.05,
        ask: 0.38,
        bid: 0.35,
        fee: 0.0,
        entry_reason: EntryReason::Model,
        calibration_bucket: None,
        forecast_temp: Some(72.5),
        forecast_stddev_c: Some(2.0),
        hours_to_resolution: Some(20.0),
        source_temps: Vec::new(),
    };

    let trades = executor.execute(vec![op]).await;
    assert!(trades.is_empty());
    assert!(db.lock().await.get_open_trades().unwrap().is_empty());
    assert!((executor.yes_bankroll() - 20.0).abs() < 1e-9);
}

// ── Scenario 6: dual-station stddev inflation. ──

#[tokio::test]
async fn dual_station_widens_stddev() {
    let server = MockServer::start().await;
    let (today, tomorrow) = nyc_dates();
    mount_weather(&server, &today, &tomorrow, 72.0, 72.0).await;
    mount_fallbacks(&server).await;

    // Second city identical except its venues resolve on different stations.
    let extra = r#"
[[cities]]
key = "nyc2"
name = "New York (split stations)"
lat = 40.7128
lon = -74.0060
timezone = "America/New_York"
unit = "F"
station_polymarket = "KLGA"
station_kalshi = "KNYC"
"#;
    let config = base_config(&server.uri(), extra);

    let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
    let sources = Arc::new(
        SourceClient::with_endpoints(SourceEndpoints::single_base(&server.uri()), 30, 5).unwrap(),
    );
    let calibration = Arc::new(CalibrationStore::new(
        db.clone(),
        config.forecasts.clone(),
        config.calibration.clone(),
        config.cities.clone(),
    ));
    let engine = ForecastEngine::new(
        sources,
        calibration,
        db,
        config.forecasts.clone(),
        config.platforms.clone(),
    );

    let single = engine
        .get_forecast(config.city("nyc").unwrap(), &tomorrow)
        .await
        .unwrap()
        .unwrap();
    let dual = engine
        .get_forecast(config.city("nyc2").unwrap(), &tomorrow)
        .await
        .unwrap()
        .unwrap();

    // Same inputs; the split-station city carries ≥ 1°C (× temporal factor)
    // more uncertainty.
    assert!(dual.std_dev_c > single.std_dev_c + 0.99);
}
