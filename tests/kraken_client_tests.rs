// Integration tests for the Kraken REST market data adapter against a mock server

mod common;

use common::{create_test_config, start_time, Harness, BTC};
use grid_trading_engine::clients::MarketDataError;
use grid_trading_engine::core::FixedClock;
use grid_trading_engine::{Collaborators, GridEngine, KrakenMarketData, MarketDataSource};
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;

/// Hourly OHLC rows ending `hours_ago` before the test clock, closes rising by 1.0
fn ohlc_body(count: usize, hours_ago: i64, last_close: f64) -> String {
    let end = start_time().timestamp() - hours_ago * 3600;
    let rows: Vec<_> = (0..count)
        .map(|i| {
            let back = (count - 1 - i) as i64;
            let close = last_close - back as f64;
            json!([
                end - back * 3600,
                format!("{:.1}", close - 0.5),
                format!("{:.1}", close + 1.0),
                format!("{:.1}", close - 1.0),
                format!("{:.1}", close),
                format!("{:.1}", close),
                "12.5",
                40
            ])
        })
        .collect();
    json!({ "error": [], "result": { "XXBTZUSD": rows, "last": end } }).to_string()
}

fn client(server: &mockito::ServerGuard) -> KrakenMarketData {
    KrakenMarketData::with_base_url(&server.url(), 60).with_clock(Arc::new(FixedClock::new(start_time())))
}

#[tokio::test]
async fn test_candles_trimmed_to_window() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/0/public/OHLC")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("pair".into(), "XBTUSDT".into()),
            Matcher::UrlEncoded("interval".into(), "60".into()),
        ]))
        .with_status(200)
        .with_body(ohlc_body(5, 0, 50_000.0))
        .create_async()
        .await;

    let candles = client(&server).get_candles(BTC, 3).await.expect("candles");

    mock.assert_async().await;
    assert_eq!(candles.len(), 3);
    assert_eq!(candles[2].close, 50_000.0);
    assert_eq!(candles[0].close, 49_998.0);
    assert_eq!(candles[2].timestamp, start_time());
    assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_old_candles_are_stale() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/0/public/OHLC")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(ohlc_body(5, 4, 50_000.0))
        .create_async()
        .await;

    let result = client(&server).get_candles(BTC, 5).await;
    assert_eq!(
        result,
        Err(MarketDataError::Stale { pair: BTC.to_string(), age_secs: 4 * 3600 })
    );
}

#[tokio::test]
async fn test_ticker_last_trade_price() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/0/public/Ticker")
        .match_query(Matcher::UrlEncoded("pair".into(), "XBTUSDT".into()))
        .with_status(200)
        .with_body(r#"{"error":[],"result":{"XXBTZUSD":{"a":["50124.0","1","1.000"],"c":["50123.4","0.01"]}}}"#)
        .create_async()
        .await;

    let price = client(&server).get_current_price(BTC).await.expect("price");
    assert_eq!(price, 50_123.4);
}

#[tokio::test]
async fn test_unknown_pair_is_classified() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/0/public/Ticker")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"error":["EQuery:Unknown asset pair"]}"#)
        .create_async()
        .await;

    let result = client(&server).get_current_price("FOO/BAR").await;
    assert!(matches!(result, Err(MarketDataError::UnknownPair(_))));
}

#[tokio::test]
async fn test_http_error_is_unavailable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/0/public/Ticker")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let result = client(&server).get_current_price(BTC).await;
    assert!(matches!(result, Err(MarketDataError::Unavailable(message)) if message.contains("503")));
}

#[tokio::test]
async fn test_engine_cycle_over_kraken_adapter() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/0/public/OHLC")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(ohlc_body(120, 0, 50_000.0))
        .create_async()
        .await;
    server
        .mock("GET", "/0/public/Ticker")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"error":[],"result":{"XXBTZUSD":{"c":["50000.0","0.01"]}}}"#)
        .create_async()
        .await;

    let harness = Harness::new();
    let collaborators = Collaborators {
        market_data: Arc::new(client(&server)),
        ..harness.collaborators()
    };
    let engine = GridEngine::new(create_test_config(), collaborators).expect("valid config");

    let report = engine.run_cycle().await;
    assert!(report.failures.is_empty());
    let btc = report.pair(BTC).unwrap();
    assert_eq!(btc.price, 50_000.0);
    assert_eq!(btc.generation, 1);

    let snapshot = engine.snapshot();
    let grid = snapshot.pair(BTC).unwrap().grid.clone().unwrap();
    assert_eq!(grid.centre, 50_000.0);
}
