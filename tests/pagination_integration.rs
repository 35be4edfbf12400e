use esi_pager::{Config, ErrorKind, Executor, FetchError, PageFetcher};
use httpmock::{Method::GET, Mock, MockServer};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const ORDERS: &str = "/markets/10000002/orders/";
const LAST_MODIFIED: &str = "Mon, 01 Apr 2024 11:55:00 GMT";

fn fetcher(server: &MockServer) -> PageFetcher {
    PageFetcher::new(Executor::new(Config::new(server.base_url()).with_timeout_secs(10)).unwrap())
}

async fn page<'a>(
    server: &'a MockServer,
    n: u32,
    total: u32,
    items: serde_json::Value,
    last_modified: &str,
    delay_ms: u64,
) -> Mock<'a> {
    let last_modified = last_modified.to_string();
    server
        .mock_async(move |when, then| {
            when.method(GET)
                .path(ORDERS)
                .query_param("page", n.to_string().as_str());
            then.status(200)
                .header("x-pages", total.to_string().as_str())
                .header("last-modified", last_modified.as_str())
                .delay(Duration::from_millis(delay_ms))
                .json_body(items);
        })
        .await
}

#[tokio::test]
async fn merges_pages_in_order_regardless_of_arrival() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let p1 = page(&server, 1, 4, json!([1, 2]), LAST_MODIFIED, 0).await;
    // Later pages answer faster than earlier ones.
    let p2 = page(&server, 2, 4, json!([3, 4]), LAST_MODIFIED, 400).await;
    let p3 = page(&server, 3, 4, json!([5]), LAST_MODIFIED, 200).await;
    let p4 = page(&server, 4, 4, json!([6, 7, 8]), LAST_MODIFIED, 0).await;

    let result = fetcher(&server).fetch_all::<u32>(ORDERS, None).await?;

    for m in [&p1, &p2, &p3, &p4] {
        m.assert_hits_async(1).await;
    }
    assert_eq!(result.total_pages, 4);
    assert_eq!(result.items, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(result.missing_pages.is_empty());
    assert!(result.warnings.is_empty());
    assert!(result.is_complete());
    Ok(())
}

#[tokio::test]
async fn single_page_when_header_absent() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path("/markets/prices/").query_param("page", "1");
            then.status(200).json_body(json!([10, 20]));
        })
        .await;

    let result = fetcher(&server)
        .fetch_all::<u32>("/markets/prices/", None)
        .await?;
    m.assert_hits_async(1).await;
    assert_eq!(result.total_pages, 1);
    assert_eq!(result.items, vec![10, 20]);
    Ok(())
}

#[tokio::test]
async fn last_modified_mismatch_warns_but_keeps_data() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 3, json!([1]), LAST_MODIFIED, 0).await;
    page(&server, 2, 3, json!([2]), "Mon, 01 Apr 2024 12:00:00 GMT", 0).await;
    page(&server, 3, 3, json!([3]), LAST_MODIFIED, 0).await;

    let result = fetcher(&server).fetch_all::<u32>(ORDERS, None).await?;

    assert_eq!(result.items, vec![1, 2, 3]);
    assert_eq!(result.warnings.len(), 1);
    let w = &result.warnings[0];
    assert_eq!(w.page, 2);
    assert_ne!(w.reference, w.observed);
    let text = w.to_string();
    assert!(text.contains("11:55:00"), "{text}");
    assert!(text.contains("12:00:00"), "{text}");
    Ok(())
}

#[tokio::test]
async fn failed_trailing_page_is_reported_missing() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 5, json!([1]), LAST_MODIFIED, 0).await;
    page(&server, 2, 5, json!([2]), LAST_MODIFIED, 0).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ORDERS).query_param("page", "3");
            then.status(500).body("{\"error\":\"Internal server error\"}");
        })
        .await;
    page(&server, 4, 5, json!([4]), LAST_MODIFIED, 0).await;
    page(&server, 5, 5, json!([5]), LAST_MODIFIED, 0).await;

    let result = fetcher(&server).fetch_all::<u32>(ORDERS, None).await?;

    assert_eq!(result.items, vec![1, 2, 4, 5]);
    assert_eq!(result.missing_pages, vec![3]);
    assert_eq!(result.missing_count(), 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].kind, Some(ErrorKind::ServerError));
    assert!(!result.is_complete());
    Ok(())
}

#[tokio::test]
async fn first_page_failure_fails_the_fetch() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ORDERS).query_param("page", "1");
            then.status(404).body("{\"error\":\"Not found\"}");
        })
        .await;
    let trailing = server
        .mock_async(|when, then| {
            when.method(GET).path(ORDERS).query_param("page", "2");
            then.status(200).json_body(json!([]));
        })
        .await;

    let err = fetcher(&server)
        .fetch_all::<u32>(ORDERS, None)
        .await
        .unwrap_err();
    match err {
        FetchError::Api(e) => assert_eq!(e.kind, ErrorKind::NotFound),
        other => panic!("expected api error, got {other}"),
    }
    trailing.assert_hits_async(0).await;
}

#[tokio::test]
async fn concurrency_ceiling_bounds_fan_out() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 5, json!([0]), LAST_MODIFIED, 0).await;
    for n in 2..=5 {
        page(&server, n, 5, json!([n]), LAST_MODIFIED, 300).await;
    }

    let started = Instant::now();
    let result = fetcher(&server)
        .with_max_concurrent_pages(2)
        .fetch_all::<u32>(ORDERS, None)
        .await?;
    // Four 300ms pages, two at a time: at least two rounds.
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(result.items, vec![0, 2, 3, 4, 5]);
    Ok(())
}

#[tokio::test]
async fn cancellation_returns_completed_pages() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 3, json!([1]), LAST_MODIFIED, 0).await;
    page(&server, 2, 3, json!([2]), LAST_MODIFIED, 0).await;
    page(&server, 3, 3, json!([3]), LAST_MODIFIED, 5_000).await;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = tx.send(true);
    });

    let started = Instant::now();
    let result = fetcher(&server)
        .fetch_all_until::<u32>(ORDERS, None, rx)
        .await?;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(result.cancelled);
    assert_eq!(result.items, vec![1, 2]);
    assert_eq!(result.missing_pages, vec![3]);
    Ok(())
}

#[tokio::test]
async fn error_limit_mid_fetch_stops_remaining_pages() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 4, json!([1]), LAST_MODIFIED, 0).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(ORDERS).query_param("page", "2");
            then.status(420).header("x-esi-error-limit-reset", "30");
        })
        .await;
    let p3 = page(&server, 3, 4, json!([3]), LAST_MODIFIED, 0).await;
    let p4 = page(&server, 4, 4, json!([4]), LAST_MODIFIED, 0).await;

    let fetcher = fetcher(&server).with_max_concurrent_pages(1);
    let result = fetcher.fetch_all::<u32>(ORDERS, None).await?;

    assert_eq!(result.items, vec![1]);
    assert_eq!(result.missing_pages, vec![2, 3, 4]);
    assert_eq!(
        result.failures[0].kind,
        Some(ErrorKind::ErrorBudgetExhausted {
            reset_seconds: Some(30)
        })
    );
    assert!(fetcher.executor().gate().is_locked());
    p3.assert_hits_async(0).await;
    p4.assert_hits_async(0).await;
    Ok(())
}

#[tokio::test]
async fn page_count_comes_from_first_page_only() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    let p1 = page(&server, 1, 3, json!([1]), LAST_MODIFIED, 0).await;
    let p2 = page(&server, 2, 7, json!([2]), LAST_MODIFIED, 0).await;
    let p3 = server
        .mock_async(|when, then| {
            when.method(GET).path(ORDERS).query_param("page", "3");
            then.status(200)
                .header("last-modified", LAST_MODIFIED)
                .json_body(json!([3]));
        })
        .await;
    let mut beyond = Vec::new();
    for n in 4..=7 {
        beyond.push(page(&server, n, 7, json!([n]), LAST_MODIFIED, 0).await);
    }

    let result = fetcher(&server).fetch_all::<u32>(ORDERS, None).await?;

    for m in [&p1, &p2, &p3] {
        m.assert_hits_async(1).await;
    }
    for m in &beyond {
        m.assert_hits_async(0).await;
    }
    assert_eq!(result.total_pages, 3);
    assert_eq!(result.items, vec![1, 2, 3]);
    assert!(result.is_complete());
    Ok(())
}

#[tokio::test]
async fn absurd_page_count_is_capped() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, u32::MAX, json!([1]), LAST_MODIFIED, 0).await;
    page(&server, 2, u32::MAX, json!([2]), LAST_MODIFIED, 0).await;
    page(&server, 3, u32::MAX, json!([3]), LAST_MODIFIED, 0).await;
    let p4 = page(&server, 4, u32::MAX, json!([4]), LAST_MODIFIED, 0).await;

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        fetcher(&server)
            .with_max_pages(3)
            .fetch_all::<u32>(ORDERS, None),
    )
    .await??;

    p4.assert_hits_async(0).await;
    assert_eq!(result.total_pages, u32::MAX);
    assert_eq!(result.items, vec![1, 2, 3]);
    assert!(result.missing_pages.is_empty());
    assert_eq!(result.unrequested_pages, u32::MAX - 3);
    assert!(!result.is_complete());
    Ok(())
}

#[tokio::test]
async fn page_ceiling_comes_from_config() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    page(&server, 1, 5, json!([1]), LAST_MODIFIED, 0).await;
    page(&server, 2, 5, json!([2]), LAST_MODIFIED, 0).await;
    let p3 = page(&server, 3, 5, json!([3]), LAST_MODIFIED, 0).await;

    let exec = Executor::new(
        Config::new(server.base_url())
            .with_timeout_secs(10)
            .with_max_pages(2),
    )?;
    let result = PageFetcher::new(exec).fetch_all::<u32>(ORDERS, None).await?;

    p3.assert_hits_async(0).await;
    assert_eq!(result.items, vec![1, 2]);
    assert_eq!(result.unrequested_pages, 3);
    assert_eq!(result.missing_count(), 3);
    Ok(())
}
