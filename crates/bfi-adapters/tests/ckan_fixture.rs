// Decodes checked-in datastore_search_sql responses and normalizes them the
// way a sync run does.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bfi_adapters::{
    load_fixture_page, parse_datastore_page, CkanDatastore, FetchError, FetchWindow, PageSource,
};
use bfi_core::InspectionRecord;
use bfi_storage::{HttpClientConfig, HttpError, HttpFetcher};
use chrono::NaiveDate;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/ckan")
        .join(name)
}

#[test]
fn sample_page_normalizes_every_record() {
    let records = load_fixture_page(fixture("datastore_search_sql_page.json")).expect("fixture page");
    assert_eq!(records.len(), 4);

    let rows = records.iter().map(InspectionRecord::from_raw).collect::<Vec<_>>();

    assert_eq!(
        rows[0].inspection_key,
        "Sullivan's Castle Island_2026-02-20 10:15:00_37"
    );
    assert_eq!(rows[0].latitude(), Some(42.33706));
    assert_eq!(rows[0].license_issued_date.as_deref(), Some("2025-03-14 10:12:00"));

    // Two violations from the same visit keep distinct identities.
    assert_ne!(rows[0].inspection_key, rows[1].inspection_key);

    assert_eq!(rows[2].inspection_key, "UNKNOWN_2026-02-18 14:00:00_8");
    assert_eq!(rows[2].coordinates, None);

    assert_eq!(rows[3].inspection_key, "Harbor Food Truck_2026-02-17 09:00:00_");
    assert_eq!(rows[3].violation_code, None);
    assert_eq!(rows[3].coordinates, None);
}

#[test]
fn error_envelope_is_reported_as_api_error() {
    let body = std::fs::read(fixture("datastore_search_sql_error.json")).expect("fixture");
    match parse_datastore_page(&body) {
        Err(FetchError::Api(message)) => {
            assert_eq!(message, "relation \"missing-resource\" does not exist")
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

/// Serves `body` with `status` to every connection, counting requests.
async fn datastore_stub(status: u16, body: String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/api/3/action/datastore_search_sql", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (url, hits)
}

fn datastore(url: String) -> CkanDatastore {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    CkanDatastore::new(http, url, "4582bec6-2b4f-4f9e-bc55-cbaa73117f4c")
}

fn window() -> FetchWindow {
    FetchWindow::trailing_days(90, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
}

#[tokio::test]
async fn client_error_with_envelope_surfaces_the_api_message() {
    let body = r#"{"success": false, "error": {"message": "bad sql"}}"#.to_string();
    let (url, hits) = datastore_stub(409, body).await;

    let err = datastore(url).fetch_page(&window(), 100, 0).await.unwrap_err();

    assert!(matches!(err, FetchError::Api(ref message) if message == "bad sql"));
    assert_eq!(err.to_string(), "CKAN API error: bad sql");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_error_without_envelope_keeps_the_http_status() {
    let (url, hits) = datastore_stub(404, "<html>not here</html>".to_string()).await;

    let err = datastore(url).fetch_page(&window(), 100, 0).await.unwrap_err();

    assert!(matches!(err, FetchError::Http(HttpError::HttpStatus { status: 404, .. })));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn successful_response_decodes_the_page() {
    let body = std::fs::read_to_string(fixture("datastore_search_sql_page.json")).expect("fixture");
    let (url, _) = datastore_stub(200, body).await;

    let records = datastore(url).fetch_page(&window(), 100, 0).await.expect("page");

    assert_eq!(records.len(), 4);
}
