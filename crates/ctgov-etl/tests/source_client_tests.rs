//! Registry API client tests
//!
//! Run the real HTTP client against a wiremock server speaking the v2
//! `studies` protocol: pagination by `nextPageToken`, fail-fast on non-2xx
//! and the record cap.

use std::sync::Arc;

use ctgov_etl::config::SourceConfig;
use ctgov_etl::source::{ClinicalTrialsClient, PaginatedReader, StudyQuery, StudySource};
use ctgov_etl::PipelineError;
use serde_json::{json, Value};
use wiremock::{
    matchers::{header, method, path, query_param, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

fn study(nct_id: &str) -> Value {
    json!({
        "protocolSection": {
            "identificationModule": { "nctId": nct_id, "briefTitle": format!("Study {}", nct_id) },
            "statusModule": { "overallStatus": "COMPLETED", "studyFirstSubmitDate": "2020-01-15" },
            "designModule": { "phases": ["PHASE3"] }
        }
    })
}

fn page(ids: std::ops::Range<usize>, next: Option<&str>) -> Value {
    let studies: Vec<Value> = ids.map(|i| study(&format!("NCT{:08}", i))).collect();
    match next {
        Some(token) => json!({ "studies": studies, "nextPageToken": token }),
        None => json!({ "studies": studies }),
    }
}

fn client(server: &MockServer) -> ClinicalTrialsClient {
    let config = SourceConfig {
        base_url: server.uri(),
        ..SourceConfig::default()
    };
    ClinicalTrialsClient::new(&config).unwrap()
}

async fn mount_two_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(0..300, Some("page-2"))))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(300..450, None)))
        .expect(1)
        .mount(server)
        .await;
}

// ============================================================================
// Single page
// ============================================================================

#[tokio::test]
async fn test_fetch_sends_query_parameters() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("format", "json"))
        .and(query_param("pageSize", "100"))
        .and(query_param("query.term", "asthma"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(0..2, None)))
        .expect(1)
        .mount(&server)
        .await;

    let query = StudyQuery::new(100).with_term("asthma");
    let page = client(&server).fetch(&query, None).await.unwrap();

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.next_page_token, None);
    let first = &page.records[0];
    assert_eq!(first.nct_id.as_deref(), Some("NCT00000000"));
    assert_eq!(first.phase.as_deref(), Some("PHASE3"));
    assert_eq!(first.data_source.as_deref(), Some("clinical_trials_api"));
    assert!(first.extraction_timestamp.is_some());
}

#[tokio::test]
async fn test_non_success_status_is_source_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch(&StudyQuery::new(10), None)
        .await
        .unwrap_err();

    match err {
        PipelineError::SourceUnavailable(message) => assert!(message.contains("503")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_body_is_source_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch(&StudyQuery::new(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
}

#[tokio::test]
async fn test_empty_token_means_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "studies": [],
            "nextPageToken": ""
        })))
        .mount(&server)
        .await;

    let page = client(&server).fetch(&StudyQuery::new(10), None).await.unwrap();
    assert!(page.records.is_empty());
    assert_eq!(page.next_page_token, None);
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn test_reader_follows_next_page_token() {
    let server = MockServer::start().await;
    mount_two_pages(&server).await;

    let mut reader = PaginatedReader::new(Arc::new(client(&server)), StudyQuery::new(300));
    let mut sizes = Vec::new();
    while let Some(records) = reader.next_page().await.unwrap() {
        sizes.push(records.len());
    }

    assert_eq!(sizes, vec![300, 150]);
    assert_eq!(reader.records_read(), 450);
    assert_eq!(reader.pages_fetched(), 2);
}

#[tokio::test]
async fn test_reader_stops_at_max_records() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(0..300, Some("page-2"))))
        .expect(1)
        .mount(&server)
        .await;

    let mut reader = PaginatedReader::new(Arc::new(client(&server)), StudyQuery::new(300))
        .with_max_records(Some(120));

    let first = reader.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 120);
    assert!(reader.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn test_failure_on_later_page_keeps_earlier_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(0..10, Some("page-2"))))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/studies"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut reader = PaginatedReader::new(Arc::new(client(&server)), StudyQuery::new(10));
    let first = reader.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 10);

    let err = reader.next_page().await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert_eq!(reader.records_read(), 10);
}
