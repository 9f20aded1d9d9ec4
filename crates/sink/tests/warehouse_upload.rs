use normalizer::PullRequestRecord;
use serde_json::json;
use sink::{RecordSink, SinkError, WarehouseSink};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INSERT_PATH: &str = "/projects/proj/datasets/gh/tables/prs/insertAll";

fn record(id: i64) -> PullRequestRecord {
    PullRequestRecord {
        id,
        record_timestamp: "2024-05-01T00:00:00Z".into(),
        additions: Some(3),
        deletions: Some(1),
        author: Some("alice".into()),
        state: "closed".into(),
        created_at: "2024-04-01T00:00:00Z".into(),
        updated_at: "2024-04-02T00:00:00Z".into(),
        closed_at: Some("2024-04-02T00:00:00Z".into()),
        title: format!("PR {id}"),
        url: format!("https://github.com/acme/widgets/pull/{id}"),
        body: None,
        reviews: vec![],
        repo: "widgets".into(),
        owner: "acme".into(),
    }
}

fn sink_for(server: &MockServer) -> WarehouseSink {
    WarehouseSink::new(&server.uri(), "proj", "gh", "prs", "secret".into()).unwrap()
}

#[tokio::test]
async fn posts_rows_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INSERT_PATH))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "rows": [
                { "insertId": "1-2024-04-02T00:00:00Z", "json": { "id": 1, "owner": "acme" } },
                { "insertId": "2-2024-04-02T00:00:00Z" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "bigquery#tableDataInsertAllResponse"
        })))
        .expect(1)
        .mount(&server)
        .await;

    sink_for(&server)
        .upload(&[record(1), record(2)])
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_batch_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    sink_for(&server).upload(&[]).await.unwrap();
}

#[tokio::test]
async fn row_level_errors_fail_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INSERT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "insertErrors": [
                { "index": 1, "errors": [{ "reason": "invalid", "message": "no such field" }] }
            ]
        })))
        .mount(&server)
        .await;

    let err = sink_for(&server)
        .upload(&[record(1), record(2)])
        .await
        .unwrap_err();
    match err {
        SinkError::Rejected { count, first } => {
            assert_eq!(count, 1);
            assert!(first.contains("record 2"), "{first}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_surface_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INSERT_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend unavailable"))
        .mount(&server)
        .await;

    let err = sink_for(&server).upload(&[record(1)]).await.unwrap_err();
    assert!(matches!(
        err,
        SinkError::Status { status: 503, ref body } if body == "backend unavailable"
    ));
}
