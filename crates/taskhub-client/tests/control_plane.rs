use serde_json::json;
use std::sync::Arc;
use taskhub_broker::MemoryBroker;
use taskhub_client::{ClientError, ControlPlaneClient};
use taskhub_core::api::{ListTasksQuery, RegisterWorkerRequest, ReportAttemptRequest};
use taskhub_core::{AttemptReport, QueueGroup};
use taskhub_persistence::MemoryStore;
use taskhub_server::api::create_rest_api;
use taskhub_server::metrics::HubMetrics;
use taskhub_server::Hub;

async fn spawn_hub() -> ControlPlaneClient {
    let hub = Hub::new(
        Arc::new(MemoryStore::new()),
        Some(Arc::new(MemoryBroker::default())),
        Arc::new(HubMetrics::new().unwrap()),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_rest_api(Arc::new(hub))).await.unwrap();
    });

    ControlPlaneClient::new(format!("http://{addr}")).unwrap()
}

fn registration() -> RegisterWorkerRequest {
    RegisterWorkerRequest {
        worker_name: "w1-worker".into(),
        base_url: String::new(),
        broker_address: String::new(),
        queue_groups: vec![QueueGroup::new("jobs", 5)],
        default_retry_count: 0,
        default_timeout_seconds: 0,
        default_delay_seconds: 0,
        overwrite: false,
    }
}

#[tokio::test]
async fn test_register_enqueue_report_replay() {
    let client = spawn_hub().await;

    let registered = client.register_worker(&registration()).await.unwrap();
    assert_eq!(registered.status, "registered");
    client.heartbeat("w1-worker").await.unwrap();

    let created = client
        .enqueue("w1-worker", "jobs", Some("critical"), None, &json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(created.status, "enqueued");

    let started = chrono::Utc::now();
    let running = AttemptReport::running(1, "w1-worker");
    client
        .report_attempt(&created.task_id, &ReportAttemptRequest::from(&running))
        .await
        .unwrap();
    let done = AttemptReport::finished(1, "w1-worker", started, chrono::Utc::now(), None);
    client
        .report_attempt(&created.task_id, &ReportAttemptRequest::from(&done))
        .await
        .unwrap();

    let detail = client.get_task(&created.task_id).await.unwrap();
    assert_eq!(detail.item.status.as_str(), "success");
    assert_eq!(detail.item.priority_name, "critical");
    assert_eq!(detail.attempts.len(), 2);

    let replayed = client.replay(&created.task_id, None).await.unwrap();
    assert_ne!(replayed.new_task_id, created.task_id);

    let listed = client
        .list_tasks(&ListTasksQuery {
            worker_name: Some("w1-worker".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.total, 2);
}

#[tokio::test]
async fn test_error_kinds() {
    let client = spawn_hub().await;

    assert!(matches!(
        client.heartbeat("w1-worker").await,
        Err(ClientError::NotFound(_))
    ));

    let err = client
        .enqueue("ab", "jobs", None, None, &json!({}))
        .await
        .unwrap_err();
    match err {
        ClientError::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("unexpected error: {other:?}"),
    }
}
