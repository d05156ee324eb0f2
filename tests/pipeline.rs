//! End-to-end flow over the in-memory backends: HTTP submission, worker
//! execution against a stubbed sandbox, and client polling.

use std::sync::Arc;
use std::time::Duration;

use coderun::api::{self, AppState, SubmitRequest};
use coderun::execution::PistonClient;
use coderun::poller::{PollPolicy, TaskClient};
use coderun::scheduler::{
    ErrorKind, MemoryQueuePair, QueueClass, QueuePair, ResultStatus, WorkerPool, WorkerPoolConfig,
};
use coderun::store::{MemoryResultStore, ResultStore};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Service {
    api_url: String,
    pool: WorkerPool,
    shutdown: CancellationToken,
}

async fn start_service(sandbox: &MockServer) -> Service {
    let queue: Arc<dyn QueuePair> = Arc::new(MemoryQueuePair::new());
    let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::default());
    let executor = Arc::new(PistonClient::new(format!("{}/execute", sandbox.uri())));

    let config = WorkerPoolConfig::new(2)
        .with_queue_wait(Duration::from_millis(50))
        .with_task_pause(Duration::from_millis(10))
        .with_execution_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut pool = WorkerPool::new(config, Arc::clone(&queue), Arc::clone(&store), executor);
    pool.start().await.expect("pool starts");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let api_url = format!("http://{}", listener.local_addr().expect("local addr"));
    let shutdown = CancellationToken::new();
    tokio::spawn(api::serve(
        listener,
        AppState::new(queue, store),
        shutdown.clone(),
    ));

    Service {
        api_url,
        pool,
        shutdown,
    }
}

impl Service {
    async fn stop(mut self) {
        self.shutdown.cancel();
        self.pool.shutdown().await.expect("pool stops");
    }
}

fn policy() -> PollPolicy {
    PollPolicy::default()
        .with_interval(Duration::from_millis(20))
        .with_max_wait(Some(Duration::from_secs(10)))
}

#[tokio::test]
async fn test_submission_runs_and_result_is_polled() {
    let sandbox = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .and(body_partial_json(json!({
            "language": "python",
            "files": [{ "name": "main.py", "content": "print(input())" }],
            "stdin": "hello"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "run": { "output": "hello\n" } })),
        )
        .expect(1)
        .mount(&sandbox)
        .await;

    let service = start_service(&sandbox).await;
    let client = TaskClient::new(service.api_url.clone());

    let request = SubmitRequest::new("py", "print(input())")
        .with_action(QueueClass::Submit)
        .with_stdin("hello");
    let record = client
        .run_to_completion(&request, &policy())
        .await
        .expect("task completes");

    assert_eq!(record.status, ResultStatus::Completed);
    assert_eq!(record.output, "hello\n");

    service.stop().await;
}

#[tokio::test]
async fn test_sandbox_rejection_becomes_error_result() {
    let sandbox = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "message": "brainfork-* runtime is unknown" })),
        )
        .mount(&sandbox)
        .await;

    let service = start_service(&sandbox).await;
    let client = TaskClient::new(service.api_url.clone());

    let accepted = client
        .submit(&SubmitRequest::new("brainfork", "+++."))
        .await
        .expect("accepted");
    assert_eq!(accepted.queue_class, QueueClass::Run);

    let record = client
        .poll(&accepted.task_id, &policy())
        .await
        .expect("result committed");

    assert_eq!(record.status, ResultStatus::Error);
    assert_eq!(record.error_kind, Some(ErrorKind::Remote));
    assert!(record.output.contains("runtime is unknown"));

    service.stop().await;
}
