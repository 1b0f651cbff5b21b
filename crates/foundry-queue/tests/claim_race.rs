#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Several queues polling one store concurrently must never dispatch the same
//! job twice, nor run a job past its retry bound.

use async_trait::async_trait;
use foundry_core::{
    ChatMessage, EventBus, FoundryError, FoundryResult, JobStatus, Project, QueueConfig,
};
use foundry_queue::{ChatResponse, JobQueue, JobRequest, ProviderClient, ProviderRegistry};
use foundry_store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Counts calls per prompt. Each job carries its own id in the prompt.
#[derive(Default)]
struct CountingProvider {
    calls: Mutex<HashMap<String, usize>>,
    /// Answer every call with a transient error.
    failing: bool,
}

#[async_trait]
impl ProviderClient for CountingProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u32,
    ) -> FoundryResult<ChatResponse> {
        let key = messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        *self.calls.lock().entry(key).or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.failing {
            return Err(FoundryError::Provider("503 overloaded".into()));
        }
        Ok(ChatResponse {
            content: "ok".into(),
            input_tokens: 1,
            output_tokens: 1,
        })
    }
}

const POLLERS: usize = 4;
const JOBS: usize = 40;

fn queues_on(
    store: &Arc<Store>,
    provider: &Arc<CountingProvider>,
    config: &QueueConfig,
) -> Vec<Arc<JobQueue>> {
    (0..POLLERS)
        .map(|_| {
            let providers = ProviderRegistry::new()
                .with("counting", Arc::clone(provider) as Arc<dyn ProviderClient>);
            Arc::new(
                JobQueue::new(
                    Arc::clone(store),
                    Arc::new(EventBus::new()),
                    providers,
                    config.clone(),
                )
                .unwrap(),
            )
        })
        .collect()
}

fn submit_all(queues: &[Arc<JobQueue>], project: &Project) -> Vec<Uuid> {
    (0..JOBS)
        .map(|n| {
            let request = JobRequest::new(
                project.id,
                Uuid::new_v4(),
                "counting",
                "m",
                vec![ChatMessage::user(format!("job-{n}"))],
            );
            queues[n % POLLERS].submit(request).unwrap()
        })
        .collect()
}

/// Poll with every queue at once until `target` jobs reach `status`.
async fn run_until(store: &Store, queues: &[Arc<JobQueue>], status: JobStatus, target: usize) {
    for _ in 0..100 {
        let rounds: Vec<_> = queues
            .iter()
            .map(|queue| {
                let queue = Arc::clone(queue);
                tokio::spawn(async move { queue.poll_once().await.unwrap() })
            })
            .collect();
        for round in rounds {
            round.await.unwrap();
        }

        let done = store
            .read(|db| db.list_jobs_with_status(status))
            .unwrap()
            .len();
        if done == target {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for queue in queues {
        queue.shutdown().await;
    }
}

fn seeded() -> (Arc<Store>, Project) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let project = Project::new("race");
    store.transaction(|db| db.insert_project(&project)).unwrap();
    (store, project)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pollers_dispatch_each_job_once() {
    let (store, project) = seeded();
    let provider = Arc::new(CountingProvider::default());
    let config = QueueConfig {
        batch_size: JOBS,
        max_workers: 16,
        default_provider_concurrency: 16,
        ..QueueConfig::default()
    };
    let queues = queues_on(&store, &provider, &config);
    let ids = submit_all(&queues, &project);

    run_until(&store, &queues, JobStatus::Completed, JOBS).await;

    let calls = provider.calls.lock();
    assert_eq!(calls.len(), JOBS, "every job dispatched");
    assert!(
        calls.values().all(|&n| n == 1),
        "a job was dispatched more than once: {calls:?}"
    );
    for id in ids {
        let job = store.read(|db| db.require_job(id)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_bound_holds_across_pollers() {
    let (store, project) = seeded();
    let provider = Arc::new(CountingProvider {
        failing: true,
        ..CountingProvider::default()
    });
    let config = QueueConfig {
        batch_size: JOBS,
        max_workers: 16,
        max_job_retries: 2,
        default_provider_concurrency: 16,
        ..QueueConfig::default()
    };
    let queues = queues_on(&store, &provider, &config);
    let ids = submit_all(&queues, &project);

    run_until(&store, &queues, JobStatus::Failed, JOBS).await;

    let calls = provider.calls.lock();
    assert!(
        calls.values().all(|&n| n == 3),
        "a job ran more often than its retry bound allows: {calls:?}"
    );
    for id in ids {
        let job = store.read(|db| db.require_job(id)).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
    }
}
