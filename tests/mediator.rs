//! Runner status reporting and mediator-driven runner selection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{runner_config, wait_until, MemoryNetwork};
use taskwire::{
    Mediator, MediatorConfig, Runner, RunnerFilter, Target, TaskClient, TaskConfig, TaskwireError, WorkContext,
    WorkError, WorkUnit,
};

const MEDIATOR: &str = "mediator:7400";

fn start_mediator(network: &MemoryNetwork) -> Mediator {
    let mediator = Mediator::new(MediatorConfig::default());
    network.add_mediator(MEDIATOR, mediator.clone());
    mediator
}

/// Start a runner that reports to the mediator and answers `whoami` with its id.
fn start_runner(network: &Arc<MemoryNetwork>, id: &str, slots: usize, tags: &[&str]) -> Runner {
    let mut config = runner_config(id, slots);
    config.mediator = Some(MEDIATOR.to_string());
    config.tags = tags.iter().map(|t| t.to_string()).collect();

    let name = id.to_string();
    let runner = Runner::builder(config)
        .function("whoami", move |_: (), _ctx: WorkContext| {
            let name = name.clone();
            async move { Ok::<_, WorkError>(name) }
        })
        .build()
        .unwrap();
    network.add_runner(id, runner.clone());
    runner.start_status_reporter(network.clone()).unwrap();
    runner
}

fn via_mediator(filter: RunnerFilter) -> TaskConfig {
    TaskConfig::new(Target::Mediator(MEDIATOR.to_string()))
        .with_filter(filter)
        .with_retry_delay(Duration::ZERO)
}

#[tokio::test]
async fn test_runners_register_with_mediator() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);
    start_runner(&network, "runner-a", 2, &[]);
    start_runner(&network, "runner-b", 2, &[]);

    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 2).await);
    let record = mediator.table().get("runner-a").unwrap();
    assert_eq!(record.endpoint, "runner-a");
    assert_eq!(record.available_slots, 2);
}

#[tokio::test]
async fn test_task_runs_on_runner_with_most_slots() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);
    start_runner(&network, "small", 1, &[]);
    start_runner(&network, "large", 5, &[]);
    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 2).await);

    let done = TaskClient::new(via_mediator(RunnerFilter::default()), network.clone())
        .submit(WorkUnit::new("whoami", &()).unwrap())
        .await
        .unwrap();
    assert_eq!(done.decode_output::<String>().unwrap(), "large");
}

#[tokio::test]
async fn test_tag_filter_picks_matching_runner() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);
    start_runner(&network, "cpu-box", 8, &[]);
    start_runner(&network, "gpu-box", 1, &["gpu"]);
    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 2).await);

    let done = TaskClient::new(via_mediator(RunnerFilter::default().with_tag("gpu")), network.clone())
        .submit(WorkUnit::new("whoami", &()).unwrap())
        .await
        .unwrap();
    assert_eq!(done.decode_output::<String>().unwrap(), "gpu-box");
}

#[tokio::test]
async fn test_no_matching_runner_exhausts_retries() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);
    start_runner(&network, "gpu-box", 2, &["gpu"]);
    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 1).await);

    let config = via_mediator(RunnerFilter::default().with_tag("tpu")).with_max_tries(2);
    let err = TaskClient::new(config, network.clone())
        .submit(WorkUnit::new("whoami", &()).unwrap())
        .await
        .unwrap_err();

    match err {
        TaskwireError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, TaskwireError::NoAvailableRunner(_)));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_removes_runner_from_mediator() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);
    let runner = start_runner(&network, "runner-a", 2, &[]);
    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 1).await);

    runner.shutdown();
    assert!(wait_until(Duration::from_secs(1), || mediator.table().is_empty()).await);
}

#[tokio::test]
async fn test_job_events_update_reported_slots() {
    let network = MemoryNetwork::new();
    let mediator = start_mediator(&network);

    let mut config = runner_config("runner-a", 1);
    config.mediator = Some(MEDIATOR.to_string());
    let runner = Runner::builder(config)
        .function("hold", |millis: u64, _ctx: WorkContext| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, WorkError>(())
        })
        .build()
        .unwrap();
    network.add_runner("runner-a", runner.clone());
    runner.start_status_reporter(network.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || mediator.table().len() == 1).await);

    let client = TaskClient::new(TaskConfig::new(Target::Runner("runner-a".into())), network.clone());
    let task = tokio::spawn(async move { client.submit(WorkUnit::new("hold", &200u64).unwrap()).await });

    let busy = || {
        mediator
            .table()
            .get("runner-a")
            .map(|record| record.available_slots == 0)
            .unwrap_or(false)
    };
    assert!(wait_until(Duration::from_secs(1), busy).await, "BeginJob not reported");

    task.await.unwrap().unwrap();
    let idle = || {
        mediator
            .table()
            .get("runner-a")
            .map(|record| record.available_slots == 1)
            .unwrap_or(false)
    };
    assert!(wait_until(Duration::from_secs(1), idle).await, "FinishJob not reported");
}
