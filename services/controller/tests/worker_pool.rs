//! Worker pool behavior against the in-memory queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vnet_controller::engine::{TaskError, TaskResult};
use vnet_controller::memory::MemoryBackend;
use vnet_controller::model::{NewTask, StepPlan, TaskData, TaskStatus, UpdateVpcType, VpcType};
use vnet_controller::queue::{Reservation, TaskQueue};
use vnet_controller::worker::{
    InFlightRegistry, ShutdownMode, TaskExecutor, WorkerConfig, WorkerPool, ABORTED_MESSAGE,
};
use vnet_id::TaskId;

const DEADLINE: Duration = Duration::from_secs(5);

fn payload(vpc_id: &str) -> TaskData {
    TaskData::UpdateVpcType(UpdateVpcType {
        region: "us-east-1".into(),
        vpc_id: vpc_id.into(),
        vpc_type: VpcType::V1,
    })
}

fn task(vpc_id: &str) -> NewTask {
    NewTask::new(format!("Touch {vpc_id}"), payload(vpc_id))
}

/// Behaves according to the VPC a task targets:
/// `vpc-panic` panics, `vpc-fail` fails, `vpc-hang` never returns,
/// `vpc-watch` runs until the task is cancelled, anything else sleeps
/// for `delay` and succeeds.
struct Recorder {
    backend: MemoryBackend,
    delay: Duration,
    seen: Mutex<Vec<TaskId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    fn new(backend: &MemoryBackend, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.clone(),
            delay,
            seen: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<TaskId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for Recorder {
    async fn execute(&self, reservation: &Reservation) -> TaskResult<()> {
        let id = reservation.task.id;
        self.seen.lock().unwrap().push(id);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match reservation.task.data.vpc().vpc_id.as_str() {
            "vpc-panic" => panic!("boom"),
            "vpc-fail" => Err(TaskError::precondition("VPC is not ready")),
            "vpc-hang" => std::future::pending().await,
            "vpc-watch" => loop {
                let status = self.backend.task(&id).await?.map(|t| t.status);
                if status == Some(TaskStatus::Cancelled) {
                    break Err(TaskError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            _ => {
                tokio::time::sleep(self.delay).await;
                Ok(())
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Running {
    shutdown: watch::Sender<ShutdownMode>,
    handle: JoinHandle<()>,
    in_flight: Arc<InFlightRegistry>,
}

impl Running {
    async fn stop(self, mode: ShutdownMode) {
        self.shutdown.send(mode).unwrap();
        tokio::time::timeout(DEADLINE, self.handle)
            .await
            .expect("pool stops")
            .unwrap();
    }
}

fn start(backend: &MemoryBackend, executor: Arc<Recorder>, parallelism: usize) -> Running {
    let pool = WorkerPool::new(
        "pool-test",
        Arc::new(backend.clone()),
        executor,
        WorkerConfig {
            parallelism,
            poll_interval: Duration::from_millis(50),
            error_backoff: Duration::from_millis(50),
        },
        backend.wake(),
    );
    let in_flight = pool.in_flight();
    let (shutdown, rx) = watch::channel(ShutdownMode::Running);
    let handle = tokio::spawn(async move { pool.run(rx).await });
    Running {
        shutdown,
        handle,
        in_flight,
    }
}

async fn wait_for_status(backend: &MemoryBackend, id: &TaskId, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    loop {
        let current = backend.task(id).await.unwrap().map(|t| t.status);
        if current == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {current:?}, wanted {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_released(backend: &MemoryBackend) {
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while backend.reservation_count().await > 0 || !backend.held_locks().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "locks were never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn log_of(backend: &MemoryBackend, id: &TaskId) -> Vec<String> {
    backend
        .task(id)
        .await
        .unwrap()
        .unwrap()
        .log
        .into_iter()
        .map(|e| e.message)
        .collect()
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let backend = MemoryBackend::new();
    let executor = Recorder::new(&backend, Duration::from_millis(50));
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(backend.enqueue(task(&format!("vpc-{i}"))).await.unwrap());
    }

    let running = start(&backend, executor.clone(), 2);
    for id in &ids {
        wait_for_status(&backend, id, TaskStatus::Successful).await;
    }
    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(executor.seen().len(), 6);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    wait_until_released(&backend).await;
    assert_eq!(backend.stats(None).await.unwrap().successful, 6);
}

#[tokio::test]
async fn test_panicking_task_fails_and_releases_locks() {
    let backend = MemoryBackend::new();
    let running = start(&backend, Recorder::new(&backend, Duration::ZERO), 2);

    let id = backend.enqueue(task("vpc-panic")).await.unwrap();
    wait_for_status(&backend, &id, TaskStatus::Failed).await;
    wait_until_released(&backend).await;
    assert!(log_of(&backend, &id)
        .await
        .contains(&"Unexpected error: boom".to_string()));

    // The pool keeps serving.
    let next = backend.enqueue(task("vpc-1")).await.unwrap();
    wait_for_status(&backend, &next, TaskStatus::Successful).await;
    running.stop(ShutdownMode::StopGracefully).await;
}

#[tokio::test]
async fn test_failed_task_records_its_error() {
    let backend = MemoryBackend::new();
    let running = start(&backend, Recorder::new(&backend, Duration::ZERO), 1);

    let id = backend.enqueue(task("vpc-fail")).await.unwrap();
    wait_for_status(&backend, &id, TaskStatus::Failed).await;
    running.stop(ShutdownMode::StopGracefully).await;

    assert!(log_of(&backend, &id)
        .await
        .iter()
        .any(|l| l.contains("VPC is not ready")));
    assert!(backend.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_fail_fast_aborts_in_flight_tasks() {
    let backend = MemoryBackend::new();
    let running = start(&backend, Recorder::new(&backend, Duration::ZERO), 2);

    let id = backend.enqueue(task("vpc-hang")).await.unwrap();
    wait_for_status(&backend, &id, TaskStatus::InProgress).await;
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while running.in_flight.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    running.stop(ShutdownMode::FailFastAndStop).await;

    let task = backend.task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.log.iter().any(|e| e.message == ABORTED_MESSAGE));
    assert!(backend.held_locks().await.is_empty());
    assert_eq!(backend.reservation_count().await, 0);
}

#[tokio::test]
async fn test_graceful_stop_finishes_running_tasks_only() {
    let backend = MemoryBackend::new();
    let running = start(&backend, Recorder::new(&backend, Duration::from_millis(300)), 1);

    let first = backend.enqueue(task("vpc-1")).await.unwrap();
    wait_for_status(&backend, &first, TaskStatus::InProgress).await;
    let second = backend.enqueue(task("vpc-2")).await.unwrap();

    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(
        backend.task(&first).await.unwrap().unwrap().status,
        TaskStatus::Successful
    );
    assert_eq!(
        backend.task(&second).await.unwrap().unwrap().status,
        TaskStatus::Queued
    );
    assert!(backend.held_locks().await.is_empty());
}

#[tokio::test]
async fn test_failed_prerequisite_fails_dependent_without_running_it() {
    let backend = MemoryBackend::new();
    let executor = Recorder::new(&backend, Duration::ZERO);
    let first = backend.enqueue(task("vpc-fail")).await.unwrap();
    let second = backend.enqueue(task("vpc-1").after(first)).await.unwrap();

    let running = start(&backend, executor.clone(), 2);
    wait_for_status(&backend, &second, TaskStatus::Failed).await;
    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(executor.seen(), vec![first]);
    assert!(log_of(&backend, &second)
        .await
        .iter()
        .any(|l| l.contains("Prerequisite") && l.contains(&first.to_string())));
}

#[tokio::test]
async fn test_plan_steps_run_in_order() {
    let backend = MemoryBackend::new();
    let executor = Recorder::new(&backend, Duration::from_millis(10));
    let plan = StepPlan::new("Touch three VPCs")
        .then("First", payload("vpc-1"))
        .then("Second", payload("vpc-2"))
        .then("Third", payload("vpc-3"));
    let ids = backend.enqueue_plan(&plan).await.unwrap();

    let running = start(&backend, executor.clone(), 4);
    wait_for_status(&backend, &ids[2], TaskStatus::Successful).await;
    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(executor.seen(), ids);
    assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_tasks_are_not_run() {
    let backend = MemoryBackend::new();
    let executor = Recorder::new(&backend, Duration::ZERO);
    let cancelled = backend.enqueue(task("vpc-1")).await.unwrap();
    assert_eq!(backend.cancel(&[cancelled]).await.unwrap(), 1);

    let running = start(&backend, executor.clone(), 2);
    let next = backend.enqueue(task("vpc-2")).await.unwrap();
    wait_for_status(&backend, &next, TaskStatus::Successful).await;
    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(executor.seen(), vec![next]);
    assert_eq!(
        backend.task(&cancelled).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancelling_a_running_task_keeps_it_cancelled() {
    let backend = MemoryBackend::new();
    let running = start(&backend, Recorder::new(&backend, Duration::ZERO), 1);

    let id = backend.enqueue(task("vpc-watch")).await.unwrap();
    wait_for_status(&backend, &id, TaskStatus::InProgress).await;
    backend.cancel(&[id]).await.unwrap();
    wait_until_released(&backend).await;

    // The freed slot picks up the next task.
    let next = backend.enqueue(task("vpc-watch-next")).await.unwrap();
    wait_for_status(&backend, &next, TaskStatus::Successful).await;
    running.stop(ShutdownMode::StopGracefully).await;

    assert_eq!(
        backend.task(&id).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_gated_worker_leaves_tasks_queued() {
    let backend = MemoryBackend::new();
    backend.set_worker_allowed("pool-test", false).await.unwrap();
    let executor = Recorder::new(&backend, Duration::ZERO);
    let running = start(&backend, executor.clone(), 2);

    let id = backend.enqueue(task("vpc-1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        backend.task(&id).await.unwrap().unwrap().status,
        TaskStatus::Queued
    );

    backend.set_worker_allowed("pool-test", true).await.unwrap();
    wait_for_status(&backend, &id, TaskStatus::Successful).await;
    running.stop(ShutdownMode::StopGracefully).await;
    assert_eq!(executor.seen(), vec![id]);
}
