//! End-to-end tests driving the async worker pool.

use async_trait::async_trait;
use chainwork::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const KEY_IMAGE_URI: &str = "KEY_IMAGE_URI";

struct Cleanup;

#[async_trait]
impl Executable for Cleanup {
    async fn execute(&self, _ctx: WorkContext) -> ExecResult {
        ExecResult::success()
    }
}

struct Blur;

#[async_trait]
impl Executable for Blur {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        match ctx.input.get_str(KEY_IMAGE_URI) {
            Some(uri) => ExecResult::Success(Data::new().with(KEY_IMAGE_URI, format!("{uri}+blur"))),
            None => ExecResult::failure("invalid input uri"),
        }
    }
}

struct Save;

#[async_trait]
impl Executable for Save {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        let uri = ctx.input.get_str(KEY_IMAGE_URI).unwrap_or("-");
        ExecResult::Success(Data::new().with(KEY_IMAGE_URI, format!("saved:{uri}")))
    }
}

/// Runs until cancelled.
struct WaitForCancel {
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl Executable for WaitForCancel {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        ctx.cancel.cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        ExecResult::failure("cancelled")
    }
}

/// Keeps a handle on its cancel token and never finishes.
struct Stuck {
    token: Arc<parking_lot::Mutex<Option<tokio_util::sync::CancellationToken>>>,
}

#[async_trait]
impl Executable for Stuck {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        *self.token.lock() = Some(ctx.cancel.clone());
        std::future::pending::<()>().await;
        ExecResult::success()
    }
}

struct Panics;

#[async_trait]
impl Executable for Panics {
    async fn execute(&self, _ctx: WorkContext) -> ExecResult {
        panic!("blur kernel exploded");
    }
}

/// Tracks the highest number of concurrent executions.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct Slow {
    gauge: Arc<Gauge>,
    delay: Duration,
}

#[async_trait]
impl Executable for Slow {
    async fn execute(&self, _ctx: WorkContext) -> ExecResult {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        ExecResult::success()
    }
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        poll_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(5),
        ..SchedulerConfig::default()
    }
}

fn scheduler(registry: Registry, workers: usize) -> Scheduler {
    Scheduler::new(
        Storage::in_memory().unwrap(),
        Collaborators::new(registry).without_sink(),
        config(workers),
    )
    .unwrap()
}

fn start(s: &Scheduler) -> (WorkerPool, JoinHandle<chainwork::Result<()>>) {
    let pool = WorkerPool::new(s.clone());
    let runner = pool.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    (pool, handle)
}

/// Wait until a snapshot satisfies `done`, returning it.
async fn wait_for(
    observer: &mut WorkObserver,
    done: impl Fn(&[WorkUnit]) -> bool,
) -> Vec<WorkUnit> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let units = observer.next().await.expect("feed closed").unwrap();
            if done(&units) {
                return units;
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

fn all_terminal(units: &[WorkUnit]) -> bool {
    !units.is_empty() && units.iter().all(|u| u.state.is_terminal())
}

#[tokio::test]
async fn pool_runs_blur_pipeline_to_completion() {
    let s = scheduler(
        Registry::empty()
            .with("cleanup", Cleanup)
            .with("blur", Blur)
            .with("save", Save),
        4,
    );
    let (pool, handle) = start(&s);

    let blur = NewWorkUnit::new(WorkSpec {
        input: Data::new().with(KEY_IMAGE_URI, "file:///in.png"),
        ..WorkSpec::new("blur")
    })
    .unwrap();
    let save = NewWorkUnit::new(WorkSpec {
        tags: ["OUTPUT".to_string()].into_iter().collect(),
        constraints: Constraints {
            requires_charging: true,
            ..Constraints::default()
        },
        ..WorkSpec::new("save")
    })
    .unwrap();
    let chain = Continuation::unique(
        "image_manipulation_work",
        ExistingWorkPolicy::Replace,
        vec![
            vec![NewWorkUnit::of("cleanup").unwrap()],
            vec![blur],
            vec![NewWorkUnit::of("blur").unwrap()],
            vec![save],
        ],
    )
    .unwrap();

    let mut output = s.observe(WorkFilter::Tag("OUTPUT".into()));
    s.enqueue(chain).unwrap();

    let units = wait_for(&mut output, all_terminal).await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].state, State::Succeeded);
    assert_eq!(
        units[0].output.as_ref().unwrap().get_str(KEY_IMAGE_URI),
        Some("saved:file:///in.png+blur+blur")
    );

    let all = s
        .query(&WorkFilter::UniqueName("image_manipulation_work".into()))
        .unwrap();
    assert!(all.iter().all(|u| u.state == State::Succeeded));

    pool.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn observer_yields_snapshot_for_zero_matches() {
    let s = scheduler(Registry::empty(), 1);
    let mut observer = s.observe(WorkFilter::Tag("nothing".into()));
    let first = observer.next().await.unwrap().unwrap();
    assert!(first.is_empty());
}

#[tokio::test]
async fn observer_follows_a_unit_through_its_states() {
    let s = scheduler(Registry::empty().with("cleanup", Cleanup), 1);
    let chain = Continuation::single(NewWorkUnit::of("cleanup").unwrap()).unwrap();
    let id = chain.unit_ids()[0];
    s.enqueue(chain).unwrap();

    let mut observer = s.observe(WorkFilter::Id(id));
    let first = observer.next().await.unwrap().unwrap();
    assert_eq!(first[0].state, State::Enqueued);

    let (pool, handle) = start(&s);
    let last = wait_for(&mut observer, all_terminal).await;
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].state, State::Succeeded);
    assert_eq!(last[0].attempts, 1);
    pool.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelling_a_running_unit_signals_its_executable() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let s = scheduler(
        Registry::empty()
            .with(
                "blur",
                WaitForCancel {
                    saw_cancel: saw_cancel.clone(),
                },
            )
            .with("save", Save),
        2,
    );
    let (pool, handle) = start(&s);

    let chain = Continuation::new(vec![
        vec![NewWorkUnit::of("blur").unwrap()],
        vec![NewWorkUnit::of("save").unwrap()],
    ])
    .unwrap();
    let ids = chain.unit_ids();
    let mut observer = s.observe(WorkFilter::Id(ids[0]));
    s.enqueue(chain).unwrap();

    wait_for(&mut observer, |units| {
        units.first().is_some_and(|u| u.state == State::Running)
    })
    .await;

    assert_eq!(s.cancel_by_id(ids[0]).unwrap(), ids);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !saw_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    pool.shutdown();
    handle.await.unwrap().unwrap();
    assert_eq!(s.get(ids[0]).unwrap().state, State::Cancelled);
    assert_eq!(s.get(ids[1]).unwrap().state, State::Cancelled);
    assert_eq!(s.get(ids[1]).unwrap().attempts, 0);
}

#[tokio::test]
async fn panicking_executable_fails_its_unit() {
    let s = scheduler(Registry::empty().with("blur", Panics), 1);
    let (pool, handle) = start(&s);

    let chain = Continuation::single(NewWorkUnit::of("blur").unwrap()).unwrap();
    let id = chain.unit_ids()[0];
    let mut observer = s.observe(WorkFilter::Id(id));
    s.enqueue(chain).unwrap();

    let units = wait_for(&mut observer, all_terminal).await;
    assert_eq!(units[0].state, State::Failed);
    assert!(units[0].failure.as_deref().unwrap().contains("panicked"));

    pool.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_count_bounds_concurrency() {
    let gauge = Arc::new(Gauge::default());
    let s = scheduler(
        Registry::empty().with(
            "blur",
            Slow {
                gauge: gauge.clone(),
                delay: Duration::from_millis(50),
            },
        ),
        2,
    );
    let (pool, handle) = start(&s);

    let tagged = || {
        NewWorkUnit::new(WorkSpec {
            tags: ["batch".to_string()].into_iter().collect(),
            ..WorkSpec::new("blur")
        })
        .unwrap()
    };
    let chain = Continuation::new(vec![(0..6).map(|_| tagged()).collect()]).unwrap();
    let mut observer = s.observe(WorkFilter::Tag("batch".into()));
    s.enqueue(chain).unwrap();

    let units = wait_for(&mut observer, all_terminal).await;
    assert_eq!(units.len(), 6);
    assert!(units.iter().all(|u| u.state == State::Succeeded));
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);

    pool.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_drains_running_work() {
    let gauge = Arc::new(Gauge::default());
    let s = scheduler(
        Registry::empty().with(
            "save",
            Slow {
                gauge: gauge.clone(),
                delay: Duration::from_millis(300),
            },
        ),
        1,
    );
    let (pool, handle) = start(&s);

    let chain = Continuation::single(NewWorkUnit::of("save").unwrap()).unwrap();
    let id = chain.unit_ids()[0];
    let mut observer = s.observe(WorkFilter::Id(id));
    s.enqueue(chain).unwrap();

    wait_for(&mut observer, |units| {
        units.first().is_some_and(|u| u.state == State::Running)
    })
    .await;
    pool.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(s.get(id).unwrap().state, State::Succeeded);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn drain_timeout_signals_and_aborts_stuck_work() {
    let token = Arc::new(parking_lot::Mutex::new(None));
    let s = Scheduler::new(
        Storage::in_memory().unwrap(),
        Collaborators::new(Registry::empty().with(
            "blur",
            Stuck {
                token: token.clone(),
            },
        ))
        .without_sink(),
        SchedulerConfig {
            drain_timeout: Duration::from_millis(100),
            ..config(1)
        },
    )
    .unwrap();
    let (pool, handle) = start(&s);

    let chain = Continuation::single(NewWorkUnit::of("blur").unwrap()).unwrap();
    let id = chain.unit_ids()[0];
    let mut observer = s.observe(WorkFilter::Id(id));
    s.enqueue(chain).unwrap();

    wait_for(&mut observer, |units| {
        units.first().is_some_and(|u| u.state == State::Running)
    })
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while token.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    pool.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();

    assert!(token.lock().as_ref().unwrap().is_cancelled());
    assert_eq!(pool.active(), 0);
    // Left for restart recovery.
    assert_eq!(s.get(id).unwrap().state, State::Running);
}

#[tokio::test]
async fn dropping_an_observer_leaves_work_running() {
    let s = scheduler(
        Registry::empty()
            .with("cleanup", Cleanup)
            .with("blur", Blur)
            .with("save", Save),
        2,
    );
    let (pool, handle) = start(&s);

    let blur = NewWorkUnit::new(WorkSpec {
        input: Data::new().with(KEY_IMAGE_URI, "file:///in.png"),
        ..WorkSpec::new("blur")
    })
    .unwrap();
    let chain = Continuation::new(vec![
        vec![NewWorkUnit::of("cleanup").unwrap()],
        vec![blur],
        vec![NewWorkUnit::of("save").unwrap()],
    ])
    .unwrap();
    let ids = chain.unit_ids();

    let early = s.observe(WorkFilter::Id(ids[0]));
    s.enqueue(chain).unwrap();
    drop(early);

    let mut last = s.observe(WorkFilter::Id(ids[2]));
    let units = wait_for(&mut last, all_terminal).await;
    assert_eq!(units[0].state, State::Succeeded);
    assert!(ids.iter().all(|id| s.get(*id).unwrap().state == State::Succeeded));

    pool.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn lagging_observer_requeries_current_state() {
    let s = Scheduler::new(
        Storage::in_memory().unwrap(),
        Collaborators::new(Registry::empty()).without_sink(),
        SchedulerConfig {
            change_buffer: 1,
            ..config(1)
        },
    )
    .unwrap();

    let mut observer = s.observe(WorkFilter::Tag("batch".into()));
    assert!(observer.next().await.unwrap().unwrap().is_empty());

    // Several commits with no one reading overflow the one-slot feed.
    let mut ids = Vec::new();
    for _ in 0..4 {
        let unit = NewWorkUnit::new(WorkSpec {
            tags: ["batch".to_string()].into_iter().collect(),
            ..WorkSpec::new("blur")
        })
        .unwrap();
        let chain = Continuation::single(unit).unwrap();
        ids.extend(chain.unit_ids());
        s.enqueue(chain).unwrap();
    }

    let units = tokio::time::timeout(Duration::from_secs(5), observer.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(units.len(), 4);
    assert!(ids.iter().all(|id| units.iter().any(|u| u.id == *id)));
}
