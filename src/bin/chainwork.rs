//! chainwork CLI: operator interface to a chainwork ledger, plus a demo
//! image pipeline.

use async_trait::async_trait;
use chainwork::config::Config;
use chainwork::telemetry::{TelemetryConfig, init_telemetry};
use chainwork::{
    Collaborators, Constraints, Continuation, Data, ExecResult, Executable, ExistingWorkPolicy,
    NewWorkUnit, Registry, Scheduler, StaticEnvironment, WorkContext, WorkFilter, WorkId,
    WorkSpec, WorkUnit, WorkerPool,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

const KEY_IMAGE_URI: &str = "KEY_IMAGE_URI";
const IMAGE_MANIPULATION_WORK_NAME: &str = "image_manipulation_work";
const TAG_OUTPUT: &str = "OUTPUT";

#[derive(Parser)]
#[command(name = "chainwork", about = "Chained background work over a local ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool until interrupted
    Serve,
    /// Submit the demo pipeline (cleanup, blur xN, save) and wait for it
    Blur {
        /// Image to blur
        image: String,
        /// Number of blur passes
        #[arg(long, default_value_t = 1)]
        level: u32,
        /// Start unplugged and connect power after this many seconds
        #[arg(long)]
        plug_in_after: Option<u64>,
    },
    /// Show work units
    Status {
        #[arg(long, conflicts_with_all = ["name", "tag"])]
        id: Option<String>,
        #[arg(long, conflicts_with = "tag")]
        name: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Cancel work units and everything downstream of them
    Cancel {
        #[arg(long, conflicts_with_all = ["name", "tag"])]
        id: Option<String>,
        #[arg(long, conflicts_with = "tag")]
        name: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Print the ledger event log
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "chainwork".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let environment = Arc::new(StaticEnvironment::default());
    let scheduler = Scheduler::open(
        &config.ledger_path,
        Collaborators::new(demo_registry()).with_environment(environment.clone()),
        config.scheduler(),
    )?;

    match cli.command {
        Command::Serve => cmd_serve(scheduler).await,
        Command::Blur {
            image,
            level,
            plug_in_after,
        } => cmd_blur(scheduler, environment, image, level, plug_in_after).await,
        Command::Status { id, name, tag } => cmd_status(&scheduler, filter(id, name, tag)?),
        Command::Cancel { id, name, tag } => cmd_cancel(&scheduler, filter(id, name, tag)?),
        Command::Events { since } => cmd_events(&scheduler, since),
    }
}

fn filter(id: Option<String>, name: Option<String>, tag: Option<String>) -> anyhow::Result<WorkFilter> {
    match (id, name, tag) {
        (Some(id), _, _) => Ok(WorkFilter::Id(
            id.parse()
                .map_err(|e| anyhow::anyhow!("invalid work id {id}: {e}"))?,
        )),
        (_, Some(name), _) => Ok(WorkFilter::UniqueName(name)),
        (_, _, Some(tag)) => Ok(WorkFilter::Tag(tag)),
        _ => Ok(WorkFilter::UniqueName(IMAGE_MANIPULATION_WORK_NAME.to_string())),
    }
}

async fn cmd_serve(scheduler: Scheduler) -> anyhow::Result<()> {
    let pool = WorkerPool::new(scheduler);

    let handle = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_blur(
    scheduler: Scheduler,
    environment: Arc<StaticEnvironment>,
    image: String,
    level: u32,
    plug_in_after: Option<u64>,
) -> anyhow::Result<()> {
    let continuation = blur_pipeline(&image, level)?;
    let admission = scheduler.enqueue(continuation)?;
    println!("Admitted {} unit(s) as {}", admission.ids().len(), admission.instance());

    if let Some(secs) = plug_in_after {
        environment.update(|env| env.charging = false);
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            environment.update(|env| env.charging = true);
            scheduler.environment_changed();
        });
    }

    let pool = WorkerPool::new(scheduler.clone());
    let runner = pool.clone();
    let running = tokio::spawn(async move { runner.run().await });

    let mut observer = scheduler.observe(WorkFilter::UniqueName(IMAGE_MANIPULATION_WORK_NAME.into()));
    while let Some(snapshot) = observer.next().await {
        let units = snapshot?;
        if !units.is_empty() && units.iter().all(|u| u.state.is_terminal()) {
            print_units(&units);
            break;
        }
    }

    pool.shutdown();
    running.await??;

    if let Some(uri) = scheduler
        .query(&WorkFilter::Tag(TAG_OUTPUT.into()))?
        .iter()
        .filter(|u| u.instance_id == admission.instance())
        .find_map(|u| u.output.as_ref()?.get_str(KEY_IMAGE_URI).map(str::to_string))
    {
        println!("Output: {uri}");
    }
    Ok(())
}

fn cmd_status(scheduler: &Scheduler, filter: WorkFilter) -> anyhow::Result<()> {
    let units = scheduler.query(&filter)?;
    if units.is_empty() {
        println!("No work units found.");
        return Ok(());
    }
    print_units(&units);
    Ok(())
}

fn cmd_cancel(scheduler: &Scheduler, filter: WorkFilter) -> anyhow::Result<()> {
    let cancelled = match filter {
        WorkFilter::Id(id) => scheduler.cancel_by_id(id)?,
        WorkFilter::UniqueName(name) => scheduler.cancel_unique(&name)?,
        WorkFilter::Tag(tag) => scheduler.cancel_by_tag(&tag)?,
    };
    println!("Cancelled {} unit(s)", cancelled.len());
    Ok(())
}

fn cmd_events(scheduler: &Scheduler, since: u64) -> anyhow::Result<()> {
    for event in scheduler.events_since(since)? {
        println!(
            "{:>6}  {}  {}",
            event.seq,
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            serde_json::to_string(&event.kind)?
        );
    }
    Ok(())
}

fn print_units(units: &[WorkUnit]) {
    println!(
        "{:<8}  {:<8}  {:<3}  {:<10}  {:<4}  FAILURE",
        "ID", "KIND", "POS", "STATE", "TRY"
    );
    println!("{}", "-".repeat(72));
    for unit in units {
        println!(
            "{:<8}  {:<8}  {:<3}  {:<10}  {:<4}  {}",
            unit.id,
            unit.kind,
            unit.position,
            unit.state,
            unit.attempts,
            unit.failure.as_deref().unwrap_or("-")
        );
    }
}

// ---------------------------------------------------------------------------
// Demo pipeline
// ---------------------------------------------------------------------------

/// cleanup, then `level` blur passes, then save. Saving waits for power.
fn blur_pipeline(image: &str, level: u32) -> chainwork::Result<Continuation> {
    let mut stages = vec![vec![NewWorkUnit::of("cleanup")?]];

    for pass in 0..level.max(1) {
        let mut spec = WorkSpec::new("blur");
        // Only the first pass reads the original; later passes take the
        // previous output.
        if pass == 0 {
            spec.input = Data::new().with(KEY_IMAGE_URI, image);
        }
        stages.push(vec![NewWorkUnit::new(spec)?]);
    }

    stages.push(vec![NewWorkUnit::new(WorkSpec {
        tags: [TAG_OUTPUT.to_string()].into_iter().collect(),
        constraints: Constraints {
            requires_charging: true,
            ..Constraints::default()
        },
        ..WorkSpec::new("save")
    })?]);

    Continuation::unique(IMAGE_MANIPULATION_WORK_NAME, ExistingWorkPolicy::Replace, stages)
}

fn demo_registry() -> Registry {
    Registry::empty()
        .with("cleanup", Cleanup)
        .with("blur", Blur)
        .with("save", Save)
}

/// Pause for `delay` unless the unit is cancelled first.
async fn pause(ctx: &WorkContext, delay: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

struct Cleanup;

#[async_trait]
impl Executable for Cleanup {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        if !pause(&ctx, Duration::from_millis(200)).await {
            return ExecResult::failure("cancelled");
        }
        tracing::info!(work.id = %ctx.id, "cleaned up temporary files");
        ExecResult::success()
    }
}

struct Blur;

#[async_trait]
impl Executable for Blur {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        let Some(uri) = ctx.input.get_str(KEY_IMAGE_URI).filter(|u| !u.is_empty()) else {
            return ExecResult::failure("invalid input uri");
        };
        if !pause(&ctx, Duration::from_millis(500)).await {
            return ExecResult::failure("cancelled");
        }
        let output = format!("{uri}#blur-filter-output-{}", WorkId::new());
        ExecResult::Success(Data::new().with(KEY_IMAGE_URI, output))
    }
}

struct Save;

#[async_trait]
impl Executable for Save {
    async fn execute(&self, ctx: WorkContext) -> ExecResult {
        let Some(uri) = ctx.input.get_str(KEY_IMAGE_URI) else {
            return ExecResult::failure("nothing to save");
        };
        if !pause(&ctx, Duration::from_millis(200)).await {
            return ExecResult::failure("cancelled");
        }
        let saved = format!("file:///pictures/blurred-{}.png", ctx.id);
        tracing::info!(work.id = %ctx.id, source = uri, "image saved");
        ExecResult::Success(Data::new().with(KEY_IMAGE_URI, saved))
    }
}
