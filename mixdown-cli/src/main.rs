use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mixdown_core::bus::memory::MemoryBus;
use mixdown_core::cache::memory::MemoryCache;
use mixdown_core::config::OrchestratorConfig;
use mixdown_core::job::JobStatus;
use mixdown_core::manifest::ManifestSet;
use mixdown_core::pipeline::PipelineRequest;
use mixdown_core::store::memory::MemoryStore;
use mixdown_engine::Orchestrator;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod local;

#[derive(Parser)]
#[command(author, version, about = "Distributed job orchestrator for audio pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a pipeline file against the service manifests
    Validate {
        /// The pipeline file (YAML or JSON)
        pipeline: PathBuf,
        /// Manifest file or directory describing the worker services
        #[arg(long)]
        manifests: PathBuf,
    },
    /// Execute a pipeline end-to-end with embedded local workers
    Run {
        /// The pipeline file (YAML or JSON)
        pipeline: PathBuf,
        /// Manifest file or directory describing the worker services
        #[arg(long)]
        manifests: PathBuf,
        /// User id recorded on the job
        #[arg(long, default_value = "local")]
        user: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Print the step graph of a pipeline file
    Show {
        /// The pipeline file (YAML or JSON)
        pipeline: PathBuf,
    },
    /// Run the orchestrator against shared redis infrastructure
    #[cfg(feature = "redis-backend")]
    Serve {
        /// Manifest file or directory describing the worker services
        #[arg(long)]
        manifests: PathBuf,
        /// Orchestrator config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Submit a pipeline to a running orchestrator's store and queues
    #[cfg(feature = "redis-backend")]
    Submit {
        /// The pipeline file (YAML or JSON)
        pipeline: PathBuf,
        #[arg(long)]
        manifests: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Fetch a job document
    #[cfg(feature = "redis-backend")]
    Status {
        job_id: String,
        #[arg(long)]
        manifests: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Retry a failed job from its earliest failed step
    #[cfg(feature = "redis-backend")]
    Retry {
        job_id: String,
        #[arg(long)]
        manifests: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate {
            pipeline,
            manifests,
        } => validate(&pipeline, &manifests),
        Commands::Run {
            pipeline,
            manifests,
            user,
            timeout,
        } => run(&pipeline, &manifests, &user, timeout).await,
        Commands::Show { pipeline } => show(&pipeline),
        #[cfg(feature = "redis-backend")]
        Commands::Serve { manifests, config } => remote::serve(&manifests, config.as_deref()).await,
        #[cfg(feature = "redis-backend")]
        Commands::Submit {
            pipeline,
            manifests,
            config,
        } => remote::submit(&pipeline, &manifests, config.as_deref()).await,
        #[cfg(feature = "redis-backend")]
        Commands::Status {
            job_id,
            manifests,
            config,
        } => remote::status(&job_id, &manifests, config.as_deref()).await,
        #[cfg(feature = "redis-backend")]
        Commands::Retry {
            job_id,
            manifests,
            config,
        } => remote::retry(&job_id, &manifests, config.as_deref()).await,
    }
}

fn load_pipeline(path: &Path, user: Option<&str>) -> Result<PipelineRequest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("could not read pipeline file '{}'", path.display()))?;
    let mut request = PipelineRequest::from_yaml(&content)
        .with_context(|| format!("could not parse pipeline file '{}'", path.display()))?;
    if let Some(user) = user {
        request.user_id = user.to_string();
    }
    Ok(request)
}

fn load_manifests(path: &Path) -> Result<ManifestSet> {
    ManifestSet::load(path)
        .with_context(|| format!("could not load manifests from '{}'", path.display()))
}

fn validate(pipeline: &Path, manifests: &Path) -> Result<()> {
    let request = load_pipeline(pipeline, None)?;
    let manifests = load_manifests(manifests)?;
    let job = mixdown_engine::validate::validate(&request, &manifests)?;
    println!(
        "pipeline OK: {} steps, {} transitions",
        job.steps.len(),
        job.transitions.len()
    );
    Ok(())
}

async fn run(pipeline: &Path, manifests: &Path, user: &str, timeout: u64) -> Result<()> {
    let request = load_pipeline(pipeline, Some(user))?;
    let manifests = load_manifests(manifests)?;

    let bus = Arc::new(MemoryBus::new());
    let orchestrator = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        Arc::new(MemoryCache::new()),
        manifests.clone(),
        OrchestratorConfig {
            pop_timeout_secs: 1,
            sweep_interval_secs: 2,
            ..OrchestratorConfig::default()
        },
    );
    orchestrator.init().await?;
    let handle = orchestrator.run();

    let (worker_shutdown, worker_rx) = watch::channel(false);
    let mut workers = Vec::new();
    for service in manifests.service_names() {
        let worker = local::LocalWorker::new(
            orchestrator.clone(),
            bus.clone() as Arc<dyn mixdown_core::bus::QueueBus>,
            service,
        );
        workers.push(tokio::spawn(worker.run(worker_rx.clone())));
    }

    let receipt = orchestrator.submit(&request).await?;
    eprintln!("submitted {}", receipt.job_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let job = loop {
        let job = orchestrator.job(&receipt.job_id).await?;
        if job.status.is_terminal() {
            break job;
        }
        if tokio::time::Instant::now() >= deadline {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let _ = worker_shutdown.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    handle.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&job)?);
    match job.status {
        JobStatus::Complete => Ok(()),
        JobStatus::Failed => bail!("job {} failed", job.job_id),
        other => bail!("job {} still {} after {}s", job.job_id, other, timeout),
    }
}

fn show(pipeline: &Path) -> Result<()> {
    let request = load_pipeline(pipeline, None)?;
    println!("pipeline ({} steps)", request.steps.len());
    for step in &request.steps {
        println!("  {} [{}/{}]", step.name, step.service, step.command_spec.program);
        for t in request
            .step_transitions
            .iter()
            .filter(|t| t.from_step_name == step.name)
        {
            for (output, input) in &t.output_to_input_mapping {
                println!("    {} -> {}.{}", output, t.to_step_name, input);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "redis-backend")]
mod remote {
    use super::*;
    use mixdown_core::bus::redis::RedisBus;
    use mixdown_core::cache::redis::RedisCache;
    use mixdown_core::store::redis::RedisStore;

    async fn orchestrator(manifests: &Path, config: Option<&Path>) -> Result<Orchestrator> {
        let manifests = load_manifests(manifests)?;
        let config = match config {
            Some(path) => OrchestratorConfig::load(path)
                .with_context(|| format!("could not load config '{}'", path.display()))?,
            None => OrchestratorConfig::default(),
        };
        let store = RedisStore::connect(&config.redis_url).await?;
        let bus = RedisBus::connect(&config.redis_url).await?;
        let cache = RedisCache::connect(&config.redis_url).await?;
        Ok(Orchestrator::new(
            Arc::new(store),
            Arc::new(bus),
            Arc::new(cache),
            manifests,
            config,
        ))
    }

    pub async fn serve(manifests: &Path, config: Option<&Path>) -> Result<()> {
        let orchestrator = orchestrator(manifests, config).await?;
        orchestrator.init().await?;
        let handle = orchestrator.run();
        eprintln!("orchestrator running; ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        handle.shutdown().await;
        Ok(())
    }

    pub async fn submit(pipeline: &Path, manifests: &Path, config: Option<&Path>) -> Result<()> {
        let request = load_pipeline(pipeline, None)?;
        let orchestrator = orchestrator(manifests, config).await?;
        orchestrator.init().await?;
        let receipt = orchestrator.submit(&request).await?;
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        Ok(())
    }

    pub async fn status(job_id: &str, manifests: &Path, config: Option<&Path>) -> Result<()> {
        let orchestrator = orchestrator(manifests, config).await?;
        let job = orchestrator.job(job_id).await?;
        println!("{}", serde_json::to_string_pretty(&job)?);
        Ok(())
    }

    pub async fn retry(job_id: &str, manifests: &Path, config: Option<&Path>) -> Result<()> {
        let orchestrator = orchestrator(manifests, config).await?;
        let receipt = orchestrator.retry(job_id).await?;
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        Ok(())
    }
}
