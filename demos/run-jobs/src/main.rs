use std::path::PathBuf;

use buildrunner::{config::DEFAULT_LOG_FOLDER, config::DEFAULT_WORKERS, prelude::*};
use clap::Parser;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Runs build jobs described by JSON job files.
#[derive(Parser, Debug)]
#[command(name = "run-jobs")]
struct Args {
    /// Job files, run with ids 1, 2, 3... in the order given
    #[arg(default_values = ["jobs/qemu.json", "jobs/rpi3.json", "jobs/fvp.json"])]
    jobs: Vec<PathBuf>,

    /// Folder receiving one `<id>.txt` log per job
    #[arg(long, default_value = DEFAULT_LOG_FOLDER)]
    log_dir: PathBuf,

    /// Number of jobs built at the same time
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    let start = Instant::now();

    let config = RunnerConfig::new(args.log_dir)?.with_workers(args.workers);
    let pool = WorkerPool::new(config, ShellRunner::default());

    for (id, path) in (1u32..).zip(&args.jobs) {
        let config = match JobConfig::from_file(path).and_then(JobConfig::validate) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%error, path = %path.display(), "Skipping job file");
                continue;
            }
        };
        let job_id = pool.submit(pool.job(id, config))?;
        tracing::debug!(%job_id, path = %path.display(), "Submitted job file");
    }

    pool.wait_for_all_complete().await?;

    for record in pool.records() {
        let kind = record.job_type.as_deref().unwrap_or("-");
        match record.error {
            Some(error) => println!("job {} ({kind}): {}, {error}", record.id, record.status),
            None => println!("job {} ({kind}): {}", record.id, record.status),
        }
    }
    tracing::debug!(
        "Total run time for all jobs: {}",
        BuildTime::from(start.elapsed())
    );

    pool.graceful_shutdown().await?;
    Ok(())
}
