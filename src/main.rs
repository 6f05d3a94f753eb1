use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Local;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};
use tokio::sync::Semaphore;

use scatac_batch::cli::{self, Arguments};
use scatac_batch::config::defs::RunConfig;
use scatac_batch::pipelines::scatac_batch::{read_sample_manifest, run};
use scatac_batch::utils::file::resolve_path;
use scatac_batch::utils::system::{compute_sample_workers, detect_cores_and_load};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = cli::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n scATAC Batch\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let manifest = resolve_path(&args.samples, &dir);
    let manifest_dir = manifest.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
    let samples = match read_sample_manifest(&manifest, &manifest_dir) {
        Ok(samples) => samples,
        Err(e) => {
            error!("Cannot read sample manifest: {}", e);
            std::process::exit(1);
        }
    };

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    let workers = compute_sample_workers(max_cores, cpu_load, samples.len());
    debug!(
        "Detected {} usable cores; CPU load {}%; running {} samples at a time",
        max_cores, cpu_load, workers
    );

    let out_dir = setup_output_dir(&args, &dir)?;
    info!("Writing outputs to {}", out_dir.display());

    let run_config = Arc::new(RunConfig {
        cwd: dir,
        out_dir,
        args,
        worker_semaphore: Arc::new(Semaphore::new(workers)),
        workers,
    });

    if let Err(e) = run(run_config, samples).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<batch_name>_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => resolve_path(out, cwd),
        None => cwd.join(format!("{}_{}", args.batch_name, Local::now().format("%Y%m%d"))),
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
