// src/utils/system.rs: System functions

use std::hash::Hasher;
use std::time::Duration;

use anyhow::Result;
use fxhash::FxHasher64;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `args_threads` - Upper bound requested on the command line.
///
/// # Returns
///
/// Result<(usize, f32)> maximum cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(args_threads).max(1);
    Ok((max_cores, cpu_load))
}


/// Number of per-sample workers allowed to run at once.
/// A heavily loaded machine gets half the cores, never fewer than one.
pub fn compute_sample_workers(max_cores: usize, cpu_load: f32, num_samples: usize) -> usize {
    let budget = if cpu_load > 75.0 { max_cores / 2 } else { max_cores };
    budget.min(num_samples).max(1)
}


/// Derives the downsampling seed of one sample from its name and the run id.
/// The same (sample, run, seed) triple always yields the same seed.
///
/// # Arguments
///
///  * `sample` - Sample name from the manifest.
///  * `run_id` - Run identifier.
///  * `seed` - Optional user seed mixed in.
///
/// # Returns
///
/// u64 seed
pub fn sample_seed(sample: &str, run_id: &str, seed: Option<u64>) -> u64 {
    let mut hasher = FxHasher64::default();
    hasher.write(sample.as_bytes());
    hasher.write_u8(0);
    hasher.write(run_id.as_bytes());
    hasher.write_u64(seed.unwrap_or(0));
    hasher.finish()
}


/// Creates a StdRng from an explicit seed.
pub fn generate_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
