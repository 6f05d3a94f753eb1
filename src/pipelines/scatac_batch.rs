use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, error, info, warn};
use tokio::task::{self, JoinSet};

use crate::config::defs::{PipelineError, RunConfig, CONSENSUS_PEAKS_SUFFIX, DOWNSAMPLE_DIR, PEAK_CALL_DIR};
use crate::utils::command::check_versions;
use crate::utils::counts::{count_sample, load_valid_barcodes, load_whitelist};
use crate::utils::downsample::{downsample_fragments, DownsampleOutput, DownsampleParams};
use crate::utils::file::{ensure_readable, open_text_reader, resolve_path, sample_path};
use crate::utils::intervals::{IntervalJoiner, LapperJoiner};
use crate::utils::matrix::{CountToolWriter, Hdf5MatrixWriter, MatrixWriter};
use crate::utils::region_caller::{call_consensus_regions, ConsensusExtras, Macs2RegionCaller, RegionCallConfig, RegionCaller, SampleTrack};
use crate::utils::regions::ConsensusRegionSet;
use crate::utils::system::sample_seed;

/// One row of the sample manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSpec {
    pub name: String,
    pub fragments: PathBuf,
    pub barcodes: PathBuf,
}

/// What a batch produced. Failed samples keep no matrix; their siblings are unaffected.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub consensus_bed: PathBuf,
    pub num_regions: usize,
    pub matrices: Vec<(String, PathBuf)>,
    pub failed: Vec<String>,
}


/// Reads the `sample, fragments, barcodes` TSV manifest. Relative paths resolve against `base`.
///
/// # Arguments
///
/// * `path` - Manifest file.
/// * `base` - Directory relative paths are resolved against.
///
/// # Returns
/// Samples in manifest order.
pub fn read_sample_manifest(path: &Path, base: &Path) -> Result<Vec<SampleSpec>, PipelineError> {
    let reader = open_text_reader(path)?;
    let mut samples: Vec<SampleSpec> = Vec::new();
    let mut names = FxHashSet::default();
    let mut first_row = true;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| PipelineError::missing(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').map(str::trim).collect();
        if fields.len() < 3 {
            return Err(PipelineError::InvalidConfig(format!(
                "{} line {}: expected sample, fragments, barcodes; got '{}'",
                path.display(),
                lineno + 1,
                trimmed
            )));
        }
        let is_header = first_row && fields[0].eq_ignore_ascii_case("sample");
        first_row = false;
        if is_header {
            continue;
        }
        if !names.insert(fields[0].to_string()) {
            return Err(PipelineError::InvalidConfig(format!("Duplicate sample name '{}' in {}", fields[0], path.display())));
        }
        samples.push(SampleSpec {
            name: fields[0].to_string(),
            fragments: resolve_path(fields[1], base),
            barcodes: resolve_path(fields[2], base),
        });
    }
    if samples.is_empty() {
        return Err(PipelineError::InvalidConfig(format!("No samples in {}", path.display())));
    }
    Ok(samples)
}


/// Entry point of the scATAC batch module: wires MACS2 and the configured matrix writer
/// into `run_batch`.
pub async fn run(config: Arc<RunConfig>, samples: Vec<SampleSpec>) -> Result<(), PipelineError> {
    println!("\n-------------\n scATAC Batch Peak Count\n-------------\n");
    info!("{} samples, {} concurrent workers", samples.len(), config.workers);

    let versions = check_versions(Some(&config.args.macs2), config.args.count_tool.as_deref())
        .await
        .map_err(|e| PipelineError::ToolExecution { tool: "version check".to_string(), error: e.to_string() })?;
    for (tool, version) in &versions {
        info!("{} version {}", tool, version);
    }

    let caller: Arc<dyn RegionCaller> = Arc::new(Macs2RegionCaller::new(config.args.macs2.clone()));
    let writer: Arc<dyn MatrixWriter> = match &config.args.count_tool {
        Some(program) => Arc::new(CountToolWriter { program: program.clone() }),
        None => Arc::new(Hdf5MatrixWriter),
    };

    let report = run_batch(config, samples, caller, writer).await?;
    info!(
        "Consensus set of {} regions at {}; {} matrices written",
        report.num_regions,
        report.consensus_bed.display(),
        report.matrices.len()
    );
    if !report.failed.is_empty() {
        return Err(PipelineError::SampleFailures { failed: report.failed });
    }
    Ok(())
}


/// Runs downsampling, the joint-call barrier, and per-sample counting for one batch.
///
/// # Arguments
///
/// * `config` - Shared run configuration.
/// * `samples` - Every sample of the batch.
/// * `caller` - Region-calling capability used once, jointly.
/// * `writer` - Matrix serializer.
///
/// # Returns
/// BatchReport; Err only for batch-fatal failures (joint call, configuration).
pub async fn run_batch(
    config: Arc<RunConfig>,
    samples: Vec<SampleSpec>,
    caller: Arc<dyn RegionCaller>,
    writer: Arc<dyn MatrixWriter>,
) -> Result<BatchReport, PipelineError> {
    let start = Instant::now();
    let samples = Arc::new(samples);

    let tracks = downsample_all(config.clone(), samples.clone()).await;
    info!("Downsampling barrier reached after {} ms", start.elapsed().as_millis());

    let call_config = RegionCallConfig {
        name: config.args.batch_name.clone(),
        genome_size: config.args.species.genome_size().to_string(),
        qvalue: config.args.qvalue,
        extsize: config.args.extsize,
    };
    let extras = ConsensusExtras {
        custom_peaks: config.args.custom_peaks.as_deref().map(|p| resolve_path(p, &config.cwd)),
        short_fragment_max: config.args.short_peaks.then_some(config.args.short_fragment_max),
    };
    if let Some(custom) = &extras.custom_peaks {
        ensure_readable(custom)?;
    }
    let peak_dir = config.out_dir.join(PEAK_CALL_DIR);
    let consensus = call_consensus_regions(caller.as_ref(), &tracks, &call_config, &extras, &peak_dir).await?;
    if consensus.is_empty() {
        warn!("Consensus region set is empty; every matrix will have zero rows");
    }

    let consensus_bed = sample_path(&config.out_dir, &config.args.batch_name, CONSENSUS_PEAKS_SUFFIX, '_');
    consensus.write_bed(&consensus_bed)?;
    info!("Consensus set: {} regions after {} ms", consensus.len(), start.elapsed().as_millis());

    let num_regions = consensus.len();
    let (matrices, failed) = count_all(config, samples, Arc::new(consensus), writer).await?;

    Ok(BatchReport {
        consensus_bed,
        num_regions,
        matrices,
        failed,
    })
}


/// Downsamples every sample in parallel and waits for all of them.
/// The first failure raises the cancel flag so siblings stop early; failed samples get no track.
async fn downsample_all(config: Arc<RunConfig>, samples: Arc<Vec<SampleSpec>>) -> Vec<SampleTrack> {
    let cancel = Arc::new(AtomicBool::new(false));
    let downsample_dir = config.out_dir.join(DOWNSAMPLE_DIR);
    let mut join_set = JoinSet::new();
    let mut task_samples: FxHashMap<task::Id, usize> = FxHashMap::default();

    for (idx, sample) in samples.iter().enumerate() {
        let sample = sample.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        let output = sample_path(&downsample_dir, &sample.name, "fragments.tsv", '.');
        let params = DownsampleParams {
            enabled: config.args.downsample,
            target_reads: config.args.target_reads,
            seed: sample_seed(&sample.name, &config.args.run_id, config.args.seed),
        };

        let handle = join_set.spawn(async move {
            let _permit = match config.worker_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (idx, Err(PipelineError::Cancelled(e.to_string()))),
            };
            if cancel.load(Ordering::Relaxed) {
                return (idx, Err(PipelineError::Cancelled(format!("downsampling of {}", sample.name))));
            }
            debug!("Downsampling {} with seed {}", sample.name, params.seed);
            let task_cancel = cancel.clone();
            let result = tokio::task::spawn_blocking(move || {
                downsample_fragments(&sample.fragments, &output, params, &task_cancel)
            })
            .await
            .unwrap_or_else(|e| Err(PipelineError::IOError(format!("Downsampling task failed: {}", e))));
            if result.is_err() {
                cancel.store(true, Ordering::Relaxed);
            }
            (idx, result)
        });
        task_samples.insert(handle.id(), idx);
    }

    let mut tracks: Vec<SampleTrack> = samples
        .iter()
        .map(|s| SampleTrack { sample: s.name.clone(), track: None })
        .collect();

    // Barrier: every task is drained before region calling may start
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, (idx, Ok(output)))) => {
                if let DownsampleOutput::Subsampled { kept, total_reads, .. } = &output {
                    info!("Sample {}: kept {} of {} fragments", tracks[idx].sample, kept, total_reads);
                }
                tracks[idx].track = Some(output.path().to_path_buf());
            }
            Ok((_, (idx, Err(PipelineError::Cancelled(what))))) => {
                warn!("Sample {}: cancelled ({})", tracks[idx].sample, what);
            }
            Ok((_, (idx, Err(e)))) => {
                error!("Sample {}: downsampling failed: {}", tracks[idx].sample, e);
                cancel.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                let sample = task_samples.get(&e.id()).map_or("<unknown>", |&idx| tracks[idx].sample.as_str());
                error!("Sample {}: downsampling task panicked: {}", sample, e);
                cancel.store(true, Ordering::Relaxed);
            }
        }
    }
    tracks
}


/// Counts every sample against the shared consensus set. Samples are independent:
/// a failure is recorded and the remaining samples continue.
async fn count_all(
    config: Arc<RunConfig>,
    samples: Arc<Vec<SampleSpec>>,
    consensus: Arc<ConsensusRegionSet>,
    writer: Arc<dyn MatrixWriter>,
) -> Result<(Vec<(String, PathBuf)>, Vec<String>), PipelineError> {
    let whitelist: Option<Arc<FxHashSet<String>>> = match &config.args.whitelist {
        Some(path) => {
            let whitelist = load_whitelist(&resolve_path(path, &config.cwd))?;
            info!("Whitelist holds {} barcodes", whitelist.len());
            Some(Arc::new(whitelist))
        }
        None => None,
    };
    let joiner: Arc<dyn IntervalJoiner> = Arc::new(LapperJoiner::new(&consensus));
    let species = config.args.species.as_str().to_string();

    let mut join_set = JoinSet::new();
    let mut task_samples: FxHashMap<task::Id, String> = FxHashMap::default();
    for sample in samples.iter().cloned() {
        let name = sample.name.clone();
        let config = config.clone();
        let consensus = consensus.clone();
        let joiner = joiner.clone();
        let whitelist = whitelist.clone();
        let writer = writer.clone();
        let species = species.clone();

        let handle = join_set.spawn(async move {
            let name = sample.name.clone();
            let result: Result<PathBuf, PipelineError> = async {
                let _permit = config
                    .worker_semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Cancelled(e.to_string()))?;
                let matrix = tokio::task::spawn_blocking(move || {
                    let barcodes = load_valid_barcodes(&sample.barcodes, whitelist.as_deref())?;
                    count_sample(&sample.fragments, &consensus, joiner.as_ref(), &barcodes, &sample.name, &species)
                })
                .await
                .map_err(|e| PipelineError::IOError(format!("Counting task failed: {}", e)))??;
                let sample_dir = config.out_dir.join(&matrix.sample);
                writer.write_matrix(Arc::new(matrix), &sample_dir).await
            }
            .await;
            (name, result)
        });
        task_samples.insert(handle.id(), name);
    }

    let mut matrices = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, (name, Ok(path)))) => matrices.push((name, path)),
            Ok((_, (name, Err(e)))) => {
                error!("Sample {}: counting failed: {}", name, e);
                failed.push(name);
            }
            Err(e) => {
                let name = task_samples
                    .remove(&e.id())
                    .unwrap_or_else(|| "<unknown>".to_string());
                error!("Sample {}: counting task panicked: {}", name, e);
                failed.push(name);
            }
        }
    }
    matrices.sort();
    failed.sort();
    Ok((matrices, failed))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_read_sample_manifest() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join("samples.tsv");
        fs::write(&manifest, "sample\tfragments\tbarcodes\n# comment\ns1\tf1.tsv.gz\t/abs/b1.txt\n\ns2\tsub/f2.tsv\tb2.txt\n")?;
        let samples = read_sample_manifest(&manifest, dir.path())?;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].fragments, dir.path().join("f1.tsv.gz"));
        assert_eq!(samples[0].barcodes, PathBuf::from("/abs/b1.txt"));
        assert_eq!(samples[1].name, "s2");
        Ok(())
    }

    #[test]
    fn test_manifest_rejects_duplicates_and_short_rows() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let dup = dir.path().join("dup.tsv");
        fs::write(&dup, "s1\ta\tb\ns1\tc\td\n")?;
        assert!(matches!(read_sample_manifest(&dup, dir.path()), Err(PipelineError::InvalidConfig(_))));

        let short = dir.path().join("short.tsv");
        fs::write(&short, "s1\ta\n")?;
        assert!(matches!(read_sample_manifest(&short, dir.path()), Err(PipelineError::InvalidConfig(_))));

        let empty = dir.path().join("empty.tsv");
        fs::write(&empty, "# nothing\n")?;
        assert!(matches!(read_sample_manifest(&empty, dir.path()), Err(PipelineError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_manifest_header_after_comments() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join("samples.tsv");
        fs::write(&manifest, "# batch 7\n\nsample\tfragments\tbarcodes\ns1\tf1.tsv\tb1.txt\n")?;
        let samples = read_sample_manifest(&manifest, dir.path())?;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "s1");
        Ok(())
    }
}
