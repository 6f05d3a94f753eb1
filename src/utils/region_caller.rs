//! Joint region calling over every sample's downsampled track.

use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use log::{info, warn};
use tempfile::TempDir;

use crate::config::defs::{Macs2Subcommand, PipelineError, MACS2_TAG, NARROWPEAK_SUFFIX};
use crate::utils::command::macs2::{arg_generator, Macs2Config};
use crate::utils::command::run_tool;
use crate::utils::file::{buffered_writer, ensure_readable};
use crate::utils::fragments::{Fragment, RecordLines};
use crate::utils::regions::{read_regions, ConsensusRegionSet, Region};

/// Parameters passed through to the region caller unchanged.
#[derive(Debug, Clone)]
pub struct RegionCallConfig {
    pub name: String,
    pub genome_size: String,
    pub qvalue: f64,
    pub extsize: u32,
}

/// Opaque region-calling capability: N fragment tracks in, one region sequence out.
/// Implementations must treat the tracks as independent signal and pool them in one call.
pub trait RegionCaller: Send + Sync {
    fn call_regions<'a>(
        &'a self,
        tracks: &'a [PathBuf],
        config: &'a RegionCallConfig,
        out_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Vec<Region>, PipelineError>>;
}

pub struct Macs2RegionCaller {
    pub program: String,
}

impl Macs2RegionCaller {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl RegionCaller for Macs2RegionCaller {
    fn call_regions<'a>(
        &'a self,
        tracks: &'a [PathBuf],
        config: &'a RegionCallConfig,
        out_dir: &'a Path,
    ) -> BoxFuture<'a, Result<Vec<Region>, PipelineError>> {
        Box::pin(async move {
            std::fs::create_dir_all(out_dir)?;
            let macs2_config = Macs2Config {
                subcommand: Macs2Subcommand::Callpeak,
                name: config.name.clone(),
                genome_size: config.genome_size.clone(),
                qvalue: config.qvalue,
                extsize: config.extsize,
            };
            let args = arg_generator(&macs2_config, tracks, out_dir);
            run_tool(MACS2_TAG, &self.program, &args).await?;

            let narrow_peak = out_dir.join(format!("{}{}", config.name, NARROWPEAK_SUFFIX));
            read_regions(&narrow_peak)
        })
    }
}


/// One sample's input to the barrier: the track if its downsampler succeeded.
#[derive(Debug, Clone)]
pub struct SampleTrack {
    pub sample: String,
    pub track: Option<PathBuf>,
}

/// Extra region sources merged into the joint call.
#[derive(Debug, Clone, Default)]
pub struct ConsensusExtras {
    pub custom_peaks: Option<PathBuf>,
    pub short_fragment_max: Option<u64>,
}

/// Builds the consensus region set from all samples at once.
///
/// All-or-nothing: a sample without a readable track fails the whole call with
/// JointCallFailure before the caller is invoked.
///
/// # Arguments
///
/// * `caller` - Region-calling capability.
/// * `tracks` - One entry per sample in the batch.
/// * `config` - Pass-through caller parameters.
/// * `extras` - Custom peak BED and short-fragment peak calling.
/// * `out_dir` - Directory for caller outputs.
///
/// # Returns
/// The sorted ConsensusRegionSet.
pub async fn call_consensus_regions<C: RegionCaller + ?Sized>(
    caller: &C,
    tracks: &[SampleTrack],
    config: &RegionCallConfig,
    extras: &ConsensusExtras,
    out_dir: &Path,
) -> Result<ConsensusRegionSet, PipelineError> {
    if tracks.is_empty() {
        return Err(PipelineError::InvalidConfig("No samples to call regions on".to_string()));
    }

    let mut missing = Vec::new();
    let mut paths = Vec::with_capacity(tracks.len());
    for sample_track in tracks {
        match &sample_track.track {
            Some(path) => match ensure_readable(path) {
                Ok(()) => paths.push(path.clone()),
                Err(e) => {
                    warn!("Sample {}: {}", sample_track.sample, e);
                    missing.push(sample_track.sample.clone());
                }
            },
            None => missing.push(sample_track.sample.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(PipelineError::JointCallFailure { samples: missing });
    }

    info!("Calling regions jointly over {} samples", paths.len());
    let called = caller.call_regions(&paths, config, out_dir).await?;
    info!("Joint call produced {} regions", called.len());

    let mut extra_sets: Vec<Vec<Region>> = Vec::new();

    if let Some(max_len) = extras.short_fragment_max {
        let paths_owned = paths.clone();
        let (short_dir, short_tracks) = tokio::task::spawn_blocking(move || write_short_tracks(&paths_owned, max_len))
            .await
            .map_err(|e| PipelineError::IOError(format!("Short fragment task failed: {}", e)))??;
        let short_config = RegionCallConfig {
            name: format!("{}_short", config.name),
            ..config.clone()
        };
        let short = caller.call_regions(&short_tracks, &short_config, out_dir).await?;
        info!("Short fragment call produced {} regions", short.len());
        drop(short_dir);
        extra_sets.push(short);
    }

    if let Some(custom) = &extras.custom_peaks {
        let custom_regions = read_regions(custom)?;
        info!("Merging {} custom regions from {}", custom_regions.len(), custom.display());
        extra_sets.push(custom_regions);
    }

    let consensus = if extra_sets.is_empty() {
        ConsensusRegionSet::from_regions(called)
    } else {
        ConsensusRegionSet::merged(std::iter::once(called).chain(extra_sets))
    };
    Ok(consensus)
}

/// Writes, per track, only the fragments no longer than `max_len` into a scoped temp dir.
fn write_short_tracks(tracks: &[PathBuf], max_len: u64) -> Result<(TempDir, Vec<PathBuf>), PipelineError> {
    let dir = tempfile::Builder::new().prefix("short_fragments").tempdir()?;
    let mut out_paths = Vec::with_capacity(tracks.len());
    for (i, track) in tracks.iter().enumerate() {
        let out_path = dir.path().join(format!("track_{}.tsv", i));
        let mut writer = buffered_writer(&out_path)?;
        let mut lines = RecordLines::open(track)?;
        while let Some(line) = lines.next_line() {
            let line = line?;
            if Fragment::parse_line(line)?.len() <= max_len {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
        out_paths.push(out_path);
    }
    Ok((dir, out_paths))
}
