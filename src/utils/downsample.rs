use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use rand_distr::{Bernoulli, Distribution};
use tempfile::NamedTempFile;

use crate::config::defs::PipelineError;
use crate::utils::file::ensure_readable;
use crate::utils::fragments::{record_counter, RecordLines};
use crate::utils::system::generate_rng;

const CANCEL_CHECK_INTERVAL: u64 = 1 << 16;

#[derive(Debug, Clone, Copy)]
pub struct DownsampleParams {
    pub enabled: bool,
    pub target_reads: u64,
    pub seed: u64,
}

/// Track handed to region calling. Either the untouched input or a fresh subsample.
#[derive(Debug, Clone, PartialEq)]
pub enum DownsampleOutput {
    PassThrough(PathBuf),
    Subsampled {
        path: PathBuf,
        total_reads: u64,
        rate: f64,
        kept: u64,
    },
}

impl DownsampleOutput {
    pub fn path(&self) -> &Path {
        match self {
            DownsampleOutput::PassThrough(path) => path,
            DownsampleOutput::Subsampled { path, .. } => path,
        }
    }
}

/// Probability of keeping a record, `min(1, target / total)`.
pub fn downsampling_rate(total_reads: u64, target_reads: u64) -> f64 {
    if total_reads == 0 {
        return 0.0;
    }
    (target_reads as f64 / total_reads as f64).min(1.0)
}

/// Produces the depth-normalized fragment track of one sample.
///
/// Disabled: returns a reference to `input` itself. Enabled: keeps each record with an independent
/// Bernoulli trial at `downsampling_rate`, in input order, written verbatim to `output`.
///
/// # Arguments
///
/// * `input` - Deduplicated fragment file (plain or gzipped).
/// * `output` - Destination of the subsample when downsampling is enabled.
/// * `params` - Enabled flag, target depth and the per-sample seed.
/// * `cancel` - Raised by the scheduler when a sibling sample already failed.
///
/// # Returns
/// DownsampleOutput, or MissingInput / EmptyInput / Cancelled.
pub fn downsample_fragments(
    input: &Path,
    output: &Path,
    params: DownsampleParams,
    cancel: &AtomicBool,
) -> Result<DownsampleOutput, PipelineError> {
    ensure_readable(input)?;

    if !params.enabled {
        let mut lines = RecordLines::open(input)?;
        match lines.next_line() {
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => return Err(PipelineError::EmptyInput(input.to_path_buf())),
        }
        info!("Downsampling disabled; using {} as is", input.display());
        return Ok(DownsampleOutput::PassThrough(input.to_path_buf()));
    }

    let total_reads = record_counter(input)?;
    if total_reads == 0 {
        return Err(PipelineError::EmptyInput(input.to_path_buf()));
    }
    let rate = downsampling_rate(total_reads, params.target_reads);
    info!(
        "{}: total_reads {}, target_reads {}, rate {:.6}",
        input.display(),
        total_reads,
        params.target_reads,
        rate
    );

    let trial = Bernoulli::new(rate)
        .map_err(|e| PipelineError::InvalidConfig(format!("Invalid downsampling rate {}: {}", rate, e)))?;
    let mut rng = generate_rng(params.seed);

    // Staged next to the output; dropped (and removed) on every early return
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staged = NamedTempFile::new_in(parent)?;
    let mut writer = BufWriter::with_capacity(1 << 20, staged);
    let mut lines = RecordLines::open(input)?;
    let mut seen = 0u64;
    let mut kept = 0u64;
    while let Some(line) = lines.next_line() {
        let line = line?;
        seen += 1;
        if seen % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled(format!("downsampling of {}", input.display())));
        }
        if trial.sample(&mut rng) {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            kept += 1;
        }
    }
    writer.flush()?;
    let staged = writer
        .into_inner()
        .map_err(|e| PipelineError::IOError(format!("Cannot finish {}: {}", output.display(), e)))?;
    staged
        .persist(output)
        .map_err(|e| PipelineError::IOError(format!("Cannot write {}: {}", output.display(), e)))?;
    debug!("{}: kept {} of {} records", output.display(), kept, seen);

    Ok(DownsampleOutput::Subsampled {
        path: output.to_path_buf(),
        total_reads,
        rate,
        kept,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_fragments(path: &Path, n: usize) -> std::io::Result<String> {
        let mut body = String::new();
        for i in 0..n {
            body.push_str(&format!("chr1\t{}\t{}\tBC{}\t{}\n", i * 10, i * 10 + 50, i % 7, 1 + i % 3));
        }
        fs::write(path, &body)?;
        Ok(body)
    }

    fn params(enabled: bool, target_reads: u64, seed: u64) -> DownsampleParams {
        DownsampleParams { enabled, target_reads, seed }
    }

    #[test]
    fn test_rate() {
        assert_eq!(downsampling_rate(100, 1000), 1.0);
        assert_eq!(downsampling_rate(100, 100), 1.0);
        assert!((downsampling_rate(1000, 250) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_under_target_keeps_every_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.tsv");
        let output = dir.path().join("out.tsv");
        let body = write_fragments(&input, 500)?;

        let result = downsample_fragments(&input, &output, params(true, 500, 3), &AtomicBool::new(false))?;
        match result {
            DownsampleOutput::Subsampled { rate, kept, total_reads, .. } => {
                assert_eq!(rate, 1.0);
                assert_eq!(kept, 500);
                assert_eq!(total_reads, 500);
            }
            other => panic!("Expected a subsample, got {:?}", other),
        }
        let mut expected: Vec<&str> = body.lines().collect();
        let written = fs::read_to_string(&output)?;
        let mut actual: Vec<&str> = written.lines().collect();
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(actual, expected);
        Ok(())
    }

    #[test]
    fn test_disabled_is_pass_through() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.tsv");
        let output = dir.path().join("never_written.tsv");
        write_fragments(&input, 50)?;

        for target in [1, 10, 1_000_000] {
            let result = downsample_fragments(&input, &output, params(false, target, 1), &AtomicBool::new(false))?;
            assert_eq!(result, DownsampleOutput::PassThrough(input.clone()));
            assert_eq!(fs::read(result.path())?, fs::read(&input)?);
        }
        assert!(!output.exists());
        Ok(())
    }

    #[test]
    fn test_expected_size_converges() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.tsv");
        let output = dir.path().join("out.tsv");
        write_fragments(&input, 2_000)?;

        let trials = 1_000u64;
        let target = 500u64;
        let mut total_kept = 0u64;
        for seed in 0..trials {
            match downsample_fragments(&input, &output, params(true, target, seed), &AtomicBool::new(false))? {
                DownsampleOutput::Subsampled { kept, .. } => total_kept += kept,
                other => panic!("Expected a subsample, got {:?}", other),
            }
        }
        let mean = total_kept as f64 / trials as f64;
        assert!((mean - target as f64).abs() / target as f64 <= 0.05, "mean kept {} too far from {}", mean, target);
        Ok(())
    }

    #[test]
    fn test_same_seed_is_reproducible() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.tsv");
        write_fragments(&input, 1_000)?;
        let a = dir.path().join("a.tsv");
        let b = dir.path().join("b.tsv");
        downsample_fragments(&input, &a, params(true, 300, 42), &AtomicBool::new(false))?;
        downsample_fragments(&input, &b, params(true, 300, 42), &AtomicBool::new(false))?;
        assert_eq!(fs::read(&a)?, fs::read(&b)?);
        Ok(())
    }

    #[test]
    fn test_empty_and_missing_inputs_fail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let empty = dir.path().join("empty.tsv");
        fs::write(&empty, "# header only\n")?;
        let output = dir.path().join("out.tsv");

        for enabled in [true, false] {
            let err = downsample_fragments(&empty, &output, params(enabled, 10, 0), &AtomicBool::new(false)).unwrap_err();
            assert!(matches!(err, PipelineError::EmptyInput(_)));
        }
        let err = downsample_fragments(&dir.path().join("nope.tsv"), &output, params(true, 10, 0), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { .. }));
        Ok(())
    }

    #[test]
    fn test_cancelled_sibling_stops_early() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.tsv");
        write_fragments(&input, (CANCEL_CHECK_INTERVAL + 10) as usize)?;
        let out_dir = dir.path().join("downsample");
        let output = out_dir.join("s1.fragments.tsv");
        let err = downsample_fragments(&input, &output, params(true, 10, 0), &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert!(!output.exists(), "A cancelled run must not leave a partial subsample");
        assert_eq!(fs::read_dir(&out_dir)?.count(), 0, "Staged file is removed");
        Ok(())
    }
}
