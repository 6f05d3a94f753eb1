use std::path::PathBuf;
use std::sync::Arc;
use crate::cli::Arguments;
use lazy_static::lazy_static;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Semaphore;

// External software
pub const MACS2_TAG: &str = "macs2";
pub const COUNT_TOOL_TAG: &str = "count-tool";


lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(MACS2_TAG, (2, 2));
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Macs2Subcommand {
    Callpeak,
}

// Static Filenames
pub const DOWNSAMPLE_DIR: &str = "downsample";
pub const PEAK_CALL_DIR: &str = "peaks";
pub const CONSENSUS_PEAKS_SUFFIX: &str = "consensus_peaks.bed";
pub const PEAK_COUNT_SUFFIX: &str = "peak_count";
pub const NARROWPEAK_SUFFIX: &str = "_peaks.narrowPeak";


// Static Parameters

pub const MACS2_FORMAT: &str = "BEDPE";
pub const MACS2_DEFAULT_QVALUE: f64 = 0.05;
pub const MACS2_DEFAULT_EXTSIZE: u32 = 50;
pub const MACS2_KEEP_DUP: &str = "all";
pub const SHORT_FRAGMENT_MAX_LEN: u64 = 150;
pub const DEFAULT_TARGET_READS: u64 = 50_000_000;

pub const FEATURE_TYPE_PEAKS: &str = "Peaks";

pub const FRAGMENT_COMMENT: char = '#';


/// Everything a stage needs from the run, shared across tasks as `Arc<RunConfig>`.
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub worker_semaphore: Arc<Semaphore>,
    pub workers: usize,
}


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing input: {}: {reason}", path.display())]
    MissingInput { path: PathBuf, reason: String },

    #[error("Empty input: {} has no fragment records", .0.display())]
    EmptyInput(PathBuf),

    #[error("Joint region call failed; samples without downsampled tracks: {}", samples.join(", "))]
    JointCallFailure { samples: Vec<String> },

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Matrix write failed: {0}")]
    MatrixWrite(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{} sample(s) failed: {}", failed.len(), failed.join(", "))]
    SampleFailures { failed: Vec<String> },
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IOError(err.to_string())
    }
}

impl PipelineError {
    pub fn missing(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::MissingInput {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
