use clap::{Parser, ValueEnum};
use crate::config::defs::{DEFAULT_TARGET_READS, MACS2_DEFAULT_EXTSIZE, MACS2_DEFAULT_QVALUE, MACS2_TAG, SHORT_FRAGMENT_MAX_LEN};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum Species {
    #[default]
    #[value(name = "GRCh38")]
    GRCh38,
    #[value(name = "GRCm38")]
    GRCm38,
}

impl Species {
    /// Effective genome size shorthand understood by MACS2.
    pub fn genome_size(&self) -> &'static str {
        match self {
            Species::GRCh38 => "hs",
            Species::GRCm38 => "mm",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Species::GRCh38 => "GRCh38",
            Species::GRCm38 => "GRCm38",
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "scatac-batch", version, about = "Consensus peak calling and per-sample peak counting for multi-sample scATAC-seq")]
pub struct Arguments {

    #[arg(short = 's', long = "samples", help = "TSV manifest with columns: sample, fragments, barcodes")]
    pub samples: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named '<batch_name>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value = "batch")]
    pub batch_name: String,

    #[arg(long, default_value_t = false, help = "Downsample each sample to --target-reads fragments before joint peak calling")]
    pub downsample: bool,

    #[arg(long, default_value_t = DEFAULT_TARGET_READS)]
    pub target_reads: u64,

    #[arg(long = "species", default_value = "GRCh38", value_enum)]
    pub species: Species,

    #[arg(long, help = "Optional barcode whitelist; valid barcodes of every sample are restricted to it")]
    pub whitelist: Option<String>,

    #[clap(long, help = "Optional fixed seed mixed into every per-sample downsampling seed")]
    pub seed: Option<u64>,

    #[arg(long, default_value = "run", help = "Run identifier mixed into per-sample downsampling seeds")]
    pub run_id: String,

    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    #[arg(long, default_value = MACS2_TAG)]
    pub macs2: String,

    #[arg(long, default_value_t = MACS2_DEFAULT_EXTSIZE)]
    pub extsize: u32,

    #[arg(short = 'q', long = "qvalue", default_value_t = MACS2_DEFAULT_QVALUE)]
    pub qvalue: f64,

    #[arg(long, help = "BED file of custom peaks merged into the consensus peak set")]
    pub custom_peaks: Option<String>,

    #[arg(long, default_value_t = false, help = "Also call peaks from short fragments and merge them into the consensus set")]
    pub short_peaks: bool,

    #[arg(long, default_value_t = SHORT_FRAGMENT_MAX_LEN)]
    pub short_fragment_max: u64,

    #[arg(long, help = "External counting tool that writes the binary matrix; the native HDF5 writer is used when absent")]
    pub count_tool: Option<String>,
}
