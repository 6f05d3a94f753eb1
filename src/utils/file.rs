use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use flate2::read::MultiGzDecoder;
use crate::config::defs::{PipelineError, FRAGMENT_COMMENT};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Enum to hold either an uncompressed or gzipped file reader.
/// bgzip output is multi-member gzip, so the multi-member decoder is always used.
pub enum FileReader {
    Uncompressed(File),
    Gzipped(MultiGzDecoder<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens a plain or gzipped text file for buffered line reading.
///
/// # Arguments
///
/// * `path` - Path to the file.
///
/// # Returns
/// BufReader over the decompressed bytes, or MissingInput if the file cannot be opened.
pub fn open_text_reader(path: &Path) -> Result<BufReader<FileReader>, PipelineError> {
    let gz = is_gzipped(path).map_err(|e| PipelineError::missing(path, e))?;
    let file = File::open(path).map_err(|e| PipelineError::missing(path, e))?;
    let reader = if gz {
        FileReader::Gzipped(MultiGzDecoder::new(file))
    } else {
        FileReader::Uncompressed(file)
    };
    Ok(BufReader::with_capacity(1 << 20, reader))
}

/// Fails with MissingInput unless `path` is an existing, readable regular file.
pub fn ensure_readable(path: &Path) -> Result<(), PipelineError> {
    let metadata = fs::metadata(path).map_err(|e| PipelineError::missing(path, e))?;
    if !metadata.is_file() {
        return Err(PipelineError::missing(path, "not a regular file"));
    }
    File::open(path).map_err(|e| PipelineError::missing(path, e))?;
    Ok(())
}

/// Resolves `path` against `cwd` unless it is already absolute.
pub fn resolve_path(path: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

/// Builds `<dir>/<sample>_<suffix>` (or `<dir>/<sample>.<suffix>` with `delimiter` '.').
pub fn sample_path(dir: &Path, sample: &str, suffix: &str, delimiter: char) -> PathBuf {
    dir.join(format!("{}{}{}", sample, delimiter, suffix))
}

pub fn buffered_writer(path: &Path) -> Result<BufWriter<File>, PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .map_err(|e| PipelineError::IOError(format!("Failed to create {}: {}", path.display(), e)))?;
    Ok(BufWriter::with_capacity(1 << 20, file))
}

/// Reads the first whitespace-delimited column of every non-comment line.
/// Used for barcode lists and whitelists.
pub fn read_first_column(path: &Path) -> Result<Vec<String>, PipelineError> {
    let reader = open_text_reader(path)?;
    let mut values = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| PipelineError::missing(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(FRAGMENT_COMMENT) {
            continue;
        }
        if let Some(first) = trimmed.split_whitespace().next() {
            values.push(first.to_string());
        }
    }
    Ok(values)
}
