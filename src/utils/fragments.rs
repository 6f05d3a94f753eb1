// Fragment file records: chrom, start, end, barcode, duplicate_count
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use crate::config::defs::{PipelineError, FRAGMENT_COMMENT};
use crate::utils::file::{open_text_reader, FileReader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub barcode: String,
    pub count: u32,
}

impl Fragment {
    pub fn parse_line(line: &str) -> Result<Self, PipelineError> {
        let mut fields = line.split('\t');
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| PipelineError::ParseError(format!("Missing {} in fragment line '{}'", name, line)))
        };
        let chrom = next("chrom")?.to_string();
        let start = parse_u64(next("start")?, "start", line)?;
        let end = parse_u64(next("end")?, "end", line)?;
        let barcode = next("barcode")?.to_string();
        let count = next("duplicate_count")?
            .trim()
            .parse::<u32>()
            .map_err(|e| PipelineError::ParseError(format!("Invalid duplicate_count in '{}': {}", line, e)))?;
        if end < start {
            return Err(PipelineError::ParseError(format!("Fragment end before start: '{}'", line)));
        }
        Ok(Self { chrom, start, end, barcode, count })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

fn parse_u64(field: &str, name: &str, line: &str) -> Result<u64, PipelineError> {
    field
        .parse::<u64>()
        .map_err(|e| PipelineError::ParseError(format!("Invalid {} in '{}': {}", name, line, e)))
}

/// True for lines that carry a fragment record (not blank, not a `#` header).
#[inline]
pub fn is_record_line(line: &str) -> bool {
    !line.is_empty() && !line.starts_with(FRAGMENT_COMMENT)
}

/// Streams raw record lines of a fragment file, skipping headers.
/// Yields the line without its trailing newline.
pub struct RecordLines {
    path: PathBuf,
    reader: BufReader<FileReader>,
    buf: String,
}

impl RecordLines {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            path: path.to_path_buf(),
            reader: open_text_reader(path)?,
            buf: String::new(),
        })
    }

    /// Advances to the next record; returns None at EOF.
    pub fn next_line(&mut self) -> Option<Result<&str, PipelineError>> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed_len = self.buf.trim_end_matches(['\n', '\r']).len();
                    self.buf.truncate(trimmed_len);
                    if is_record_line(&self.buf) {
                        return Some(Ok(&self.buf));
                    }
                }
                Err(e) => return Some(Err(PipelineError::missing(&self.path, e))),
            }
        }
    }
}

/// Iterator of parsed fragments over a fragment file.
pub struct FragmentReader {
    lines: RecordLines,
}

impl FragmentReader {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self { lines: RecordLines::open(path)? })
    }
}

impl Iterator for FragmentReader {
    type Item = Result<Fragment, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next_line()? {
            Ok(line) => Some(Fragment::parse_line(line)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Counts fragment records in a file (one per line, duplicate_count is not summed).
///
/// # Arguments
///
/// * `path` - Valid path to a plain or gzipped fragment file.
///
/// # Returns
/// u64: number of records.
pub fn record_counter(path: &Path) -> Result<u64, PipelineError> {
    let mut lines = RecordLines::open(path)?;
    let mut counter = 0u64;
    while let Some(line) = lines.next_line() {
        line?;
        counter += 1;
    }
    Ok(counter)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_line() -> Result<(), PipelineError> {
        let frag = Fragment::parse_line("chr2\t100\t250\tACGT-1\t5")?;
        assert_eq!(frag.chrom, "chr2");
        assert_eq!((frag.start, frag.end), (100, 250));
        assert_eq!(frag.barcode, "ACGT-1");
        assert_eq!(frag.count, 5);
        assert_eq!(frag.len(), 150);
        Ok(())
    }

    #[test]
    fn test_parse_line_rejects_short_records() {
        assert!(matches!(
            Fragment::parse_line("chr2\t100\t250\tACGT-1"),
            Err(PipelineError::ParseError(_))
        ));
        assert!(Fragment::parse_line("chr2\tx\t250\tACGT-1\t1").is_err());
        assert!(Fragment::parse_line("chr2\t300\t250\tACGT-1\t1").is_err());
    }

    #[test]
    fn test_record_counter_skips_headers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("f.tsv");
        fs::write(&path, "# id=sample\n# pipeline\nchr1\t1\t5\tA\t1\nchr1\t6\t9\tB\t7\n\n")?;
        assert_eq!(record_counter(&path)?, 2);
        let frags: Vec<Fragment> = FragmentReader::open(&path)?.collect::<Result<_, _>>()?;
        assert_eq!(frags[1].count, 7);
        Ok(())
    }
}
