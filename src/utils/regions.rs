//! Peak regions and the consensus region set shared by every sample of a batch.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::config::defs::PipelineError;
use crate::utils::file::{buffered_writer, open_text_reader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub id: String,
}

impl Region {
    pub fn new(chrom: &str, start: u64, end: u64) -> Self {
        Self {
            chrom: chrom.to_string(),
            start,
            end,
            id: region_id(chrom, start, end),
        }
    }

    fn coords(&self) -> (&str, u64, u64) {
        (&self.chrom, self.start, self.end)
    }
}

/// Stable identifier of a region, `chrom_start_end`.
pub fn region_id(chrom: &str, start: u64, end: u64) -> String {
    format!("{}_{}_{}", chrom, start, end)
}

/// Parses the first three columns of a BED-like line (narrowPeak included).
/// Returns None for track/browser/comment lines.
pub fn parse_bed_line(line: &str) -> Result<Option<Region>, PipelineError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.starts_with("track")
        || trimmed.starts_with("browser")
    {
        return Ok(None);
    }
    let mut fields = trimmed.split('\t');
    let chrom = fields
        .next()
        .ok_or_else(|| PipelineError::ParseError(format!("Missing chrom in '{}'", line)))?;
    let start = fields
        .next()
        .ok_or_else(|| PipelineError::ParseError(format!("Missing start in '{}'", line)))?
        .parse::<u64>()
        .map_err(|e| PipelineError::ParseError(format!("Invalid start in '{}': {}", line, e)))?;
    let end = fields
        .next()
        .ok_or_else(|| PipelineError::ParseError(format!("Missing end in '{}'", line)))?
        .parse::<u64>()
        .map_err(|e| PipelineError::ParseError(format!("Invalid end in '{}': {}", line, e)))?;
    if end <= start {
        return Err(PipelineError::ParseError(format!("Empty or inverted interval in '{}'", line)));
    }
    Ok(Some(Region::new(chrom, start, end)))
}

/// Reads a narrowPeak or BED file into unsorted regions.
pub fn read_regions(path: &Path) -> Result<Vec<Region>, PipelineError> {
    let reader = open_text_reader(path)?;
    let mut regions = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| PipelineError::missing(path, e))?;
        if let Some(region) = parse_bed_line(&line)? {
            regions.push(region);
        }
    }
    Ok(regions)
}


/// Ordered, deduplicated region set. Sorted by (chrom, start, end); ids are unique.
/// Immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusRegionSet {
    regions: Vec<Region>,
}

impl ConsensusRegionSet {
    /// Sorts and drops coordinate duplicates (summit-split peaks share coordinates).
    pub fn from_regions(mut regions: Vec<Region>) -> Self {
        regions.sort_unstable_by(|a, b| a.coords().cmp(&b.coords()));
        regions.dedup_by(|a, b| a.coords() == b.coords());
        Self { regions }
    }

    /// Union of several region sets with overlapping or book-ended intervals merged,
    /// the way `bedtools merge` collapses a concatenated, sorted BED.
    pub fn merged<I>(sets: I) -> Self
    where
        I: IntoIterator<Item = Vec<Region>>,
    {
        let mut all: Vec<Region> = sets.into_iter().flatten().collect();
        all.sort_unstable_by(|a, b| a.coords().cmp(&b.coords()));

        let mut merged: Vec<(String, u64, u64)> = Vec::with_capacity(all.len());
        for region in all {
            match merged.last_mut() {
                Some((chrom, _, end)) if *chrom == region.chrom && region.start <= *end => {
                    *end = (*end).max(region.end);
                }
                _ => merged.push((region.chrom, region.start, region.end)),
            }
        }
        Self {
            regions: merged
                .into_iter()
                .map(|(chrom, start, end)| Region::new(&chrom, start, end))
                .collect(),
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.id.as_str())
    }

    /// Writes a 4-column BED: chrom, start, end, id.
    pub fn write_bed(&self, path: &Path) -> Result<(), PipelineError> {
        let mut writer = buffered_writer(path)?;
        for region in &self.regions {
            writeln!(writer, "{}\t{}\t{}\t{}", region.chrom, region.start, region.end, region.id)?;
        }
        writer.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_narrowpeak_line() -> Result<(), PipelineError> {
        let line = "chr1\t9980\t10480\tbatch_peak_1\t62\t.\t4.1\t8.2\t6.2\t211";
        let region = parse_bed_line(line)?.ok_or_else(|| PipelineError::ParseError("none".into()))?;
        assert_eq!(region, Region::new("chr1", 9980, 10480));
        assert_eq!(region.id, "chr1_9980_10480");
        assert!(parse_bed_line("track name=peaks")?.is_none());
        assert!(parse_bed_line("chr1\t50\t50").is_err());
        Ok(())
    }

    #[test]
    fn test_from_regions_sorts_and_dedups() {
        let set = ConsensusRegionSet::from_regions(vec![
            Region::new("chr2", 10, 20),
            Region::new("chr1", 500, 900),
            Region::new("chr1", 100, 200),
            Region::new("chr1", 100, 200),
            Region::new("chr1", 100, 150),
        ]);
        let ids: Vec<&str> = set.ids().collect();
        assert_eq!(ids, vec!["chr1_100_150", "chr1_100_200", "chr1_500_900", "chr2_10_20"]);
    }

    #[test]
    fn test_merged_collapses_overlaps() {
        let called = vec![Region::new("chr1", 100, 200), Region::new("chr1", 400, 500)];
        let custom = vec![Region::new("chr1", 150, 260), Region::new("chr1", 260, 300), Region::new("chr3", 1, 5)];
        let set = ConsensusRegionSet::merged([called, custom]);
        let ids: Vec<&str> = set.ids().collect();
        assert_eq!(ids, vec!["chr1_100_300", "chr1_400_500", "chr3_1_5"]);
        for pair in set.regions().windows(2) {
            if pair[0].chrom == pair[1].chrom {
                assert!(pair[0].end < pair[1].start);
            }
        }
    }

    #[test]
    fn test_read_and_write_bed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("peaks.narrowPeak");
        fs::write(&input, "chr1\t10\t20\tp1\t1\t.\t1\t1\t1\t5\nchr1\t5\t8\tp2\t1\t.\t1\t1\t1\t1\n")?;
        let set = ConsensusRegionSet::from_regions(read_regions(&input)?);
        let out = dir.path().join("consensus.bed");
        set.write_bed(&out)?;
        assert_eq!(fs::read_to_string(&out)?, "chr1\t5\t8\tchr1_5_8\nchr1\t10\t20\tchr1_10_20\n");
        Ok(())
    }
}
