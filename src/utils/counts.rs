//! Per-sample peak counting: barcode filter, interval join, sort-merge grouping.

use std::path::Path;

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::defs::PipelineError;
use crate::utils::file::{ensure_readable, read_first_column};
use crate::utils::fragments::{Fragment, FragmentReader};
use crate::utils::intervals::IntervalJoiner;
use crate::utils::regions::ConsensusRegionSet;

/// Valid cell barcodes of one sample, interned to indices in lexicographic order.
#[derive(Debug, Clone, Default)]
pub struct BarcodeIndex {
    barcodes: Vec<String>,
    lookup: FxHashMap<String, u32>,
}

impl BarcodeIndex {
    /// Builds the index from the cell calls, restricted to `whitelist` when one is given.
    pub fn new<I>(valid: I, whitelist: Option<&FxHashSet<String>>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut barcodes: Vec<String> = valid
            .into_iter()
            .filter(|bc| whitelist.is_none_or(|wl| wl.contains(bc)))
            .collect();
        barcodes.sort_unstable();
        barcodes.dedup();
        let lookup = barcodes
            .iter()
            .enumerate()
            .map(|(i, bc)| (bc.clone(), i as u32))
            .collect();
        Self { barcodes, lookup }
    }

    #[inline]
    pub fn get(&self, barcode: &str) -> Option<u32> {
        self.lookup.get(barcode).copied()
    }

    pub fn barcodes(&self) -> &[String] {
        &self.barcodes
    }

    pub fn len(&self) -> usize {
        self.barcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }
}

/// Reads a sample's cell-call list.
pub fn load_valid_barcodes(path: &Path, whitelist: Option<&FxHashSet<String>>) -> Result<BarcodeIndex, PipelineError> {
    ensure_readable(path)?;
    Ok(BarcodeIndex::new(read_first_column(path)?, whitelist))
}

pub fn load_whitelist(path: &Path) -> Result<FxHashSet<String>, PipelineError> {
    ensure_readable(path)?;
    Ok(read_first_column(path)?.into_iter().collect())
}


/// One fragment-region overlap. Field order is the sort key: region index, then barcode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OverlapTuple {
    pub region: u32,
    pub barcode: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountEntry {
    pub region: u32,
    pub barcode: u32,
    pub count: u64,
}

/// Sparse region x barcode counts of one sample, entries ordered by (region, barcode).
#[derive(Debug, Clone, Default)]
pub struct CountMatrix {
    pub sample: String,
    pub species: String,
    pub features: Vec<String>,
    pub barcodes: Vec<String>,
    pub entries: Vec<CountEntry>,
}

impl CountMatrix {
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.features.len(), self.barcodes.len())
    }

    /// (region_id, barcode, count) rows, in matrix order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.entries.iter().map(|e| {
            (
                self.features[e.region as usize].as_str(),
                self.barcodes[e.barcode as usize].as_str(),
                e.count,
            )
        })
    }
}


/// Filters fragments to valid barcodes and joins them against the regions.
/// Every overlapped region gets the fragment's full duplicate count.
pub fn collect_overlaps<I, J>(fragments: I, barcodes: &BarcodeIndex, joiner: &J) -> Result<Vec<OverlapTuple>, PipelineError>
where
    I: IntoIterator<Item = Result<Fragment, PipelineError>>,
    J: IntervalJoiner + ?Sized,
{
    let mut tuples = Vec::new();
    let mut hits = Vec::new();
    let mut kept = 0u64;
    let mut dropped = 0u64;
    for fragment in fragments {
        let fragment = fragment?;
        let Some(barcode) = barcodes.get(&fragment.barcode) else {
            dropped += 1;
            continue;
        };
        kept += 1;
        hits.clear();
        joiner.overlaps(&fragment, &mut hits);
        tuples.extend(hits.iter().map(|&region| OverlapTuple { region, barcode, count: fragment.count }));
    }
    debug!("Barcode filter kept {} fragments, dropped {}; {} overlaps", kept, dropped, tuples.len());
    Ok(tuples)
}

/// Sorts overlaps by (region, barcode) and sums counts in one linear scan,
/// emitting an entry each time the key changes.
pub fn group_overlaps(mut tuples: Vec<OverlapTuple>) -> Vec<CountEntry> {
    tuples.par_sort_unstable_by_key(|t| (t.region, t.barcode));

    let mut entries = Vec::new();
    let mut iter = tuples.into_iter();
    let Some(first) = iter.next() else {
        return entries;
    };
    let mut current = CountEntry { region: first.region, barcode: first.barcode, count: first.count as u64 };
    for t in iter {
        if t.region == current.region && t.barcode == current.barcode {
            current.count += t.count as u64;
        } else {
            entries.push(current);
            current = CountEntry { region: t.region, barcode: t.barcode, count: t.count as u64 };
        }
    }
    entries.push(current);
    entries
}

/// Builds the count matrix of one sample from its full-depth fragments.
///
/// # Arguments
///
/// * `fragments_path` - Original deduplicated fragment file of the sample (never the subsample).
/// * `regions` - Consensus region set of the batch.
/// * `joiner` - Interval join over `regions`.
/// * `barcodes` - Valid barcodes of the sample.
/// * `sample` - Sample name, stored in the matrix.
/// * `species` - Species tag, stored in the matrix.
///
/// # Returns
/// CountMatrix; empty (zero entries) when there are no valid barcodes.
pub fn count_sample<J: IntervalJoiner + ?Sized>(
    fragments_path: &Path,
    regions: &ConsensusRegionSet,
    joiner: &J,
    barcodes: &BarcodeIndex,
    sample: &str,
    species: &str,
) -> Result<CountMatrix, PipelineError> {
    ensure_readable(fragments_path)?;

    let mut matrix = CountMatrix {
        sample: sample.to_string(),
        species: species.to_string(),
        features: regions.ids().map(str::to_string).collect(),
        barcodes: barcodes.barcodes().to_vec(),
        entries: Vec::new(),
    };

    if barcodes.is_empty() {
        warn!("Sample {} has no valid barcodes; writing an empty matrix", sample);
        return Ok(matrix);
    }

    let tuples = collect_overlaps(FragmentReader::open(fragments_path)?, barcodes, joiner)?;
    matrix.entries = group_overlaps(tuples);
    info!(
        "Sample {}: {} regions x {} barcodes, {} non-zero entries",
        sample,
        matrix.features.len(),
        matrix.barcodes.len(),
        matrix.nnz()
    );
    Ok(matrix)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;
    use crate::utils::intervals::LapperJoiner;
    use crate::utils::regions::Region;

    fn regions() -> ConsensusRegionSet {
        ConsensusRegionSet::from_regions(vec![
            Region::new("chr1", 100, 200),
            Region::new("chr1", 180, 400),
            Region::new("chr2", 1000, 1100),
        ])
    }

    fn index(barcodes: &[&str]) -> BarcodeIndex {
        BarcodeIndex::new(barcodes.iter().map(|s| s.to_string()), None)
    }

    fn frag(chrom: &str, start: u64, end: u64, barcode: &str, count: u32) -> Result<Fragment, PipelineError> {
        Ok(Fragment { chrom: chrom.into(), start, end, barcode: barcode.into(), count })
    }

    #[test]
    fn test_barcode_index_order_and_whitelist() {
        let wl: FxHashSet<String> = ["B", "C", "Z"].iter().map(|s| s.to_string()).collect();
        let idx = BarcodeIndex::new(["C", "A", "B", "C"].iter().map(|s| s.to_string()), Some(&wl));
        assert_eq!(idx.barcodes(), &["B".to_string(), "C".to_string()]);
        assert_eq!(idx.get("C"), Some(1));
        assert_eq!(idx.get("A"), None);
    }

    #[test]
    fn test_single_overlap_yields_single_entry() -> Result<(), PipelineError> {
        let set = regions();
        let joiner = LapperJoiner::new(&set);
        let barcodes = index(&["AAA"]);
        let tuples = collect_overlaps(vec![frag("chr2", 1050, 1060, "AAA", 5)], &barcodes, &joiner)?;
        let entries = group_overlaps(tuples);
        assert_eq!(entries, vec![CountEntry { region: 2, barcode: 0, count: 5 }]);
        Ok(())
    }

    #[test]
    fn test_invalid_barcodes_are_dropped() -> Result<(), PipelineError> {
        let set = regions();
        let joiner = LapperJoiner::new(&set);
        let barcodes = index(&["AAA"]);
        let tuples = collect_overlaps(
            vec![frag("chr1", 120, 130, "AAA", 1), frag("chr1", 120, 130, "NOPE", 9)],
            &barcodes,
            &joiner,
        )?;
        assert_eq!(tuples, vec![OverlapTuple { region: 0, barcode: 0, count: 1 }]);
        Ok(())
    }

    #[test]
    fn test_group_overlaps_sums_per_key() {
        let tuples = vec![
            OverlapTuple { region: 1, barcode: 0, count: 2 },
            OverlapTuple { region: 0, barcode: 1, count: 1 },
            OverlapTuple { region: 1, barcode: 0, count: 3 },
            OverlapTuple { region: 0, barcode: 0, count: 4 },
            OverlapTuple { region: 0, barcode: 1, count: 1 },
        ];
        assert_eq!(
            group_overlaps(tuples),
            vec![
                CountEntry { region: 0, barcode: 0, count: 4 },
                CountEntry { region: 0, barcode: 1, count: 2 },
                CountEntry { region: 1, barcode: 0, count: 5 },
            ]
        );
        assert!(group_overlaps(Vec::new()).is_empty());
    }

    #[test]
    fn test_per_barcode_totals_follow_overlap_multiplicity() -> Result<(), PipelineError> {
        let set = regions();
        let joiner = LapperJoiner::new(&set);
        let barcodes = index(&["AAA", "CCC"]);
        let fragments = vec![
            frag("chr1", 150, 160, "AAA", 3),  // region 0 only
            frag("chr1", 190, 195, "AAA", 2),  // regions 0 and 1
            frag("chr1", 500, 600, "AAA", 7),  // no region
            frag("chr2", 1000, 1010, "CCC", 4), // region 2 only
            frag("chr2", 1090, 1200, "CCC", 1), // region 2 only
        ];
        let mut filtered_sum: HashMap<u32, u64> = HashMap::new();
        let mut expected: HashMap<u32, u64> = HashMap::new();
        for f in fragments.iter().flatten() {
            let bc = barcodes.get(&f.barcode).unwrap_or(u32::MAX);
            let mut hits = Vec::new();
            joiner.overlaps(f, &mut hits);
            *filtered_sum.entry(bc).or_default() += f.count as u64;
            *expected.entry(bc).or_default() += f.count as u64 * hits.len() as u64;
        }

        let entries = group_overlaps(collect_overlaps(fragments, &barcodes, &joiner)?);
        let mut totals: HashMap<u32, u64> = HashMap::new();
        for e in &entries {
            *totals.entry(e.barcode).or_default() += e.count;
        }
        assert_eq!(totals, expected);
        // CCC never overlaps more than one region: totals match its filtered duplicate counts
        assert_eq!(totals[&1], filtered_sum[&1]);
        Ok(())
    }

    #[test]
    fn test_count_sample_empty_barcodes_and_missing_fragments() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let frags = dir.path().join("f.tsv");
        fs::write(&frags, "chr1\t120\t130\tAAA\t5\n")?;
        let set = regions();
        let joiner = LapperJoiner::new(&set);

        let empty = count_sample(&frags, &set, &joiner, &BarcodeIndex::default(), "s1", "GRCh38")?;
        assert_eq!(empty.nnz(), 0);
        assert_eq!(empty.shape(), (3, 0));

        let full = count_sample(&frags, &set, &joiner, &index(&["AAA"]), "s1", "GRCh38")?;
        let rows: Vec<_> = full.rows().collect();
        assert_eq!(rows, vec![("chr1_100_200", "AAA", 5)]);

        let err = count_sample(&dir.path().join("nope.tsv"), &set, &joiner, &index(&["AAA"]), "s1", "GRCh38")
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { .. }));
        Ok(())
    }
}
