use fxhash::FxHashMap;
use rust_lapper::{Interval, Lapper};

use crate::utils::fragments::Fragment;
use crate::utils::regions::ConsensusRegionSet;

/// Interval-overlap capability used by the counter.
///
/// Regions are addressed by their index in the consensus set, so index order is coordinate order.
pub trait IntervalJoiner: Send + Sync {
    /// Appends the index of every region that `fragment` intersects to `hits`.
    fn overlaps(&self, fragment: &Fragment, hits: &mut Vec<u32>);
}

/// In-process joiner: one lapper per chromosome over half-open BED coordinates.
pub struct LapperJoiner {
    by_chrom: FxHashMap<String, Lapper<u64, u32>>,
}

impl LapperJoiner {
    pub fn new(regions: &ConsensusRegionSet) -> Self {
        let mut grouped: FxHashMap<String, Vec<Interval<u64, u32>>> = FxHashMap::default();
        for (idx, region) in regions.regions().iter().enumerate() {
            grouped.entry(region.chrom.clone()).or_default().push(Interval {
                start: region.start,
                stop: region.end,
                val: idx as u32,
            });
        }
        let by_chrom = grouped
            .into_iter()
            .map(|(chrom, ivs)| (chrom, Lapper::new(ivs)))
            .collect();
        Self { by_chrom }
    }
}

impl IntervalJoiner for LapperJoiner {
    fn overlaps(&self, fragment: &Fragment, hits: &mut Vec<u32>) {
        if let Some(lapper) = self.by_chrom.get(&fragment.chrom) {
            hits.extend(lapper.find(fragment.start, fragment.end).map(|iv| iv.val));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::regions::Region;

    fn frag(chrom: &str, start: u64, end: u64) -> Fragment {
        Fragment { chrom: chrom.to_string(), start, end, barcode: "A".to_string(), count: 1 }
    }

    fn hits(joiner: &LapperJoiner, f: &Fragment) -> Vec<u32> {
        let mut out = Vec::new();
        joiner.overlaps(f, &mut out);
        out.sort_unstable();
        out
    }

    #[test]
    fn test_half_open_overlap() {
        let set = ConsensusRegionSet::from_regions(vec![
            Region::new("chr1", 100, 200),
            Region::new("chr1", 150, 300),
            Region::new("chr2", 100, 200),
        ]);
        let joiner = LapperJoiner::new(&set);

        assert_eq!(hits(&joiner, &frag("chr1", 50, 100)), Vec::<u32>::new(), "book-ended is not an overlap");
        assert_eq!(hits(&joiner, &frag("chr1", 50, 101)), vec![0]);
        assert_eq!(hits(&joiner, &frag("chr1", 160, 170)), vec![0, 1]);
        assert_eq!(hits(&joiner, &frag("chr1", 299, 400)), vec![1]);
        assert_eq!(hits(&joiner, &frag("chr2", 199, 250)), vec![2]);
        assert!(hits(&joiner, &frag("chrX", 0, 1_000)).is_empty());
    }
}
