//! Partition planning.
//!
//! Partitions are contiguous runs of genomic regions, numbered in increasing
//! (contig, position) order so that emitting partitions by index yields genomic order.
//! Only primary contigs are partitioned; records elsewhere go to the deferred stream.

use ahash::AHashSet;
use noodles::sam::Header;

use crate::errors::{Result, StitchError};
use crate::validation::validate_positive;

/// A 1-based, inclusive interval on one contig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Reference sequence index.
    pub contig: usize,
    /// First position (1-based).
    pub start: usize,
    /// Last position (1-based, inclusive).
    pub end: usize,
}

impl Region {
    #[must_use]
    pub fn contains(&self, contig: usize, pos: usize) -> bool {
        self.contig == contig && self.start <= pos && pos <= self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// One unit of work: an index defining its emission order and the regions it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub regions: Vec<Region>,
}

impl Partition {
    /// Total number of bases covered.
    #[must_use]
    pub fn span(&self) -> usize {
        self.regions.iter().map(Region::len).sum()
    }
}

/// The set of contigs that are partitioned by position.
#[derive(Debug, Clone)]
pub struct PrimaryContigs {
    ids: AHashSet<usize>,
}

impl PrimaryContigs {
    /// Picks primary contigs from the header.
    ///
    /// With an explicit list, every name must exist in the header. Otherwise the human
    /// primary assembly (`1`-`22`, `X`, `Y`, `M`, `MT`, with or without a `chr` prefix) is
    /// used, falling back to every contig when none of those names are present.
    ///
    /// # Errors
    /// Returns an error if an explicitly named contig is missing from the header.
    pub fn from_header(header: &Header, names: Option<&[String]>) -> Result<Self> {
        let references = header.reference_sequences();

        let ids: AHashSet<usize> = match names {
            Some(names) => names
                .iter()
                .map(|name| {
                    references.get_index_of(name.as_bytes()).ok_or_else(|| {
                        StitchError::ReferenceNotFound { ref_name: name.clone() }
                    })
                })
                .collect::<Result<_>>()?,
            None => {
                let human: AHashSet<usize> = references
                    .keys()
                    .enumerate()
                    .filter(|(_, name)| is_human_primary(name.as_slice()))
                    .map(|(i, _)| i)
                    .collect();
                if human.is_empty() { (0..references.len()).collect() } else { human }
            }
        };

        Ok(Self { ids })
    }

    /// Treats every contig in the header as primary.
    #[must_use]
    pub fn all(header: &Header) -> Self {
        Self { ids: (0..header.reference_sequences().len()).collect() }
    }

    #[must_use]
    pub fn is_primary(&self, contig: usize) -> bool {
        self.ids.contains(&contig)
    }

    /// Primary contig indices in ascending order.
    #[must_use]
    pub fn sorted_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn is_human_primary(name: &[u8]) -> bool {
    let name = name.strip_prefix(b"chr").unwrap_or(name);
    match name {
        b"X" | b"Y" | b"M" | b"MT" => true,
        _ => std::str::from_utf8(name)
            .ok()
            .filter(|s| !s.starts_with('0'))
            .and_then(|s| s.parse::<u8>().ok())
            .is_some_and(|n| (1..=22).contains(&n)),
    }
}

/// Partitions of the primary contigs plus a sorted lookup table.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    partitions: Vec<Partition>,
    /// Every region with its partition index, ordered by (contig, start).
    lookup: Vec<(Region, usize)>,
}

impl PartitionPlan {
    /// Splits the primary contigs into at most `count` partitions of near-equal length.
    ///
    /// # Errors
    /// Returns an error if `count` is zero or there is nothing to partition.
    pub fn plan(header: &Header, primary: &PrimaryContigs, count: usize) -> Result<Self> {
        validate_positive(count, "partitions")?;

        let references = header.reference_sequences();
        let contigs: Vec<(usize, usize)> = primary
            .sorted_ids()
            .into_iter()
            .filter_map(|id| references.get_index(id).map(|(_, rs)| (id, rs.length().get())))
            .collect();
        let total: usize = contigs.iter().map(|(_, len)| len).sum();
        if total == 0 {
            return Err(StitchError::InvalidParameter {
                parameter: "contigs".to_string(),
                reason: "no primary contigs to partition".to_string(),
            });
        }

        let target = total.div_ceil(count.min(total));
        let mut partitions = Vec::with_capacity(count);
        let mut current = Vec::new();
        let mut filled = 0;

        for (contig, len) in contigs {
            let mut start = 1;
            while start <= len {
                let take = (target - filled).min(len - start + 1);
                let end = start + take - 1;
                current.push(Region { contig, start, end });
                filled += take;
                start = end + 1;
                if filled == target {
                    partitions.push(Partition {
                        index: partitions.len(),
                        regions: std::mem::take(&mut current),
                    });
                    filled = 0;
                }
            }
        }
        if !current.is_empty() {
            partitions.push(Partition { index: partitions.len(), regions: current });
        }

        Ok(Self::from_partitions(partitions))
    }

    /// Wraps externally planned partitions. Indices must be `0..n` in genomic order.
    #[must_use]
    pub fn from_partitions(partitions: Vec<Partition>) -> Self {
        let mut lookup: Vec<(Region, usize)> = partitions
            .iter()
            .flat_map(|p| p.regions.iter().map(move |r| (*r, p.index)))
            .collect();
        lookup.sort_by_key(|(r, _)| (r.contig, r.start));
        Self { partitions, lookup }
    }

    /// Index of the partition owning `(contig, pos)`, if any.
    #[must_use]
    pub fn partition_for(&self, contig: usize, pos: usize) -> Option<usize> {
        let idx = self.lookup.partition_point(|(r, _)| (r.contig, r.start) <= (contig, pos));
        let (region, partition) = self.lookup.get(idx.checked_sub(1)?)?;
        region.contains(contig, pos).then_some(*partition)
    }

    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
