//! Ordering keys for coordinate-sorted output.
//!
//! - [`CoordinateKey`]: standard genomic coordinate order (contig, position, strand, name),
//!   used when merging or sorting whole files.
//! - [`OrderedKey`]: a [`CoordinateKey`] plus an insertion sequence number, used by the
//!   position window so records with identical coordinates keep their arrival order and a
//!   position-only sentinel can bound range queries.

use std::cmp::Ordering;

use noodles::sam::alignment::record_buf::RecordBuf;

/// Sort key for coordinate ordering.
///
/// Sort order: reference id, then position, then reverse strand flag, then read name.
/// Records without a reference sort after every placed record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CoordinateKey {
    /// Reference sequence index, or `usize::MAX` when the record has no reference.
    pub tid: usize,
    /// 1-based alignment start, or `usize::MAX` when absent.
    pub pos: usize,
    /// True if reverse strand.
    pub reverse: bool,
    /// Read name for tie-breaking (lexicographic).
    pub name: Vec<u8>,
}

impl CoordinateKey {
    /// Create a coordinate key for a record with no placement.
    #[must_use]
    pub fn unmapped(name: Vec<u8>) -> Self {
        Self { tid: usize::MAX, pos: usize::MAX, reverse: false, name }
    }

    /// Extract the key from a record.
    ///
    /// Placement follows the reference id even when the unmapped flag is set, so unmapped
    /// reads stay next to their mapped mates (samtools behavior).
    #[must_use]
    pub fn from_record(record: &RecordBuf) -> Self {
        let name = record.name().map_or_else(Vec::new, |n| n.to_vec());

        match (record.reference_sequence_id(), record.alignment_start()) {
            (Some(tid), Some(pos)) => Self {
                tid,
                pos: usize::from(pos),
                reverse: record.flags().is_reverse_complemented(),
                name,
            },
            (Some(tid), None) => Self { tid, pos: usize::MAX, reverse: false, name },
            _ => Self::unmapped(name),
        }
    }

    /// True if this key sorts among the placed records.
    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.tid != usize::MAX && self.pos != usize::MAX
    }
}

impl Ord for CoordinateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tid
            .cmp(&other.tid)
            .then_with(|| self.pos.cmp(&other.pos))
            .then_with(|| self.reverse.cmp(&other.reverse))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for CoordinateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order over buffered records: coordinate key, then insertion sequence.
///
/// Real records are assigned sequence numbers starting at 1. A sentinel built with
/// [`OrderedKey::sentinel`] has sequence 0, an empty name and forward strand, so it sorts
/// before every real record at the same position.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OrderedKey {
    coordinate: CoordinateKey,
    seq: u64,
}

impl OrderedKey {
    /// Wrap a record's coordinate key with its insertion sequence number.
    #[must_use]
    pub fn new(coordinate: CoordinateKey, seq: u64) -> Self {
        debug_assert!(seq > 0, "sequence 0 is reserved for sentinels");
        Self { coordinate, seq }
    }

    /// A position-only key sorting before every record at `(tid, pos)`.
    #[must_use]
    pub fn sentinel(tid: usize, pos: usize) -> Self {
        Self { coordinate: CoordinateKey { tid, pos, reverse: false, name: Vec::new() }, seq: 0 }
    }

    /// The 1-based position this key orders on.
    #[must_use]
    pub fn position(&self) -> usize {
        self.coordinate.pos
    }

    /// The insertion sequence number (0 for sentinels).
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.coordinate.cmp(&other.coordinate).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
