//! Record-level model used by the output engine.
//!
//! Records are plain noodles [`RecordBuf`]s. The engine never changes a record's identity;
//! it only applies the decided duplicate status, stamps an optional molecular identifier
//! and, for deferred records, may unmap them.

use bstr::BString;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::{Cigar, RecordBuf};
use noodles::sam::alignment::record_buf::data::field::Value as BufValue;

/// The MI (molecular identifier) tag carrying the duplicate-group / consensus id.
pub const MI_TAG: Tag = Tag::new(b'M', b'I');

/// The MC (mate CIGAR) tag.
pub const MC_TAG: Tag = Tag::new(b'M', b'C');

/// The SA (supplementary alignment) tag.
pub const SA_TAG: Tag = Tag::new(b'S', b'A');

/// Duplicate status decided upstream for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStatus {
    /// No decision; the record is written untouched.
    #[default]
    None,
    /// The representative of its duplicate group; any duplicate flag is cleared.
    Primary,
    /// A duplicate; flagged, or dropped when duplicate removal is enabled.
    Duplicate,
    /// The upstream collaborator could not decide; treated like `None`.
    Unset,
}

impl DuplicateStatus {
    /// Derive a status from the duplicate flag already present on a record.
    #[must_use]
    pub fn from_flags(flags: Flags) -> Self {
        if flags.is_duplicate() { Self::Duplicate } else { Self::None }
    }
}

/// Where a submitted record came from, for the counter pair each sink keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    /// An input alignment.
    Alignment,
    /// A consensus record synthesized for a duplicate group.
    Consensus,
}

/// The externally computed result for one duplicate group.
#[derive(Debug, Clone, Default)]
pub struct DuplicateGroup {
    /// Identifier stamped into the MI tag of every record in the group.
    pub group_id: Option<String>,
    /// Consensus record for the group, if one was built.
    pub consensus: Option<RecordBuf>,
    /// Member records with their decided primary/duplicate labels.
    pub members: Vec<(RecordBuf, DuplicateStatus)>,
}

impl DuplicateGroup {
    /// Total number of records the group will submit.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len() + usize::from(self.consensus.is_some())
    }

    /// True if the group holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies a decided status to the record's flags.
///
/// Returns `false` when the record must be dropped instead of emitted.
pub fn apply_status(record: &mut RecordBuf, status: DuplicateStatus, drop_duplicates: bool) -> bool {
    match status {
        DuplicateStatus::Duplicate => {
            if drop_duplicates {
                return false;
            }
            record.flags_mut().insert(Flags::DUPLICATE);
        }
        DuplicateStatus::Primary => record.flags_mut().remove(Flags::DUPLICATE),
        DuplicateStatus::None | DuplicateStatus::Unset => {}
    }
    true
}

/// Stamps the duplicate-group identifier into the MI tag.
pub fn set_group_id(record: &mut RecordBuf, group_id: &str) {
    record.data_mut().insert(MI_TAG, BufValue::String(BString::from(group_id)));
}

/// Returns the (contig index, 1-based start) used to place the record, if it has one.
///
/// An unmapped read placed at its mapped mate carries the mate's coordinates and so
/// still has an informative position.
#[must_use]
pub fn informative_position(record: &RecordBuf) -> Option<(usize, usize)> {
    let contig = record.reference_sequence_id()?;
    let start = record.alignment_start()?;
    Some((contig, usize::from(start)))
}

/// True if neither the record nor its mate gives it a genomic position.
#[must_use]
pub fn is_fully_unmapped(record: &RecordBuf) -> bool {
    informative_position(record).is_none()
}

/// Returns the mate's (contig index, 1-based start) when the record is paired with a mapped mate.
#[must_use]
pub fn mate_position(record: &RecordBuf) -> Option<(usize, usize)> {
    if record.flags().is_segmented() && !record.flags().is_mate_unmapped() {
        let contig = record.mate_reference_sequence_id()?;
        let start = record.mate_alignment_start()?;
        return Some((contig, usize::from(start)));
    }
    None
}

/// Converts a record into a fully unmapped read whose mate is also unmapped.
///
/// Clears placement, CIGAR, mapping quality and template length and removes tags that
/// only make sense for mapped reads.
pub fn unmap_record(record: &mut RecordBuf) {
    let flags = record.flags_mut();
    flags.insert(Flags::UNMAPPED | Flags::MATE_UNMAPPED);
    flags.remove(
        Flags::PROPERLY_SEGMENTED
            | Flags::REVERSE_COMPLEMENTED
            | Flags::MATE_REVERSE_COMPLEMENTED
            | Flags::DUPLICATE,
    );

    *record.reference_sequence_id_mut() = None;
    *record.alignment_start_mut() = None;
    *record.mate_reference_sequence_id_mut() = None;
    *record.mate_alignment_start_mut() = None;
    *record.mapping_quality_mut() = None;
    *record.template_length_mut() = 0;
    *record.cigar_mut() = Cigar::default();

    record.data_mut().remove(&MC_TAG);
    record.data_mut().remove(&SA_TAG);
}

/// Marks the mate of a still-mapped record as unmapped and clears the mate placement.
pub fn unmap_mate(record: &mut RecordBuf) {
    let flags = record.flags_mut();
    flags.insert(Flags::MATE_UNMAPPED);
    flags.remove(Flags::PROPERLY_SEGMENTED | Flags::MATE_REVERSE_COMPLEMENTED);

    *record.mate_reference_sequence_id_mut() = None;
    *record.mate_alignment_start_mut() = None;
    *record.template_length_mut() = 0;
    record.data_mut().remove(&MC_TAG);
}
