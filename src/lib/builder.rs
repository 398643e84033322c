//! Builders for constructing records, headers and small BAM files in tests.
//!
//! [`RecordBuilder`] creates standalone [`RecordBuf`]s with a fluent API; [`header_with_contigs`]
//! builds a SAM header with the given reference sequences; [`write_bam`] and [`read_bam`]
//! round-trip records through a BAM file on disk.
//!
//! ```rust
//! use fgstitch_lib::builder::RecordBuilder;
//!
//! let record = RecordBuilder::mapped_read()
//!     .name("read1")
//!     .sequence("ACGTACGT")
//!     .alignment_start(100)
//!     .build();
//!
//! assert_eq!(record.reference_sequence_id(), Some(0));
//! ```

use std::num::NonZeroUsize;
use std::path::Path;

use anyhow::{Context, Result};
use bstr::BString;
use noodles::core::Position;
use noodles::sam::Header;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::MappingQuality;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value as BufValue;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::ReferenceSequence;

use crate::bam_io::{create_bam_reader, create_bam_writer, finish_bam_writer};

/// Default base quality for generated qualities.
const DEFAULT_BASE_QUALITY: u8 = 30;

/// Builder for a single record.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    name: Option<Vec<u8>>,
    flags: Flags,
    reference_sequence_id: Option<usize>,
    alignment_start: Option<usize>,
    mapping_quality: Option<u8>,
    cigar: Option<String>,
    sequence: Vec<u8>,
    tags: Vec<(Tag, BufValue)>,
    mate_reference_sequence_id: Option<usize>,
    mate_alignment_start: Option<usize>,
    template_length: i32,
}

impl RecordBuilder {
    /// Creates a builder with no placement and empty flags.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            flags: Flags::empty(),
            reference_sequence_id: None,
            alignment_start: None,
            mapping_quality: None,
            cigar: None,
            sequence: Vec::new(),
            tags: Vec::new(),
            mate_reference_sequence_id: None,
            mate_alignment_start: None,
            template_length: 0,
        }
    }

    /// Creates a builder for a read mapped to reference sequence 0 with MAPQ 60.
    #[must_use]
    pub fn mapped_read() -> Self {
        Self { reference_sequence_id: Some(0), mapping_quality: Some(60), ..Self::new() }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.as_bytes().to_vec());
        self
    }

    /// Sets the sequence; a matching `{len}M` CIGAR is generated for placed reads.
    #[must_use]
    pub fn sequence(mut self, seq: &str) -> Self {
        self.sequence = seq.as_bytes().to_vec();
        self
    }

    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        self.cigar = Some(cigar.to_string());
        self
    }

    #[must_use]
    pub fn reference_sequence_id(mut self, id: usize) -> Self {
        self.reference_sequence_id = Some(id);
        self
    }

    /// Sets the alignment start position (1-based).
    #[must_use]
    pub fn alignment_start(mut self, pos: usize) -> Self {
        self.alignment_start = Some(pos);
        self
    }

    #[must_use]
    pub fn mapping_quality(mut self, mapq: u8) -> Self {
        self.mapping_quality = Some(mapq);
        self
    }

    #[must_use]
    pub fn mate_reference_sequence_id(mut self, id: usize) -> Self {
        self.mate_reference_sequence_id = Some(id);
        self
    }

    /// Sets the mate alignment start position (1-based).
    #[must_use]
    pub fn mate_alignment_start(mut self, pos: usize) -> Self {
        self.mate_alignment_start = Some(pos);
        self
    }

    #[must_use]
    pub fn template_length(mut self, tlen: i32) -> Self {
        self.template_length = tlen;
        self
    }

    #[must_use]
    pub fn paired(mut self, paired: bool) -> Self {
        self.flags.set(Flags::SEGMENTED, paired);
        self
    }

    /// Sets the properly paired flag. Implies paired.
    #[must_use]
    pub fn properly_paired(mut self, properly_paired: bool) -> Self {
        if properly_paired {
            self.flags.set(Flags::SEGMENTED, true);
        }
        self.flags.set(Flags::PROPERLY_SEGMENTED, properly_paired);
        self
    }

    #[must_use]
    pub fn unmapped(mut self, unmapped: bool) -> Self {
        self.flags.set(Flags::UNMAPPED, unmapped);
        self
    }

    #[must_use]
    pub fn mate_unmapped(mut self, unmapped: bool) -> Self {
        self.flags.set(Flags::MATE_UNMAPPED, unmapped);
        self
    }

    #[must_use]
    pub fn reverse_complement(mut self, reverse: bool) -> Self {
        self.flags.set(Flags::REVERSE_COMPLEMENTED, reverse);
        self
    }

    #[must_use]
    pub fn supplementary(mut self, supplementary: bool) -> Self {
        self.flags.set(Flags::SUPPLEMENTARY, supplementary);
        self
    }

    #[must_use]
    pub fn duplicate(mut self, duplicate: bool) -> Self {
        self.flags.set(Flags::DUPLICATE, duplicate);
        self
    }

    /// Adds a SAM tag; tags that are not exactly two characters are ignored.
    #[must_use]
    pub fn tag<V: Into<BufValue>>(mut self, tag: &str, value: V) -> Self {
        if let [a, b] = tag.as_bytes() {
            self.tags.push((Tag::from([*a, *b]), value.into()));
        }
        self
    }

    /// Builds the `RecordBuf`.
    ///
    /// # Panics
    ///
    /// Panics if a position is zero or the CIGAR string is malformed.
    #[must_use]
    pub fn build(self) -> RecordBuf {
        let mut record = RecordBuf::default();

        if let Some(name) = self.name {
            *record.name_mut() = Some(BString::from(name));
        }
        *record.flags_mut() = self.flags;

        *record.reference_sequence_id_mut() = self.reference_sequence_id;
        *record.alignment_start_mut() = self
            .alignment_start
            .map(|pos| Position::try_from(pos).expect("alignment_start must be >= 1"));
        *record.mate_reference_sequence_id_mut() = self.mate_reference_sequence_id;
        *record.mate_alignment_start_mut() = self
            .mate_alignment_start
            .map(|pos| Position::try_from(pos).expect("mate_alignment_start must be >= 1"));
        *record.template_length_mut() = self.template_length;
        *record.mapping_quality_mut() =
            self.mapping_quality.and_then(|mapq| MappingQuality::try_from(mapq).ok());

        let placed = self.alignment_start.is_some() && !self.flags.is_unmapped();
        let cigar = match self.cigar {
            Some(cigar) => cigar,
            None if placed && !self.sequence.is_empty() => format!("{}M", self.sequence.len()),
            None => String::new(),
        };
        if !cigar.is_empty() {
            *record.cigar_mut() = parse_cigar(&cigar).into_iter().collect();
        }

        let qualities = vec![DEFAULT_BASE_QUALITY; self.sequence.len()];
        *record.sequence_mut() = Sequence::from(self.sequence);
        *record.quality_scores_mut() = QualityScores::from(qualities);

        for (tag, value) in self.tags {
            record.data_mut().insert(tag, value);
        }

        record
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a CIGAR string such as `10M2I5S` into operations.
///
/// # Panics
///
/// Panics on an unknown operation or a missing length.
#[must_use]
pub fn parse_cigar(cigar: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut len = 0usize;
    for c in cigar.chars() {
        if let Some(d) = c.to_digit(10) {
            len = len * 10 + d as usize;
            continue;
        }
        let kind = match c {
            'M' => Kind::Match,
            'I' => Kind::Insertion,
            'D' => Kind::Deletion,
            'N' => Kind::Skip,
            'S' => Kind::SoftClip,
            'H' => Kind::HardClip,
            'P' => Kind::Pad,
            '=' => Kind::SequenceMatch,
            'X' => Kind::SequenceMismatch,
            other => panic!("unknown CIGAR operation '{other}' in {cigar}"),
        };
        assert!(len > 0, "CIGAR operation '{c}' has no length in {cigar}");
        ops.push(Op::new(kind, len));
        len = 0;
    }
    ops
}

/// Builds a header with the given `(name, length)` reference sequences.
///
/// # Panics
///
/// Panics if a length is zero.
#[must_use]
pub fn header_with_contigs(contigs: &[(&str, usize)]) -> Header {
    let mut builder = Header::builder();
    for (name, len) in contigs {
        let length = NonZeroUsize::new(*len).expect("reference length must be non-zero");
        builder = builder
            .add_reference_sequence(BString::from(*name), Map::<ReferenceSequence>::new(length));
    }
    builder.build()
}

/// Writes records, in the given order, to a BAM file.
pub fn write_bam(path: &Path, header: &Header, records: &[RecordBuf]) -> Result<()> {
    use noodles::sam::alignment::io::Write as AlignmentWrite;

    let mut writer = create_bam_writer(path, header, 1)?;
    for record in records {
        writer
            .write_alignment_record(header, record)
            .with_context(|| format!("Failed to write record to {}", path.display()))?;
    }
    finish_bam_writer(writer, path)
}

/// Reads every record of a BAM file.
pub fn read_bam(path: &Path) -> Result<(Header, Vec<RecordBuf>)> {
    let (mut reader, header) = create_bam_reader(path, 1)?;
    let records = reader
        .record_bufs(&header)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read records from {}", path.display()))?;
    Ok((header, records))
}
