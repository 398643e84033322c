//! BAM file I/O utilities.
//!
//! Readers and writers with consistent error handling, a lock-guarded writer that several
//! threads can share, and in-process BAI index construction.
//!
//! # Threading Model
//!
//! BAM files use BGZF compression, which can be parallelized for both reading and writing:
//!
//! - **Single-threaded**: Use `threads=1` (lower overhead, good for small files)
//! - **Multi-threaded**: Use `threads>1` (higher throughput for large files)

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use noodles::bam::bai;
use noodles::bgzf::io::{MultithreadedReader, MultithreadedWriter};
use noodles::csi::binning_index::Indexer;
use noodles::csi::binning_index::index::reference_sequence::bin::Chunk;
use noodles::csi::binning_index::index::reference_sequence::index::LinearIndex;
use noodles::sam::Header;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;
use parking_lot::Mutex;

use crate::errors::StitchError;

/// Enum wrapping single-threaded and multi-threaded BGZF readers.
pub enum BgzfReaderEnum {
    /// Single-threaded BGZF reader (lower overhead for small files)
    SingleThreaded(noodles::bgzf::io::Reader<File>),
    /// Multi-threaded BGZF reader
    MultiThreaded(MultithreadedReader<File>),
}

impl Read for BgzfReaderEnum {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BgzfReaderEnum::SingleThreaded(r) => r.read(buf),
            BgzfReaderEnum::MultiThreaded(r) => r.read(buf),
        }
    }
}

impl BufRead for BgzfReaderEnum {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            BgzfReaderEnum::SingleThreaded(r) => r.fill_buf(),
            BgzfReaderEnum::MultiThreaded(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            BgzfReaderEnum::SingleThreaded(r) => r.consume(amt),
            BgzfReaderEnum::MultiThreaded(r) => r.consume(amt),
        }
    }
}

/// A BAM reader over either BGZF reader flavor.
pub type BamReader = noodles::bam::io::Reader<BgzfReaderEnum>;

/// Enum wrapping single-threaded and multi-threaded BGZF writers.
pub enum BgzfWriterEnum {
    /// Single-threaded BGZF writer
    SingleThreaded(noodles::bgzf::io::Writer<File>),
    /// Multi-threaded BGZF writer
    MultiThreaded(MultithreadedWriter<File>),
}

impl Write for BgzfWriterEnum {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BgzfWriterEnum::SingleThreaded(w) => w.write(buf),
            BgzfWriterEnum::MultiThreaded(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BgzfWriterEnum::SingleThreaded(w) => w.flush(),
            BgzfWriterEnum::MultiThreaded(w) => w.flush(),
        }
    }
}

impl BgzfWriterEnum {
    /// Finish writing: flush all blocks and write the BGZF EOF marker.
    ///
    /// # Errors
    /// Returns an error if flushing or finalizing the writer fails.
    pub fn finish(self) -> io::Result<()> {
        match self {
            BgzfWriterEnum::SingleThreaded(mut w) => {
                w.flush()?;
                // EOF block is written on drop
                Ok(())
            }
            BgzfWriterEnum::MultiThreaded(mut w) => {
                w.finish()?;
                Ok(())
            }
        }
    }
}

/// A BAM writer over either BGZF writer flavor.
pub type BamWriter = noodles::bam::io::Writer<BgzfWriterEnum>;

/// Worker count for multi-threaded BGZF, or `None` when one thread is requested.
fn worker_count(threads: usize) -> Option<NonZero<usize>> {
    NonZero::new(threads).filter(|n| n.get() > 1)
}

/// Create a BAM reader and read its header.
///
/// # Errors
/// Returns an error if the file cannot be opened or the header cannot be read.
pub fn create_bam_reader<P: AsRef<Path>>(path: P, threads: usize) -> Result<(BamReader, Header)> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open input BAM: {}", path_ref.display()))?;

    let bgzf_reader = match worker_count(threads) {
        Some(workers) => {
            BgzfReaderEnum::MultiThreaded(MultithreadedReader::with_worker_count(workers, file))
        }
        None => BgzfReaderEnum::SingleThreaded(noodles::bgzf::io::Reader::new(file)),
    };

    let mut reader = noodles::bam::io::Reader::from(bgzf_reader);
    let header = reader
        .read_header()
        .with_context(|| format!("Failed to read header from: {}", path_ref.display()))?;

    Ok((reader, header))
}

/// Create a BAM writer and write the header in one operation.
///
/// # Errors
/// Returns an error if the file cannot be created or the header cannot be written.
///
/// # Example
/// ```no_run
/// use fgstitch_lib::bam_io::{create_bam_writer, finish_bam_writer};
/// use noodles::sam::Header;
/// use std::path::Path;
///
/// let header = Header::default();
/// let writer = create_bam_writer(Path::new("output.bam"), &header, 4).unwrap();
/// finish_bam_writer(writer, Path::new("output.bam")).unwrap();
/// ```
pub fn create_bam_writer<P: AsRef<Path>>(
    path: P,
    header: &Header,
    threads: usize,
) -> Result<BamWriter> {
    let path_ref = path.as_ref();
    let output_file = File::create(path_ref)
        .with_context(|| format!("Failed to create output BAM: {}", path_ref.display()))?;

    let bgzf_writer = match worker_count(threads) {
        Some(workers) => BgzfWriterEnum::MultiThreaded(MultithreadedWriter::with_worker_count(
            workers,
            output_file,
        )),
        None => BgzfWriterEnum::SingleThreaded(noodles::bgzf::io::Writer::new(output_file)),
    };

    let mut writer = noodles::bam::io::Writer::from(bgzf_writer);
    writer
        .write_header(header)
        .with_context(|| format!("Failed to write header to: {}", path_ref.display()))?;
    Ok(writer)
}

/// Flush and close a BAM writer, writing the BGZF EOF block.
///
/// # Errors
/// Returns an error if the final blocks cannot be written.
pub fn finish_bam_writer(writer: BamWriter, path: &Path) -> Result<()> {
    writer
        .into_inner()
        .finish()
        .with_context(|| format!("Failed to finish BAM: {}", path.display()))
}

/// Copy every record of a BAM file into an open writer, returning the number copied.
///
/// # Errors
/// Returns an error if the source cannot be read or a record cannot be written.
pub fn append_bam(
    source: &Path,
    writer: &mut BamWriter,
    header: &Header,
    threads: usize,
) -> Result<u64> {
    let (mut reader, source_header) = create_bam_reader(source, threads)?;
    let mut record = RecordBuf::default();
    let mut copied = 0u64;

    while reader
        .read_record_buf(&source_header, &mut record)
        .with_context(|| format!("Failed to read record from {}", source.display()))?
        != 0
    {
        writer
            .write_alignment_record(header, &record)
            .with_context(|| format!("Failed to append record from {}", source.display()))?;
        copied += 1;
    }

    Ok(copied)
}

/// A BAM writer guarded by a mutex so several threads can write to one file.
///
/// Each write holds the lock only for the duration of the physical write. The writer is
/// closed at most once; writes after closing fail with [`StitchError::SinkClosed`].
pub struct SharedBamWriter {
    path: PathBuf,
    header: Header,
    sink: &'static str,
    inner: Mutex<Option<BamWriter>>,
    written: AtomicU64,
}

impl SharedBamWriter {
    /// Create the file, write the header and wrap the writer.
    ///
    /// `sink` names the stream in error messages (e.g. "shared", "deferred").
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the header cannot be written.
    pub fn create(path: &Path, header: &Header, threads: usize, sink: &'static str) -> Result<Self> {
        let writer = create_bam_writer(path, header, threads)?;
        Ok(Self {
            path: path.to_path_buf(),
            header: header.clone(),
            sink,
            inner: Mutex::new(Some(writer)),
            written: AtomicU64::new(0),
        })
    }

    /// Write one record under the lock.
    ///
    /// # Errors
    /// Fails if the writer has been closed or the write itself fails.
    pub fn write(&self, record: &RecordBuf) -> Result<()> {
        let mut guard = self.inner.lock();
        let writer = guard.as_mut().ok_or(StitchError::SinkClosed { sink: self.sink })?;
        writer
            .write_alignment_record(&self.header, record)
            .with_context(|| format!("Failed to write record to {}", self.path.display()))?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finish the file. Returns `false` if it had already been closed.
    ///
    /// # Errors
    /// Returns an error if the final blocks cannot be written.
    pub fn close(&self) -> Result<bool> {
        let writer = self.inner.lock().take();
        match writer {
            Some(writer) => {
                finish_bam_writer(writer, &self.path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// True once [`SharedBamWriter::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Path of the BAI index for a BAM file (`<path>.bai`).
#[must_use]
pub fn bai_path(bam: &Path) -> PathBuf {
    let mut os: OsString = bam.as_os_str().to_owned();
    os.push(".bai");
    PathBuf::from(os)
}

/// Build a BAI index for a coordinate-sorted BAM by scanning it once.
///
/// Chunks are taken from the BGZF virtual positions before and after each record.
///
/// # Errors
/// Returns an error if the file cannot be read or records are not coordinate sorted.
pub fn build_bai_index(path: &Path) -> Result<bai::Index> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open BAM for indexing: {}", path.display()))?;
    let mut reader = noodles::bam::io::Reader::new(file);
    let header = reader
        .read_header()
        .with_context(|| format!("Failed to read header from: {}", path.display()))?;

    let mut indexer: Indexer<LinearIndex> = Indexer::default();
    let mut record = RecordBuf::default();
    let mut start = reader.get_ref().virtual_position();

    loop {
        let n = reader
            .read_record_buf(&header, &mut record)
            .with_context(|| format!("Failed to read record from {}", path.display()))?;
        if n == 0 {
            break;
        }
        let end = reader.get_ref().virtual_position();

        let context = match (
            record.reference_sequence_id(),
            record.alignment_start(),
            record.alignment_end(),
        ) {
            (Some(id), Some(alignment_start), Some(alignment_end)) => {
                Some((id, alignment_start, alignment_end, !record.flags().is_unmapped()))
            }
            _ => None,
        };

        indexer
            .add_record(context, Chunk::new(start, end))
            .map_err(io::Error::other)
            .with_context(|| format!("Failed to index {} (is it coordinate sorted?)", path.display()))?;

        start = end;
    }

    Ok(indexer.build(header.reference_sequences().len()))
}

/// Write a BAI index to a file.
///
/// # Errors
/// Returns an error if the file cannot be created or writing the index fails.
pub fn write_bai_index<P: AsRef<Path>>(path: P, index: &bai::Index) -> Result<()> {
    let path_ref = path.as_ref();
    let file = File::create(path_ref)
        .with_context(|| format!("Failed to create index file: {}", path_ref.display()))?;
    let mut writer = bai::io::Writer::new(file);
    writer
        .write_index(index)
        .with_context(|| format!("Failed to write index to: {}", path_ref.display()))?;
    Ok(())
}

/// Index a coordinate-sorted BAM in process, writing `<path>.bai`.
///
/// # Errors
/// Returns an error if indexing or writing the index fails.
pub fn index_bam(path: &Path) -> Result<PathBuf> {
    let index = build_bai_index(path)?;
    let index_path = bai_path(path);
    write_bai_index(&index_path, &index)?;
    Ok(index_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{RecordBuilder, header_with_contigs, read_bam, write_bam};
    use std::sync::Arc;

    #[test]
    fn test_worker_count() {
        assert!(worker_count(0).is_none());
        assert!(worker_count(1).is_none());
        assert_eq!(worker_count(4).map(NonZero::get), Some(4));
    }

    #[test]
    fn test_bai_path_appends_extension() {
        assert_eq!(bai_path(Path::new("/tmp/out.bam")), PathBuf::from("/tmp/out.bam.bai"));
    }

    #[test]
    fn test_multithreaded_writer_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mt.bam");
        let header = header_with_contigs(&[("chr1", 10_000)]);

        let mut writer = create_bam_writer(&path, &header, 3)?;
        for i in 1..=50 {
            let record = RecordBuilder::mapped_read()
                .name(&format!("r{i}"))
                .sequence("ACGTACGT")
                .alignment_start(i * 10)
                .build();
            writer.write_alignment_record(&header, &record)?;
        }
        finish_bam_writer(writer, &path)?;

        let (mut reader, read_header) = create_bam_reader(&path, 2)?;
        let count = reader.record_bufs(&read_header).count();
        assert_eq!(count, 50);
        Ok(())
    }

    #[test]
    fn test_shared_writer_from_threads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shared.bam");
        let header = header_with_contigs(&[("chr1", 10_000)]);
        let shared = Arc::new(SharedBamWriter::create(&path, &header, 1, "shared")?);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let shared = Arc::clone(&shared);
                scope.spawn(move || {
                    for i in 0..25 {
                        let record = RecordBuilder::mapped_read()
                            .name(&format!("t{t}-{i}"))
                            .sequence("ACGT")
                            .alignment_start(100 + i)
                            .build();
                        shared.write(&record).unwrap();
                    }
                });
            }
        });

        assert_eq!(shared.records_written(), 100);
        assert!(shared.close()?);
        assert!(!shared.close()?);
        assert!(shared.is_closed());

        let (_, records) = read_bam(&path)?;
        assert_eq!(records.len(), 100);
        Ok(())
    }

    #[test]
    fn test_shared_writer_rejects_after_close() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("closed.bam");
        let header = header_with_contigs(&[("chr1", 1000)]);
        let shared = SharedBamWriter::create(&path, &header, 1, "deferred")?;
        shared.close()?;

        let record = RecordBuilder::mapped_read().name("a").sequence("AC").alignment_start(1).build();
        let err = shared.write(&record).unwrap_err();
        assert!(err.to_string().contains("deferred sink"));
        Ok(())
    }

    #[test]
    fn test_append_bam() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let header = header_with_contigs(&[("chr1", 1000)]);
        let source = dir.path().join("source.bam");
        let target = dir.path().join("target.bam");
        let records: Vec<_> = (1..=3)
            .map(|i| {
                RecordBuilder::mapped_read()
                    .name(&format!("s{i}"))
                    .sequence("ACGT")
                    .alignment_start(i * 5)
                    .build()
            })
            .collect();
        write_bam(&source, &header, &records)?;

        let mut writer = create_bam_writer(&target, &header, 1)?;
        let copied = append_bam(&source, &mut writer, &header, 1)?;
        finish_bam_writer(writer, &target)?;

        assert_eq!(copied, 3);
        assert_eq!(read_bam(&target)?.1.len(), 3);
        Ok(())
    }

    #[test]
    fn test_index_bam_writes_bai() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sorted.bam");
        let header = header_with_contigs(&[("chr1", 100_000), ("chr2", 100_000)]);
        let records = vec![
            RecordBuilder::mapped_read().name("a").sequence("ACGTACGT").alignment_start(100).build(),
            RecordBuilder::mapped_read().name("b").sequence("ACGTACGT").alignment_start(5000).build(),
            RecordBuilder::mapped_read()
                .name("c")
                .sequence("ACGTACGT")
                .reference_sequence_id(1)
                .alignment_start(20)
                .build(),
            RecordBuilder::new().name("u").sequence("ACGT").unmapped(true).build(),
        ];
        write_bam(&path, &header, &records)?;

        let index = build_bai_index(&path)?;
        assert_eq!(index.reference_sequences().len(), 2);

        let index_path = index_bam(&path)?;
        assert!(index_path.exists());
        Ok(())
    }
}
