//! Header utilities: the `@HD SO` sort-order field and `@PG` program records.

use anyhow::{Context, Result};
use bstr::BString;
use noodles::sam::Header;
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::header::record::value::map::program::tag;
use noodles::sam::header::record::value::map::{self, Program};
use std::collections::HashSet;

/// Program name written into `@PG` records.
pub const PROGRAM_NAME: &str = "fgstitch";

/// Sort order advertised in the `@HD` line of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Records are coordinate sorted.
    Coordinate,
    /// No ordering guarantee.
    Unsorted,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            SortOrder::Coordinate => "coordinate",
            SortOrder::Unsorted => "unsorted",
        }
    }
}

/// Returns a copy of `header` whose `@HD` line declares `order`.
///
/// Every other header record (references, read groups, programs, comments) is kept.
///
/// # Errors
/// Returns an error if the `@HD` record cannot be built.
pub fn with_sort_order(header: &Header, order: SortOrder) -> Result<Header> {
    let mut builder = Header::builder();

    for (name, seq) in header.reference_sequences() {
        builder = builder.add_reference_sequence(name.as_slice(), seq.clone());
    }
    for (id, rg) in header.read_groups() {
        builder = builder.add_read_group(id.as_slice(), rg.clone());
    }
    for (id, pg) in header.programs().as_ref() {
        builder = builder.add_program(id.as_slice(), pg.clone());
    }
    for comment in header.comments() {
        builder = builder.add_comment(comment.clone());
    }

    let hd = Map::<map::Header>::builder()
        .insert(header_tag::SORT_ORDER, BString::from(order.as_str()))
        .build()
        .context("Failed to build @HD record")?;

    Ok(builder.set_header(hd).build())
}

/// Get the ID of the last program in the @PG chain (for PP chaining).
///
/// The last program is the one no other program references through its PP tag.
#[must_use]
pub fn get_last_program_id(header: &Header) -> Option<String> {
    let programs = header.programs();
    let program_map = programs.as_ref();

    if program_map.is_empty() {
        return None;
    }

    let mut referenced: HashSet<&[u8]> = HashSet::new();
    for (_id, pg) in program_map {
        if let Some(pp) = pg.other_fields().get(&tag::PREVIOUS_PROGRAM_ID) {
            referenced.insert(pp.as_ref());
        }
    }

    for (id, _pg) in program_map {
        if !referenced.contains(id.as_slice()) {
            return Some(String::from_utf8_lossy(id).to_string());
        }
    }

    program_map.keys().next().map(|id| String::from_utf8_lossy(id).to_string())
}

/// Create a unique program ID by appending .1, .2, etc. if needed.
#[must_use]
pub fn make_unique_program_id(header: &Header, base_id: &str) -> String {
    let programs = header.programs();
    let program_map = programs.as_ref();

    if !program_map.contains_key(base_id.as_bytes()) {
        return base_id.to_string();
    }

    (1..)
        .map(|i| format!("{base_id}.{i}"))
        .find(|candidate| !program_map.contains_key(candidate.as_bytes()))
        .unwrap_or_else(|| base_id.to_string())
}

/// Add a `@PG` record for this program, chained to the previous last program.
///
/// # Errors
/// Returns an error if the program record cannot be built or added.
pub fn add_pg_record(mut header: Header, version: &str, command_line: &str) -> Result<Header> {
    let previous_program = get_last_program_id(&header);
    let unique_id = make_unique_program_id(&header, PROGRAM_NAME);

    let mut builder = Map::<Program>::builder()
        .insert(tag::NAME, PROGRAM_NAME)
        .insert(tag::VERSION, version)
        .insert(tag::COMMAND_LINE, command_line);
    if let Some(pp) = previous_program.as_deref() {
        builder = builder.insert(tag::PREVIOUS_PROGRAM_ID, pp);
    }
    let pg_record = builder.build().context("Failed to build @PG record")?;

    header
        .programs_mut()
        .add(BString::from(unique_id), pg_record)
        .context("Failed to add @PG record")?;

    Ok(header)
}
