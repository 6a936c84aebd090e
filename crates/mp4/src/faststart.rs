//! Fast-start rewriting.
//!
//! Moves the `moov` atom ahead of the media data so playback can begin before
//! the whole file has been fetched. Every chunk offset in `stco`/`co64` tables
//! is translated to the new position of the atom it points into; a 32-bit
//! table whose offsets no longer fit is widened to `co64`. Media atoms are
//! streamed; only `moov` is held in memory.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use reframe_common::error::{ReframeError, ReframeResult};
use serde::Serialize;

use crate::atoms::{CO64, FTYP, MDAT, MOOV, STCO};
use crate::tree::{scan_atoms, AtomSpan, BoxBody, BoxNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FastStartOutcome {
    /// The movie header was moved ahead of the media data.
    Rewritten,
    /// The input was already streamable and was copied unchanged.
    AlreadyFastStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FastStartReport {
    pub outcome: FastStartOutcome,
    pub input_len: u64,
    pub output_len: u64,
    /// Size of the movie header as written.
    pub moov_size: u64,
    /// How far the first media data atom moved.
    pub media_shift: i64,
    pub offsets_patched: usize,
    /// Tables widened from 32-bit to 64-bit offsets.
    pub tables_upgraded: usize,
}

/// Rewrite `input` into `output`.
pub fn fast_start_file(input: &Path, output: &Path) -> ReframeResult<FastStartReport> {
    if !input.exists() {
        return Err(ReframeError::FileNotFound {
            path: input.to_path_buf(),
        });
    }
    if output.exists() && input.canonicalize()? == output.canonicalize()? {
        return Err(ReframeError::config(format!(
            "fast-start output must differ from input: {}",
            input.display()
        )));
    }

    let file = File::open(input)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut writer = BufWriter::new(File::create(output)?);

    let result = fast_start(&mut reader, len, &mut writer).and_then(|report| {
        writer.flush()?;
        Ok(report)
    });

    match result {
        Ok(report) => {
            tracing::info!(
                input = %input.display(),
                output = %output.display(),
                outcome = ?report.outcome,
                moov_size = report.moov_size,
                offsets = report.offsets_patched,
                "Fast-start rewrite complete"
            );
            Ok(report)
        }
        Err(e) => {
            drop(writer);
            if let Err(cleanup) = std::fs::remove_file(output) {
                tracing::warn!(error = %cleanup, "Failed to remove partial fast-start output");
            }
            Err(e)
        }
    }
}

/// In-memory variant of [`fast_start`].
pub fn fast_start_bytes(input: &[u8]) -> ReframeResult<(Vec<u8>, FastStartReport)> {
    let mut out = Vec::with_capacity(input.len());
    let report = fast_start(&mut Cursor::new(input), input.len() as u64, &mut out)?;
    Ok((out, report))
}

/// Rewrite the `len`-byte MP4 stream in `reader` into `writer`.
pub fn fast_start<R: Read + Seek, W: Write>(
    reader: &mut R,
    len: u64,
    writer: &mut W,
) -> ReframeResult<FastStartReport> {
    let atoms = scan_atoms(reader, len)?;

    let moov_span = atoms
        .iter()
        .find(|a| a.kind == MOOV)
        .copied()
        .ok_or_else(|| ReframeError::container("file has no moov atom"))?;
    let first_mdat = atoms.iter().find(|a| a.kind == MDAT);

    let needs_rewrite = matches!(first_mdat, Some(mdat) if mdat.offset < moov_span.offset);
    if !needs_rewrite {
        tracing::debug!("moov already precedes media data; copying unchanged");
        reader.seek(SeekFrom::Start(0))?;
        let copied = io::copy(&mut (&mut *reader).take(len), writer)?;
        check_copied(copied, len)?;
        return Ok(FastStartReport {
            outcome: FastStartOutcome::AlreadyFastStart,
            input_len: len,
            output_len: len,
            moov_size: moov_span.size,
            media_shift: 0,
            offsets_patched: 0,
            tables_upgraded: 0,
        });
    }

    let moov_bytes = read_span(reader, &moov_span)?;
    let moov = BoxNode::parse(&moov_bytes)?;
    let plan = plan_rewrite(&atoms, &moov)?;
    let moov_out = plan.moov.to_bytes()?;

    let mut output_len = 0u64;
    if let Some(ftyp) = &plan.ftyp {
        output_len += copy_span(reader, ftyp, writer)?;
    }
    writer.write_all(&moov_out)?;
    output_len += moov_out.len() as u64;
    for span in &plan.rest {
        output_len += copy_span(reader, span, writer)?;
    }

    Ok(FastStartReport {
        outcome: FastStartOutcome::Rewritten,
        input_len: len,
        output_len,
        moov_size: moov_out.len() as u64,
        media_shift: plan.media_shift,
        offsets_patched: plan.offsets_patched,
        tables_upgraded: plan.tables_upgraded,
    })
}

/// Output layout and patched movie header.
#[derive(Debug)]
pub(crate) struct RewritePlan {
    pub ftyp: Option<AtomSpan>,
    pub moov: BoxNode,
    /// Remaining atoms in output order.
    pub rest: Vec<AtomSpan>,
    pub media_shift: i64,
    pub offsets_patched: usize,
    pub tables_upgraded: usize,
}

struct ChunkTable {
    version_flags: u32,
    wide: bool,
    offsets: Vec<u64>,
}

impl ChunkTable {
    fn parse(node: &BoxNode) -> ReframeResult<Self> {
        let payload = node
            .payload()
            .ok_or_else(|| ReframeError::container(format!("{} is not a leaf box", node.kind)))?;
        let wide = node.kind == CO64;
        let entry_len = if wide { 8 } else { 4 };
        if payload.len() < 8 {
            return Err(ReframeError::container(format!(
                "{} table truncated: {} bytes",
                node.kind,
                payload.len()
            )));
        }

        let mut cursor = Cursor::new(payload);
        let version_flags = cursor.read_u32::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        if (payload.len() - 8) / entry_len < count {
            return Err(ReframeError::container(format!(
                "{} declares {count} entries but holds {} bytes",
                node.kind,
                payload.len()
            )));
        }

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(if wide {
                cursor.read_u64::<BigEndian>()?
            } else {
                cursor.read_u32::<BigEndian>()? as u64
            });
        }

        Ok(Self {
            version_flags,
            wide,
            offsets,
        })
    }

    fn encode(&self, offsets: &[u64], wide: bool) -> ReframeResult<Vec<u8>> {
        let entry_len = if wide { 8 } else { 4 };
        let mut out = Vec::with_capacity(8 + offsets.len() * entry_len);
        out.write_u32::<BigEndian>(self.version_flags)?;
        out.write_u32::<BigEndian>(offsets.len() as u32)?;
        for &offset in offsets {
            if wide {
                out.write_u64::<BigEndian>(offset)?;
            } else {
                out.write_u32::<BigEndian>(offset as u32)?;
            }
        }
        Ok(out)
    }
}

struct Relocation {
    moves: Vec<(AtomSpan, u64)>,
}

impl Relocation {
    fn layout(ftyp: Option<&AtomSpan>, rest: &[AtomSpan], moov_len: u64) -> Self {
        let mut moves = Vec::with_capacity(rest.len() + 1);
        let mut position = 0u64;
        if let Some(ftyp) = ftyp {
            moves.push((*ftyp, 0));
            position = ftyp.size;
        }
        position += moov_len;
        for span in rest {
            moves.push((*span, position));
            position += span.size;
        }
        Self { moves }
    }

    /// An offset equal to the end of a media atom marks an empty trailing
    /// chunk and moves with that atom.
    fn translate(&self, offset: u64) -> ReframeResult<u64> {
        self.moves
            .iter()
            .find(|(span, _)| span.contains(offset))
            .or_else(|| {
                self.moves
                    .iter()
                    .find(|(span, _)| span.kind == MDAT && span.end() == offset)
            })
            .map(|(span, new_start)| offset - span.offset + new_start)
            .ok_or_else(|| {
                ReframeError::container(format!(
                    "chunk offset {offset} does not point into any media atom"
                ))
            })
    }

    fn new_offset_of(&self, original: u64) -> Option<u64> {
        self.moves
            .iter()
            .find(|(span, _)| span.offset == original)
            .map(|(_, new_start)| *new_start)
    }
}

/// Decide the output order and patch `moov` for it. Pure over atom spans, so
/// the layout of very large files can be planned without their media bytes.
pub(crate) fn plan_rewrite(atoms: &[AtomSpan], moov: &BoxNode) -> ReframeResult<RewritePlan> {
    let ftyp = atoms.iter().find(|a| a.kind == FTYP).copied();
    let moov_offset = atoms
        .iter()
        .find(|a| a.kind == MOOV)
        .map(|a| a.offset)
        .ok_or_else(|| ReframeError::container("file has no moov atom"))?;
    let rest: Vec<AtomSpan> = atoms
        .iter()
        .filter(|a| a.offset != moov_offset && Some(a.offset) != ftyp.map(|f| f.offset))
        .copied()
        .collect();

    let mut tables = Vec::new();
    let mut scan = moov.clone();
    scan.visit_mut(&mut |node: &mut BoxNode| {
        if node.kind == STCO || node.kind == CO64 {
            tables.push(ChunkTable::parse(node)?);
        }
        Ok(())
    })?;

    let mut widen = vec![false; tables.len()];
    loop {
        // Table sizes depend only on entry width, so size the header first.
        let mut sized = moov.clone();
        rewrite_tables(&mut sized, &tables, &widen, |_, offset| Ok(offset))?;
        let relocation = Relocation::layout(ftyp.as_ref(), &rest, sized.encoded_len());

        let mut overflowing = Vec::new();
        let mut patched_count = 0usize;
        let mut patched = moov.clone();
        rewrite_tables(&mut patched, &tables, &widen, |index, offset| {
            let moved = relocation.translate(offset)?;
            patched_count += 1;
            if moved > u32::MAX as u64 && !tables[index].wide && !widen[index] {
                if overflowing.last() != Some(&index) {
                    overflowing.push(index);
                }
                return Ok(0);
            }
            Ok(moved)
        })?;

        if overflowing.is_empty() {
            let first_mdat = atoms.iter().find(|a| a.kind == MDAT);
            let media_shift = first_mdat
                .and_then(|m| relocation.new_offset_of(m.offset).map(|n| n as i64 - m.offset as i64))
                .unwrap_or(0);
            let tables_upgraded = widen.iter().filter(|w| **w).count();
            if tables_upgraded > 0 {
                tracing::info!(tables_upgraded, "Widened chunk offset tables to co64");
            }
            return Ok(RewritePlan {
                ftyp,
                moov: patched,
                rest,
                media_shift,
                offsets_patched: patched_count,
                tables_upgraded,
            });
        }

        for index in overflowing {
            widen[index] = true;
        }
    }
}

/// Replace every chunk table in `moov` (in traversal order) with offsets
/// mapped through `map`.
fn rewrite_tables<F>(
    moov: &mut BoxNode,
    tables: &[ChunkTable],
    widen: &[bool],
    mut map: F,
) -> ReframeResult<()>
where
    F: FnMut(usize, u64) -> ReframeResult<u64>,
{
    let mut index = 0usize;
    moov.visit_mut(&mut |node: &mut BoxNode| {
        if node.kind != STCO && node.kind != CO64 {
            return Ok(());
        }
        let table = &tables[index];
        let wide = table.wide || widen[index];
        let offsets = table
            .offsets
            .iter()
            .map(|&offset| map(index, offset))
            .collect::<ReframeResult<Vec<u64>>>()?;
        node.kind = if wide { CO64 } else { STCO };
        node.body = BoxBody::Leaf(table.encode(&offsets, wide)?);
        index += 1;
        Ok(())
    })
}

fn read_span<R: Read + Seek>(reader: &mut R, span: &AtomSpan) -> ReframeResult<Vec<u8>> {
    reader.seek(SeekFrom::Start(span.offset))?;
    let mut bytes = vec![0u8; span.size as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn copy_span<R: Read + Seek, W: Write>(
    reader: &mut R,
    span: &AtomSpan,
    writer: &mut W,
) -> ReframeResult<u64> {
    reader.seek(SeekFrom::Start(span.offset))?;
    let copied = io::copy(&mut (&mut *reader).take(span.size), writer)?;
    check_copied(copied, span.size)?;
    Ok(copied)
}

fn check_copied(copied: u64, expected: u64) -> ReframeResult<()> {
    if copied != expected {
        return Err(ReframeError::container(format!(
            "input ended after {copied} of {expected} bytes"
        )));
    }
    Ok(())
}
