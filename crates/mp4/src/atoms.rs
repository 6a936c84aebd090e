//! Low-level MP4 atom/box primitives.
//!
//! MP4 files are structured as nested boxes (atoms). Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "ftyp", "moov", "mdat")
//!
//! A size of 1 means a 64-bit size follows the type; a size of 0 means the
//! box runs to the end of the enclosing space. "Full boxes" additionally
//! carry a 1-byte version and 3-byte flags.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use reframe_common::error::{ReframeError, ReframeResult};
use serde::{Serialize, Serializer};

/// A four-character box type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

impl Serialize for FourCC {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub const FTYP: FourCC = FourCC::new(b"ftyp");
pub const MOOV: FourCC = FourCC::new(b"moov");
pub const MDAT: FourCC = FourCC::new(b"mdat");
pub const FREE: FourCC = FourCC::new(b"free");
pub const MVHD: FourCC = FourCC::new(b"mvhd");
pub const TRAK: FourCC = FourCC::new(b"trak");
pub const TKHD: FourCC = FourCC::new(b"tkhd");
pub const EDTS: FourCC = FourCC::new(b"edts");
pub const MDIA: FourCC = FourCC::new(b"mdia");
pub const MDHD: FourCC = FourCC::new(b"mdhd");
pub const HDLR: FourCC = FourCC::new(b"hdlr");
pub const MINF: FourCC = FourCC::new(b"minf");
pub const VMHD: FourCC = FourCC::new(b"vmhd");
pub const SMHD: FourCC = FourCC::new(b"smhd");
pub const DINF: FourCC = FourCC::new(b"dinf");
pub const DREF: FourCC = FourCC::new(b"dref");
pub const URL: FourCC = FourCC::new(b"url ");
pub const STBL: FourCC = FourCC::new(b"stbl");
pub const STSD: FourCC = FourCC::new(b"stsd");
pub const STTS: FourCC = FourCC::new(b"stts");
pub const CTTS: FourCC = FourCC::new(b"ctts");
pub const STSS: FourCC = FourCC::new(b"stss");
pub const STSZ: FourCC = FourCC::new(b"stsz");
pub const STSC: FourCC = FourCC::new(b"stsc");
pub const STCO: FourCC = FourCC::new(b"stco");
pub const CO64: FourCC = FourCC::new(b"co64");
pub const UDTA: FourCC = FourCC::new(b"udta");
pub const MVEX: FourCC = FourCC::new(b"mvex");

pub const HANDLER_VIDEO: FourCC = FourCC::new(b"vide");
pub const HANDLER_SOUND: FourCC = FourCC::new(b"soun");

/// Whether a box holds only child boxes (and is walked when looking for
/// chunk-offset tables).
pub fn is_container(kind: FourCC) -> bool {
    matches!(
        &kind.0,
        b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"edts" | b"dinf" | b"mvex"
    )
}

/// Parsed header of one box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCC,
    /// Total size including the header.
    pub size: u64,
    /// 8, or 16 for a 64-bit size.
    pub header_len: u8,
    /// The on-disk size field was 0.
    pub extends_to_end: bool,
}

impl BoxHeader {
    /// Read a header from `reader`. `available` is the number of bytes left in
    /// the enclosing space, counting from the start of this header.
    pub fn read<R: Read>(reader: &mut R, available: u64) -> ReframeResult<Self> {
        if available < 8 {
            return Err(ReframeError::container(format!(
                "{available} trailing bytes are too short for a box header"
            )));
        }
        let size32 = reader.read_u32::<BigEndian>()?;
        let mut kind = [0u8; 4];
        reader.read_exact(&mut kind)?;
        let kind = FourCC(kind);

        let (size, header_len, extends_to_end) = match size32 {
            0 => (available, 8u8, true),
            1 => {
                if available < 16 {
                    return Err(ReframeError::container(format!(
                        "box {kind} declares a 64-bit size but is truncated"
                    )));
                }
                (reader.read_u64::<BigEndian>()?, 16u8, false)
            }
            n => (n as u64, 8u8, false),
        };

        if size < header_len as u64 {
            return Err(ReframeError::container(format!(
                "box {kind} has size {size}, smaller than its header"
            )));
        }
        if size > available {
            return Err(ReframeError::container(format!(
                "box {kind} of size {size} overruns the {available} bytes available"
            )));
        }

        Ok(Self {
            kind,
            size,
            header_len,
            extends_to_end,
        })
    }

    pub fn body_len(&self) -> u64 {
        self.size - self.header_len as u64
    }
}

/// Write a header for a box of `size` total bytes, choosing the 64-bit form
/// when `size` does not fit in 32 bits or when `force_large` is set.
pub fn write_box_header<W: Write>(
    writer: &mut W,
    kind: FourCC,
    size: u64,
    force_large: bool,
) -> ReframeResult<()> {
    if force_large || size > u32::MAX as u64 {
        writer.write_u32::<BigEndian>(1)?;
        writer.write_all(kind.as_bytes())?;
        writer.write_u64::<BigEndian>(size)?;
    } else {
        writer.write_u32::<BigEndian>(size as u32)?;
        writer.write_all(kind.as_bytes())?;
    }
    Ok(())
}

/// Write a placeholder box header and return the position of its size field.
///
/// Usage pattern:
/// ```ignore
/// let pos = begin_box(&mut cursor, STBL)?;
/// // ... write box content ...
/// end_box(&mut cursor, pos)?;
/// ```
pub fn begin_box<W: Write + Seek>(writer: &mut W, kind: FourCC) -> ReframeResult<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<BigEndian>(0)?;
    writer.write_all(kind.as_bytes())?;
    Ok(pos)
}

/// Like [`begin_box`], followed by version and flags.
pub fn begin_full_box<W: Write + Seek>(
    writer: &mut W,
    kind: FourCC,
    version: u8,
    flags: u32,
) -> ReframeResult<u64> {
    let pos = begin_box(writer, kind)?;
    writer.write_u32::<BigEndian>(((version as u32) << 24) | (flags & 0x00FF_FFFF))?;
    Ok(pos)
}

/// Patch the size of a box opened with [`begin_box`].
pub fn end_box<W: Write + Seek>(writer: &mut W, size_pos: u64) -> ReframeResult<()> {
    let current = writer.stream_position()?;
    let size = current - size_pos;
    if size > u32::MAX as u64 {
        return Err(ReframeError::container(format!(
            "box size {size} exceeds 32-bit limit"
        )));
    }
    writer.seek(SeekFrom::Start(size_pos))?;
    writer.write_u32::<BigEndian>(size as u32)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Read version and flags of a full box body.
pub fn read_version_flags<R: Read>(reader: &mut R) -> ReframeResult<(u8, u32)> {
    let word = reader.read_u32::<BigEndian>()?;
    Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
}
