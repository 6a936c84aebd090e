//! In-memory box trees and top-level atom scanning.

use std::io::{Cursor, Read, Seek, SeekFrom};

use reframe_common::error::{ReframeError, ReframeResult};
use serde::Serialize;

use crate::atoms::{is_container, write_box_header, BoxHeader, FourCC};

/// Location of one top-level atom in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtomSpan {
    pub kind: FourCC,
    pub offset: u64,
    pub size: u64,
    pub header_len: u8,
}

impl AtomSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.offset && position < self.end()
    }
}

/// Walk the top-level atoms of a stream of `len` bytes without reading their
/// bodies.
pub fn scan_atoms<R: Read + Seek>(reader: &mut R, len: u64) -> ReframeResult<Vec<AtomSpan>> {
    let mut atoms = Vec::new();
    let mut offset = 0u64;

    while offset < len {
        reader.seek(SeekFrom::Start(offset))?;
        let header = BoxHeader::read(reader, len - offset).map_err(|e| {
            ReframeError::container(format!("top-level atom at offset {offset}: {e}"))
        })?;
        atoms.push(AtomSpan {
            kind: header.kind,
            offset,
            size: header.size,
            header_len: header.header_len,
        });
        offset += header.size;
    }

    Ok(atoms)
}

/// Body of a parsed box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxBody {
    /// Opaque payload bytes (after the header).
    Leaf(Vec<u8>),
    Container(Vec<BoxNode>),
}

/// A parsed box. Container boxes listed in [`is_container`] are expanded;
/// everything else is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxNode {
    pub kind: FourCC,
    /// Header used when the box was read; kept when re-serializing.
    large_header: bool,
    pub body: BoxBody,
}

impl BoxNode {
    pub fn leaf(kind: FourCC, payload: Vec<u8>) -> Self {
        Self {
            kind,
            large_header: false,
            body: BoxBody::Leaf(payload),
        }
    }

    pub fn container(kind: FourCC, children: Vec<BoxNode>) -> Self {
        Self {
            kind,
            large_header: false,
            body: BoxBody::Container(children),
        }
    }

    /// Parse exactly one box occupying all of `bytes`.
    pub fn parse(bytes: &[u8]) -> ReframeResult<Self> {
        let mut nodes = Self::parse_sequence(bytes)?;
        match nodes.len() {
            1 => Ok(nodes.remove(0)),
            n => Err(ReframeError::container(format!(
                "expected a single box, found {n}"
            ))),
        }
    }

    /// Parse consecutive boxes filling `bytes`.
    pub fn parse_sequence(bytes: &[u8]) -> ReframeResult<Vec<Self>> {
        let mut nodes = Vec::new();
        let mut cursor = Cursor::new(bytes);
        let len = bytes.len() as u64;

        while cursor.position() < len {
            let start = cursor.position();
            let header = BoxHeader::read(&mut cursor, len - start)?;
            let body_start = (start + header.header_len as u64) as usize;
            let body_end = (start + header.size) as usize;
            let body = &bytes[body_start..body_end];

            let body = if is_container(header.kind) {
                BoxBody::Container(Self::parse_sequence(body).map_err(|e| {
                    ReframeError::container(format!("inside {}: {e}", header.kind))
                })?)
            } else {
                BoxBody::Leaf(body.to_vec())
            };

            nodes.push(Self {
                kind: header.kind,
                large_header: header.header_len == 16,
                body,
            });
            cursor.set_position(start + header.size);
        }

        Ok(nodes)
    }

    pub fn children(&self) -> &[BoxNode] {
        match &self.body {
            BoxBody::Container(children) => children,
            BoxBody::Leaf(_) => &[],
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            BoxBody::Leaf(data) => Some(data),
            BoxBody::Container(_) => None,
        }
    }

    pub fn child(&self, kind: FourCC) -> Option<&BoxNode> {
        self.children().iter().find(|c| c.kind == kind)
    }

    /// Follow a path of child kinds, e.g. `[MDIA, MINF, STBL]`.
    pub fn find(&self, path: &[FourCC]) -> Option<&BoxNode> {
        path.iter().try_fold(self, |node, kind| node.child(*kind))
    }

    pub fn children_of_kind(&self, kind: FourCC) -> impl Iterator<Item = &BoxNode> {
        self.children().iter().filter(move |c| c.kind == kind)
    }

    /// Depth-first pre-order traversal.
    pub fn visit_mut<F>(&mut self, f: &mut F) -> ReframeResult<()>
    where
        F: FnMut(&mut BoxNode) -> ReframeResult<()>,
    {
        f(self)?;
        if let BoxBody::Container(children) = &mut self.body {
            for child in children {
                child.visit_mut(f)?;
            }
        }
        Ok(())
    }

    pub fn visit<F>(&self, depth: usize, f: &mut F)
    where
        F: FnMut(&BoxNode, usize),
    {
        f(self, depth);
        for child in self.children() {
            child.visit(depth + 1, f);
        }
    }

    fn body_len(&self) -> u64 {
        match &self.body {
            BoxBody::Leaf(data) => data.len() as u64,
            BoxBody::Container(children) => children.iter().map(BoxNode::encoded_len).sum(),
        }
    }

    fn uses_large_header(&self) -> bool {
        self.large_header || self.body_len() + 8 > u32::MAX as u64
    }

    /// Serialized size including the header.
    pub fn encoded_len(&self) -> u64 {
        let header = if self.uses_large_header() { 16 } else { 8 };
        header + self.body_len()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> ReframeResult<()> {
        write_box_header(out, self.kind, self.encoded_len(), self.uses_large_header())?;
        match &self.body {
            BoxBody::Leaf(data) => out.extend_from_slice(data),
            BoxBody::Container(children) => {
                for child in children {
                    child.write_to(out)?;
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ReframeResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        self.write_to(&mut out)?;
        Ok(out)
    }
}
