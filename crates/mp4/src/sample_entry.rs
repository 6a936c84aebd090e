//! Sample description entries (`stsd` children) and codec configuration boxes.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::format::{mime, MediaFormat, MediaKind, AAC_PROFILE_LC};

use crate::atoms::{begin_box, end_box, FourCC};
use crate::tree::BoxNode;

const AVC1: FourCC = FourCC::new(b"avc1");
const AVC3: FourCC = FourCC::new(b"avc3");
const HVC1: FourCC = FourCC::new(b"hvc1");
const HEV1: FourCC = FourCC::new(b"hev1");
const VP08: FourCC = FourCC::new(b"vp08");
const VP09: FourCC = FourCC::new(b"vp09");
const AV01: FourCC = FourCC::new(b"av01");
const MP4A: FourCC = FourCC::new(b"mp4a");
const OPUS: FourCC = FourCC::new(b"Opus");

const AVCC: FourCC = FourCC::new(b"avcC");
const HVCC: FourCC = FourCC::new(b"hvcC");
const VPCC: FourCC = FourCC::new(b"vpcC");
const AV1C: FourCC = FourCC::new(b"av1C");
const ESDS: FourCC = FourCC::new(b"esds");
const DOPS: FourCC = FourCC::new(b"dOps");

/// Visual sample entry fields before child boxes.
const VISUAL_ENTRY_LEN: usize = 78;
/// Audio sample entry fields before child boxes.
const AUDIO_ENTRY_LEN: usize = 28;

/// MPEG-4 audio object type indication for AAC.
const OTI_AAC: u8 = 0x40;

/// Sample entry and configuration box used for a codec.
struct CodecBoxes {
    entry: FourCC,
    config: FourCC,
}

fn codec_boxes(mime_type: &str) -> ReframeResult<CodecBoxes> {
    let (entry, config) = match mime_type {
        mime::VIDEO_AVC => (AVC1, AVCC),
        mime::VIDEO_HEVC => (HVC1, HVCC),
        mime::VIDEO_VP8 => (VP08, VPCC),
        mime::VIDEO_VP9 => (VP09, VPCC),
        mime::VIDEO_AV1 => (AV01, AV1C),
        mime::AUDIO_AAC => (MP4A, ESDS),
        mime::AUDIO_OPUS => (OPUS, DOPS),
        other => {
            return Err(ReframeError::unsupported(format!(
                "no MPEG-4 sample entry for {other}"
            )))
        }
    };
    Ok(CodecBoxes { entry, config })
}

fn mime_for_entry(entry: FourCC) -> Option<&'static str> {
    Some(match entry {
        AVC1 | AVC3 => mime::VIDEO_AVC,
        HVC1 | HEV1 => mime::VIDEO_HEVC,
        VP08 => mime::VIDEO_VP8,
        VP09 => mime::VIDEO_VP9,
        AV01 => mime::VIDEO_AV1,
        MP4A => mime::AUDIO_AAC,
        OPUS => mime::AUDIO_OPUS,
        _ => return None,
    })
}

/// Whether the muxer can describe tracks of this mime type.
pub fn is_supported(mime_type: &str) -> bool {
    codec_boxes(mime_type).is_ok()
}

/// Serialize the sample entry for `format` (one `stsd` child).
pub fn write_sample_entry<W: Write + Seek>(writer: &mut W, format: &MediaFormat) -> ReframeResult<()> {
    let boxes = codec_boxes(&format.mime)?;
    let kind = format
        .kind()
        .ok_or_else(|| ReframeError::unsupported(format!("track mime {}", format.mime)))?;

    let entry = begin_box(writer, boxes.entry)?;
    writer.write_all(&[0u8; 6])?;
    writer.write_u16::<BigEndian>(1)?; // data_reference_index

    match kind {
        MediaKind::Video => {
            writer.write_u16::<BigEndian>(0)?;
            writer.write_u16::<BigEndian>(0)?;
            writer.write_all(&[0u8; 12])?;
            writer.write_u16::<BigEndian>(format.width.unwrap_or(0) as u16)?;
            writer.write_u16::<BigEndian>(format.height.unwrap_or(0) as u16)?;
            writer.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
            writer.write_u32::<BigEndian>(0x0048_0000)?;
            writer.write_u32::<BigEndian>(0)?;
            writer.write_u16::<BigEndian>(1)?; // frame_count
            writer.write_all(&[0u8; 32])?; // compressorname
            writer.write_u16::<BigEndian>(0x0018)?;
            writer.write_i16::<BigEndian>(-1)?;
        }
        MediaKind::Audio => {
            writer.write_all(&[0u8; 8])?;
            writer.write_u16::<BigEndian>(format.channel_count.unwrap_or(2) as u16)?;
            writer.write_u16::<BigEndian>(16)?;
            writer.write_u16::<BigEndian>(0)?;
            writer.write_u16::<BigEndian>(0)?;
            let rate = format.sample_rate.unwrap_or(0).min(u16::MAX as u32);
            writer.write_u32::<BigEndian>(rate << 16)?;
        }
    }

    if let Some(config) = config_payload(boxes.config, format)? {
        let pos = begin_box(writer, boxes.config)?;
        writer.write_all(&config)?;
        end_box(writer, pos)?;
    }

    end_box(writer, entry)
}

fn config_payload(config: FourCC, format: &MediaFormat) -> ReframeResult<Option<Vec<u8>>> {
    let csd = &format.codec_specific_data;
    if csd.is_empty() {
        return Ok(None);
    }
    let payload = match config {
        AVCC => avc_config(csd).unwrap_or_else(|| csd.concat()),
        ESDS => esds(format)?,
        _ => csd.concat(),
    };
    Ok(Some(payload))
}

/// Strip an Annex-B start code.
fn strip_start_code(nal: &[u8]) -> &[u8] {
    if nal.starts_with(&[0, 0, 0, 1]) {
        &nal[4..]
    } else if nal.starts_with(&[0, 0, 1]) {
        &nal[3..]
    } else {
        nal
    }
}

/// AVCDecoderConfigurationRecord from SPS (`csd-0`) and PPS (`csd-1`).
fn avc_config(csd: &[Vec<u8>]) -> Option<Vec<u8>> {
    let sps = strip_start_code(csd.first()?);
    let pps = strip_start_code(csd.get(1)?);
    if sps.len() < 4 || pps.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.extend_from_slice(&sps[1..4]); // profile, compatibility, level
    out.push(0xFF); // 4-byte NAL lengths
    out.push(0xE1); // one SPS
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1);
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    Some(out)
}

fn parse_avc_config(payload: &[u8]) -> ReframeResult<Vec<Vec<u8>>> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_u8()?;
    if version != 1 {
        return Ok(vec![payload.to_vec()]);
    }
    cursor.seek(SeekFrom::Current(4))?;

    let mut csd = Vec::new();
    let sps_count = cursor.read_u8()? & 0x1F;
    let mut sps = Vec::new();
    for _ in 0..sps_count {
        sps.extend_from_slice(&[0, 0, 0, 1]);
        sps.extend(read_nal(&mut cursor)?);
    }
    csd.push(sps);

    let pps_count = cursor.read_u8()?;
    let mut pps = Vec::new();
    for _ in 0..pps_count {
        pps.extend_from_slice(&[0, 0, 0, 1]);
        pps.extend(read_nal(&mut cursor)?);
    }
    csd.push(pps);
    Ok(csd)
}

fn read_nal(cursor: &mut Cursor<&[u8]>) -> ReframeResult<Vec<u8>> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut nal = vec![0u8; len];
    cursor.read_exact(&mut nal)?;
    Ok(nal)
}

/// Write an MPEG-4 descriptor with the expandable size encoding.
fn write_descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    let mut len = body.len();
    let mut size_bytes = vec![(len & 0x7F) as u8];
    len >>= 7;
    while len > 0 {
        size_bytes.push(0x80 | (len & 0x7F) as u8);
        len >>= 7;
    }
    size_bytes.reverse();
    out.extend_from_slice(&size_bytes);
    out.extend_from_slice(body);
}

/// Elementary stream descriptor payload (full box body) for AAC.
fn esds(format: &MediaFormat) -> ReframeResult<Vec<u8>> {
    let asc = format
        .codec_specific_data
        .first()
        .cloned()
        .unwrap_or_default();
    let bit_rate = format.bit_rate.unwrap_or(0);

    let mut decoder_config = Vec::new();
    decoder_config.push(OTI_AAC);
    decoder_config.push(0x15); // audio stream, upstream=0, reserved=1
    decoder_config.write_u24::<BigEndian>(0)?; // bufferSizeDB
    decoder_config.write_u32::<BigEndian>(bit_rate)?; // maxBitrate
    decoder_config.write_u32::<BigEndian>(bit_rate)?; // avgBitrate
    write_descriptor(&mut decoder_config, 0x05, &asc);

    let mut es = Vec::new();
    es.write_u16::<BigEndian>(0)?; // ES_ID
    es.push(0); // flags
    write_descriptor(&mut es, 0x04, &decoder_config);
    write_descriptor(&mut es, 0x06, &[0x02]);

    let mut out = vec![0u8; 4]; // version + flags
    write_descriptor(&mut out, 0x03, &es);
    Ok(out)
}

fn read_descriptor_header(cursor: &mut Cursor<&[u8]>) -> ReframeResult<(u8, usize)> {
    let tag = cursor.read_u8()?;
    let mut len = 0usize;
    for _ in 0..4 {
        let b = cursor.read_u8()?;
        len = (len << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, len))
}

/// Find the AudioSpecificConfig inside an `esds` body.
fn parse_esds(payload: &[u8]) -> ReframeResult<Option<Vec<u8>>> {
    let mut cursor = Cursor::new(payload);
    cursor.seek(SeekFrom::Start(4))?;

    let (tag, _) = read_descriptor_header(&mut cursor)?;
    if tag != 0x03 {
        return Ok(None);
    }
    cursor.seek(SeekFrom::Current(2))?;
    let flags = cursor.read_u8()?;
    if flags & 0x80 != 0 {
        cursor.seek(SeekFrom::Current(2))?;
    }
    if flags & 0x40 != 0 {
        let url_len = cursor.read_u8()? as i64;
        cursor.seek(SeekFrom::Current(url_len))?;
    }
    if flags & 0x20 != 0 {
        cursor.seek(SeekFrom::Current(2))?;
    }

    let (tag, _) = read_descriptor_header(&mut cursor)?;
    if tag != 0x04 {
        return Ok(None);
    }
    cursor.seek(SeekFrom::Current(13))?;

    let (tag, len) = read_descriptor_header(&mut cursor)?;
    if tag != 0x05 {
        return Ok(None);
    }
    let mut asc = vec![0u8; len];
    cursor.read_exact(&mut asc)?;
    Ok(Some(asc))
}

/// Rebuild a track format from its sample entry box.
pub fn parse_sample_entry(entry: &BoxNode) -> ReframeResult<MediaFormat> {
    let mime_type = mime_for_entry(entry.kind).ok_or_else(|| {
        ReframeError::demux(format!("unsupported sample entry {}", entry.kind))
    })?;
    let payload = entry
        .payload()
        .ok_or_else(|| ReframeError::demux("sample entry has no payload"))?;

    let kind = MediaKind::from_mime(mime_type)
        .ok_or_else(|| ReframeError::demux(format!("unknown kind for {mime_type}")))?;
    let fixed_len = match kind {
        MediaKind::Video => VISUAL_ENTRY_LEN,
        MediaKind::Audio => AUDIO_ENTRY_LEN,
    };
    if payload.len() < fixed_len {
        return Err(ReframeError::demux(format!(
            "{} sample entry is truncated",
            entry.kind
        )));
    }

    let mut cursor = Cursor::new(payload);
    cursor.seek(SeekFrom::Start(8))?;
    let mut format = match kind {
        MediaKind::Video => {
            cursor.seek(SeekFrom::Current(16))?;
            let width = cursor.read_u16::<BigEndian>()? as u32;
            let height = cursor.read_u16::<BigEndian>()? as u32;
            MediaFormat::video(mime_type, width, height)
        }
        MediaKind::Audio => {
            cursor.seek(SeekFrom::Current(8))?;
            let channels = cursor.read_u16::<BigEndian>()? as u32;
            cursor.seek(SeekFrom::Current(6))?;
            let rate = cursor.read_u32::<BigEndian>()? >> 16;
            MediaFormat::audio(mime_type, rate, channels)
        }
    };

    for child in BoxNode::parse_sequence(&payload[fixed_len..])? {
        let Some(data) = child.payload() else {
            continue;
        };
        match child.kind {
            AVCC => format.codec_specific_data = parse_avc_config(data)?,
            ESDS => {
                if let Some(asc) = parse_esds(data)? {
                    format.codec_specific_data = vec![asc];
                    format.aac_profile = Some(AAC_PROFILE_LC);
                }
            }
            HVCC | VPCC | AV1C | DOPS => format.codec_specific_data = vec![data.to_vec()],
            _ => {}
        }
    }

    Ok(format)
}
