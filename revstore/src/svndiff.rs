//! The svndiff binary delta format, versions 0 and 1. A diff is a 4-byte
//! header (`SVN\0` or `SVN\x01`) followed by windows. Each window carries
//! five varints (source view offset and length, target view length,
//! instruction and new-data section lengths) and then the two sections.
//! Instructions copy from the source view, copy from the already-produced
//! part of the target view, or take literal bytes from the new-data
//! section. Version 1 prefixes each section with its decoded length;
//! sections are stored uncompressed (a compressed section from a foreign
//! writer is rejected on read).
//!
//! The encoder matches the common prefix and suffix of each aligned
//! source/target window pair, which captures the dominant cases of
//! appends, truncations and small in-place edits.

use std::io::Read;
use std::io::Write;

use crate::error::{CResult, Error};

const HEADER_V0: &[u8; 4] = b"SVN\x00";
const HEADER_V1: &[u8; 4] = b"SVN\x01";

/// Source and target are processed in aligned windows of this many bytes.
pub const WINDOW_SIZE: usize = 100 * 1024;

fn write_varint<W: Write>(w: &mut W, mut value: u64) -> CResult<()> {
    let mut bytes = [0u8; 10];
    let mut i = bytes.len();
    loop {
        i -= 1;
        bytes[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = bytes.len() - 1;
    for b in &mut bytes[i..last] {
        *b |= 0x80;
    }
    w.write_all(&bytes[i..])?;
    Ok(())
}

fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v > 0 {
        len += 1;
        v >>= 7;
    }
    len
}

fn read_byte<R: Read>(r: &mut R) -> CResult<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_varint<R: Read>(r: &mut R) -> CResult<u64> {
    match try_read_varint(r)? {
        Some(value) => Ok(value),
        None => Err(Error::Corrupt("truncated svndiff data".into())),
    }
}

/// Reads a varint, or None on a clean end-of-stream before the first byte.
fn try_read_varint<R: Read>(r: &mut R) -> CResult<Option<u64>> {
    let mut value: u64 = match read_byte(r)? {
        None => return Ok(None),
        Some(b) => {
            if b & 0x80 == 0 {
                return Ok(Some(b as u64));
            }
            (b & 0x7f) as u64
        }
    };
    loop {
        let b = read_byte(r)?
            .ok_or_else(|| Error::Corrupt("truncated svndiff varint".into()))?;
        if value >= 1 << 57 {
            return Err(Error::Corrupt("svndiff varint overflows".into()));
        }
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
}

const OP_COPY_SOURCE: u8 = 0;
const OP_COPY_TARGET: u8 = 1;
const OP_NEW_DATA: u8 = 2;

fn encode_instr(buf: &mut Vec<u8>, op: u8, offset: Option<u64>, len: u64) -> CResult<()> {
    if len > 0 && len < 64 {
        buf.push((op << 6) | len as u8);
    } else {
        buf.push(op << 6);
        write_varint(buf, len)?;
    }
    if let Some(offset) = offset {
        write_varint(buf, offset)?;
    }
    Ok(())
}

/// A streaming svndiff writer over a fully materialized source.
pub struct Encoder<W: Write> {
    out: W,
    source: Vec<u8>,
    source_pos: usize,
    buf: Vec<u8>,
    version: u8,
}

impl<W: Write> Encoder<W> {
    pub fn new(mut out: W, source: Vec<u8>, version: u8) -> CResult<Self> {
        out.write_all(if version >= 1 { HEADER_V1 } else { HEADER_V0 })?;
        Ok(Self { out, source, source_pos: 0, buf: Vec::new(), version })
    }

    pub fn write(&mut self, data: &[u8]) -> CResult<()> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= WINDOW_SIZE {
            let rest = self.buf.split_off(WINDOW_SIZE);
            let window = std::mem::replace(&mut self.buf, rest);
            self.emit_window(&window)?;
        }
        Ok(())
    }

    /// Flushes the final partial window and returns the underlying writer.
    pub fn finish(mut self) -> CResult<W> {
        if !self.buf.is_empty() {
            let window = std::mem::take(&mut self.buf);
            self.emit_window(&window)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }

    fn emit_window(&mut self, target: &[u8]) -> CResult<()> {
        let start = self.source_pos.min(self.source.len());
        let end = (self.source_pos.saturating_add(WINDOW_SIZE)).min(self.source.len());
        let sview = &self.source[start..end];
        self.source_pos = self.source_pos.saturating_add(WINDOW_SIZE);
        write_window(&mut self.out, self.version, start as u64, sview, target)
    }
}

fn write_window<W: Write>(
    out: &mut W,
    version: u8,
    sview_offset: u64,
    sview: &[u8],
    target: &[u8],
) -> CResult<()> {
    let prefix = sview.iter().zip(target).take_while(|(a, b)| a == b).count();
    let suffix = sview[prefix..]
        .iter()
        .rev()
        .zip(target[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let middle = &target[prefix..target.len() - suffix];

    let mut instrs = Vec::new();
    if prefix > 0 {
        encode_instr(&mut instrs, OP_COPY_SOURCE, Some(0), prefix as u64)?;
    }
    if !middle.is_empty() {
        encode_instr(&mut instrs, OP_NEW_DATA, None, middle.len() as u64)?;
    }
    if suffix > 0 {
        encode_instr(&mut instrs, OP_COPY_SOURCE, Some((sview.len() - suffix) as u64), suffix as u64)?;
    }

    let uses_source = prefix > 0 || suffix > 0;
    let (sview_offset, sview_len) = if uses_source { (sview_offset, sview.len() as u64) } else { (0, 0) };

    // Version 1 sections carry a decoded-length prefix; the window header
    // counts the on-disk section lengths including that prefix.
    let section_extra = |len: u64| if version >= 1 { varint_len(len) as u64 } else { 0 };

    write_varint(out, sview_offset)?;
    write_varint(out, sview_len)?;
    write_varint(out, target.len() as u64)?;
    write_varint(out, instrs.len() as u64 + section_extra(instrs.len() as u64))?;
    write_varint(out, middle.len() as u64 + section_extra(middle.len() as u64))?;
    if version >= 1 {
        write_varint(out, instrs.len() as u64)?;
    }
    out.write_all(&instrs)?;
    if version >= 1 {
        write_varint(out, middle.len() as u64)?;
    }
    out.write_all(middle)?;
    Ok(())
}

fn read_section<R: Read>(r: &mut R, on_disk_len: u64, version: u8) -> CResult<Vec<u8>> {
    let mut section = vec![0u8; on_disk_len as usize];
    r.read_exact(&mut section)
        .map_err(|_| Error::Corrupt("truncated svndiff window section".into()))?;
    if version == 0 {
        return Ok(section);
    }
    let mut cursor = &section[..];
    let decoded_len = read_varint(&mut cursor)?;
    if cursor.len() as u64 != decoded_len {
        return Err(Error::Internal("compressed svndiff sections are not supported".into()));
    }
    Ok(cursor.to_vec())
}

/// Expands an svndiff stream against SOURCE, reading windows to the end of
/// the stream.
pub fn apply<R: Read>(r: &mut R, source: &[u8]) -> CResult<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)
        .map_err(|_| Error::Corrupt("svndiff data missing header".into()))?;
    let version = match &header {
        HEADER_V0 => 0,
        HEADER_V1 => 1,
        _ => return Err(Error::Corrupt("unrecognized svndiff header".into())),
    };

    let mut target = Vec::new();
    loop {
        let sview_offset = match try_read_varint(r)? {
            None => return Ok(target),
            Some(v) => v,
        };
        let sview_len = read_varint(r)?;
        let tview_len = read_varint(r)?;
        let instr_len = read_varint(r)?;
        let data_len = read_varint(r)?;

        if sview_offset.saturating_add(sview_len) > source.len() as u64 {
            return Err(Error::Corrupt("svndiff source view outside the source".into()));
        }
        let sview = &source[sview_offset as usize..(sview_offset + sview_len) as usize];

        let instrs = read_section(r, instr_len, version)?;
        let data = read_section(r, data_len, version)?;

        let mut tview: Vec<u8> = Vec::with_capacity(tview_len as usize);
        let mut data_pos = 0usize;
        let mut instr_cursor = &instrs[..];
        while !instr_cursor.is_empty() {
            let first = instr_cursor[0];
            instr_cursor = &instr_cursor[1..];
            let op = first >> 6;
            let mut len = (first & 0x3f) as u64;
            if len == 0 {
                len = read_varint(&mut instr_cursor)?;
            }
            match op {
                OP_COPY_SOURCE => {
                    let offset = read_varint(&mut instr_cursor)?;
                    if offset.saturating_add(len) > sview.len() as u64 {
                        return Err(Error::Corrupt("svndiff copy outside the source view".into()));
                    }
                    tview.extend_from_slice(&sview[offset as usize..(offset + len) as usize]);
                }
                OP_COPY_TARGET => {
                    let offset = read_varint(&mut instr_cursor)? as usize;
                    if offset >= tview.len() {
                        return Err(Error::Corrupt("svndiff copy outside the target view".into()));
                    }
                    // May overlap with the bytes it is producing.
                    for i in 0..len as usize {
                        let byte = tview[offset + i];
                        tview.push(byte);
                    }
                }
                OP_NEW_DATA => {
                    let end = data_pos + len as usize;
                    if end > data.len() {
                        return Err(Error::Corrupt("svndiff new data overruns its section".into()));
                    }
                    tview.extend_from_slice(&data[data_pos..end]);
                    data_pos = end;
                }
                _ => return Err(Error::Corrupt("unknown svndiff instruction".into())),
            }
        }
        if tview.len() as u64 != tview_len {
            return Err(Error::Corrupt(format!(
                "svndiff window produced {} bytes, header promised {}",
                tview.len(),
                tview_len
            )));
        }
        target.extend_from_slice(&tview);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(source: &[u8], target: &[u8], version: u8) -> CResult<()> {
        let mut encoder = Encoder::new(Vec::new(), source.to_vec(), version)?;
        encoder.write(target)?;
        let diff = encoder.finish()?;
        let expanded = apply(&mut Cursor::new(&diff), source)?;
        assert_eq!(expanded, target, "version {}", version);
        Ok(())
    }

    #[test]
    fn empty_target() -> CResult<()> {
        for version in [0, 1] {
            roundtrip(b"some source", b"", version)?;
            roundtrip(b"", b"", version)?;
        }
        Ok(())
    }

    #[test]
    fn self_delta() -> CResult<()> {
        for version in [0, 1] {
            roundtrip(b"", b"hello\n", version)?;
        }
        Ok(())
    }

    #[test]
    fn identical_content_is_all_copies() -> CResult<()> {
        let text = b"identical content".repeat(10);
        for version in [0, 1] {
            let mut encoder = Encoder::new(Vec::new(), text.clone(), version)?;
            encoder.write(&text)?;
            let diff = encoder.finish()?;
            // Header + one small window; far smaller than the content.
            assert!(diff.len() < 32, "diff is {} bytes", diff.len());
            assert_eq!(apply(&mut Cursor::new(&diff), &text)?, text);
        }
        Ok(())
    }

    #[test]
    fn append_and_edit() -> CResult<()> {
        let source = b"line one\nline two\nline three\n".to_vec();
        let mut appended = source.clone();
        appended.extend_from_slice(b"line four\n");
        let edited = b"line one\nline 2!\nline three\n".to_vec();
        for version in [0, 1] {
            roundtrip(&source, &appended, version)?;
            roundtrip(&source, &edited, version)?;
            roundtrip(&source, b"completely different", version)?;
        }
        Ok(())
    }

    #[test]
    fn multi_window() -> CResult<()> {
        let source: Vec<u8> = (0..WINDOW_SIZE * 2 + 500).map(|i| (i % 251) as u8).collect();
        let mut target = source.clone();
        target[10] ^= 0xff;
        target[WINDOW_SIZE + 17] ^= 0xff;
        target.extend_from_slice(b"tail");
        for version in [0, 1] {
            roundtrip(&source, &target, version)?;
        }
        Ok(())
    }

    #[test]
    fn copy_target_instruction_expands_runs() -> CResult<()> {
        // Hand-built diff: 1 literal byte, then a self-overlapping target
        // copy producing seven more.
        let mut diff = HEADER_V0.to_vec();
        let mut window = Vec::new();
        let mut instrs = Vec::new();
        encode_instr(&mut instrs, OP_NEW_DATA, None, 1)?;
        encode_instr(&mut instrs, OP_COPY_TARGET, Some(0), 7)?;
        write_varint(&mut window, 0)?; // source view offset
        write_varint(&mut window, 0)?; // source view length
        write_varint(&mut window, 8)?; // target view length
        write_varint(&mut window, instrs.len() as u64)?;
        write_varint(&mut window, 1)?;
        window.extend_from_slice(&instrs);
        window.push(b'x');
        diff.extend_from_slice(&window);

        assert_eq!(apply(&mut Cursor::new(&diff), b"")?, b"xxxxxxxx".to_vec());
        Ok(())
    }

    #[test]
    /// Random sources and targets across several sizes, both versions.
    fn random_roundtrips() -> CResult<()> {
        use rand::{Rng, RngCore, SeedableRng};
        let seed: u64 = rand::thread_rng().gen();
        let mut rng: rand::rngs::StdRng = SeedableRng::seed_from_u64(seed);
        println!("seed = {}", seed);

        for _ in 0..20 {
            let source_len = rng.gen_range(0..3 * WINDOW_SIZE / 2);
            let mut source = vec![0u8; source_len];
            rng.fill_bytes(&mut source);

            // Derive the target by mutating a copy of the source, so real
            // copy instructions come out of the matcher.
            let mut target = source.clone();
            for _ in 0..rng.gen_range(0..4) {
                if target.is_empty() {
                    break;
                }
                let at = rng.gen_range(0..target.len());
                target[at] ^= 0x5a;
            }
            if rng.gen_bool(0.5) {
                let mut tail = vec![0u8; rng.gen_range(0..1024)];
                rng.fill_bytes(&mut tail);
                target.extend_from_slice(&tail);
            }
            if rng.gen_bool(0.3) {
                target.truncate(target.len() / 2);
            }

            for version in [0, 1] {
                roundtrip(&source, &target, version)?;
            }
        }
        Ok(())
    }

    #[test]
    fn truncated_diff_is_corrupt() -> CResult<()> {
        let mut encoder = Encoder::new(Vec::new(), b"base".to_vec(), 0)?;
        encoder.write(b"target bytes")?;
        let diff = encoder.finish()?;
        // A cut at exactly the 4-byte header is a valid empty diff; every
        // other prefix must be rejected.
        for cut in (1..diff.len()).filter(|&cut| cut != 4) {
            assert!(apply(&mut Cursor::new(&diff[..cut]), b"base").is_err(), "cut {}", cut);
        }
        Ok(())
    }
}
