//! The length-prefixed hash file format used for property lists, directory
//! listings and the revprops file:
//!
//! ```text
//! K 3
//! foo
//! V 5
//! value
//! END
//! ```
//!
//! Keys and values are arbitrary bytes of the stated length followed by a
//! newline. The incremental variant adds `D <len>\n<key>\n` deletion
//! entries and is read to end-of-file instead of to the `END` terminator;
//! it backs the append-only mutable directory files.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use crate::error::{CResult, Error};

/// Writes MAP, optionally followed by the `END` terminator.
pub fn write_hash<W: Write>(
    w: &mut W,
    map: &BTreeMap<String, String>,
    terminate: bool,
) -> CResult<()> {
    for (key, value) in map {
        write_entry(w, key, value)?;
    }
    if terminate {
        w.write_all(b"END\n")?;
    }
    Ok(())
}

/// Writes a single `K`/`V` pair (an incremental upsert).
pub fn write_entry<W: Write>(w: &mut W, key: &str, value: &str) -> CResult<()> {
    write!(w, "K {}\n{}\nV {}\n{}\n", key.len(), key, value.len(), value)?;
    Ok(())
}

/// Writes a single `D` entry (an incremental deletion).
pub fn write_delete<W: Write>(w: &mut W, key: &str) -> CResult<()> {
    write!(w, "D {}\n{}\n", key.len(), key)?;
    Ok(())
}

/// Reads a terminated hash: entries up to the `END` line.
pub fn read_hash<R: BufRead>(r: &mut R) -> CResult<BTreeMap<String, String>> {
    read(r, true)
}

/// Reads an incremental hash: `K`/`V` upserts and `D` deletions up to
/// end-of-file (or an `END` line, whichever comes first).
pub fn read_incremental<R: BufRead>(r: &mut R) -> CResult<BTreeMap<String, String>> {
    read(r, false)
}

fn read<R: BufRead>(r: &mut R, terminated: bool) -> CResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    loop {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            if terminated {
                return Err(Error::Corrupt("hash file ended without terminator".into()));
            }
            return Ok(map);
        }
        let line = line.trim_end_matches('\n');
        if line == "END" {
            return Ok(map);
        }
        match line.split_once(' ') {
            Some(("K", len)) => {
                let key = read_sized(r, len.parse()?)?;
                let value = expect_sized_line(r, "V")?;
                map.insert(key, value);
            }
            Some(("D", len)) => {
                let key = read_sized(r, len.parse()?)?;
                map.remove(&key);
            }
            _ => return Err(Error::Corrupt(format!("malformed hash file line '{}'", line))),
        }
    }
}

fn expect_sized_line<R: BufRead>(r: &mut R, tag: &str) -> CResult<String> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(Error::Corrupt("hash file truncated".into()));
    }
    let line = line.trim_end_matches('\n');
    match line.split_once(' ') {
        Some((t, len)) if t == tag => read_sized(r, len.parse()?),
        _ => Err(Error::Corrupt(format!("expected '{} <len>', found '{}'", tag, line))),
    }
}

fn read_sized<R: BufRead>(r: &mut R, len: usize) -> CResult<String> {
    let mut buf = vec![0u8; len + 1];
    r.read_exact(&mut buf)
        .map_err(|_| Error::Corrupt("hash file truncated".into()))?;
    if buf.pop() != Some(b'\n') {
        return Err(Error::Corrupt("hash file entry not newline-terminated".into()));
    }
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("svn:log".to_string(), "two\nlines".to_string());
        map.insert("author".to_string(), "alice".to_string());
        map.insert("empty".to_string(), String::new());
        map
    }

    #[test]
    fn roundtrip_terminated() -> CResult<()> {
        let mut buf = Vec::new();
        write_hash(&mut buf, &sample(), true)?;
        assert_eq!(read_hash(&mut Cursor::new(&buf))?, sample());
        Ok(())
    }

    #[test]
    fn roundtrip_unterminated() -> CResult<()> {
        let mut buf = Vec::new();
        write_hash(&mut buf, &sample(), false)?;
        assert_eq!(read_incremental(&mut Cursor::new(&buf))?, sample());
        Ok(())
    }

    #[test]
    fn incremental_applies_deletes() -> CResult<()> {
        let mut buf = Vec::new();
        write_hash(&mut buf, &sample(), false)?;
        write_delete(&mut buf, "author")?;
        write_entry(&mut buf, "empty", "no longer")?;
        let map = read_incremental(&mut Cursor::new(&buf))?;
        assert_eq!(map.get("author"), None);
        assert_eq!(map.get("empty").map(String::as_str), Some("no longer"));
        Ok(())
    }

    #[test]
    fn missing_terminator_is_corrupt() {
        let mut buf = Vec::new();
        write_hash(&mut buf, &sample(), false).unwrap();
        assert!(read_hash(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn values_may_look_like_syntax() -> CResult<()> {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "END\nK 3\nfoo".to_string());
        let mut buf = Vec::new();
        write_hash(&mut buf, &map, true)?;
        assert_eq!(read_hash(&mut Cursor::new(&buf))?, map);
        Ok(())
    }
}
