//! The node revision record and its on-disk codec, plus the representation
//! descriptor and the one-line representation blob headers.
//!
//! A noderev record is a sequence of `header: value` lines terminated by a
//! blank line, e.g.:
//!
//! ```text
//! id: 0.0.r1/83
//! type: dir
//! pred: 0.0.r0/17
//! count: 1
//! text: r1 0 54 0 9e1b... - -
//! cpath: /
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::io::{BufRead, Write};

use crate::error::{CResult, Error};
use crate::id::{NodeId, Rev};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn parse(s: &str) -> CResult<Self> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            _ => Err(Error::Parse(format!("unknown node kind '{}'", s))),
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a representation's bytes live: a committed revision file or the
/// proto-rev file of the named transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepLocation {
    Rev(Rev),
    Txn(String),
}

/// A pointer to a byte blob holding file contents, a directory listing or
/// a property list. Multiple noderevs may point at the same blob.
#[derive(Clone, Debug, PartialEq)]
pub struct Representation {
    pub location: RepLocation,
    /// Byte offset of the rep header inside its revision or proto-rev file.
    pub offset: u64,
    /// On-disk length of the blob between the header line and `ENDREP`.
    pub size: u64,
    /// Length of the fully expanded contents; 0 for plainly stored blobs.
    pub expanded_size: u64,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    /// `<txn_id>/<node_id>`, distinguishing equal-content reps created by
    /// different transactions.
    pub uniquifier: Option<String>,
}

impl Representation {
    /// A fresh mutable rep whose bytes will be appended to the proto-rev
    /// file of TXN_ID.
    pub fn new_mutable(txn_id: impl Into<String>) -> Self {
        Self {
            location: RepLocation::Txn(txn_id.into()),
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: None,
            sha1: None,
            uniquifier: None,
        }
    }

    pub fn is_txn(&self) -> bool {
        matches!(self.location, RepLocation::Txn(_))
    }

    /// The revision holding this rep, or `INVALID_REV` while mutable.
    pub fn rev(&self) -> Rev {
        match self.location {
            RepLocation::Rev(rev) => rev,
            RepLocation::Txn(_) => crate::id::INVALID_REV,
        }
    }

    pub fn unparse(&self) -> String {
        let loc = match &self.location {
            RepLocation::Rev(rev) => format!("r{}", rev),
            RepLocation::Txn(txn_id) => format!("t{}", txn_id),
        };
        format!(
            "{} {} {} {} {} {} {}",
            loc,
            self.offset,
            self.size,
            self.expanded_size,
            self.md5.map_or_else(|| "-".to_string(), hex::encode),
            self.sha1.map_or_else(|| "-".to_string(), hex::encode),
            self.uniquifier.as_deref().unwrap_or("-"),
        )
    }

    pub fn parse(s: &str) -> CResult<Self> {
        let fields: Vec<&str> = s.split(' ').collect();
        if fields.len() != 7 {
            return Err(Error::Parse(format!("malformed representation '{}'", s)));
        }
        let location = if let Some(rev) = fields[0].strip_prefix('r') {
            RepLocation::Rev(rev.parse()?)
        } else if let Some(txn_id) = fields[0].strip_prefix('t').filter(|t| !t.is_empty()) {
            RepLocation::Txn(txn_id.to_string())
        } else {
            return Err(Error::Parse(format!("malformed representation '{}'", s)));
        };
        Ok(Self {
            location,
            offset: fields[1].parse()?,
            size: fields[2].parse()?,
            expanded_size: fields[3].parse()?,
            md5: parse_digest(fields[4])?,
            sha1: parse_digest(fields[5])?,
            uniquifier: match fields[6] {
                "-" => None,
                u => Some(u.to_string()),
            },
        })
    }
}

fn parse_digest<const N: usize>(s: &str) -> CResult<Option<[u8; N]>> {
    if s == "-" {
        return Ok(None);
    }
    let bytes = hex::decode(s).map_err(|err| Error::Parse(err.to_string()))?;
    let digest: [u8; N] = bytes
        .try_into()
        .map_err(|_| Error::Parse(format!("digest '{}' has the wrong length", s)))?;
    Ok(Some(digest))
}

/// The one-line header prefixed to every representation blob.
#[derive(Clone, Debug, PartialEq)]
pub enum RepHeader {
    /// Literal bytes follow.
    Plain,
    /// svndiff against the empty stream follows.
    SelfDelta,
    /// svndiff against the rep at (rev, offset), whose on-disk length is
    /// `base_length`.
    Delta { base_rev: Rev, base_offset: u64, base_length: u64 },
}

impl RepHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> CResult<()> {
        match self {
            RepHeader::Plain => w.write_all(b"PLAIN\n")?,
            RepHeader::SelfDelta => w.write_all(b"DELTA\n")?,
            RepHeader::Delta { base_rev, base_offset, base_length } => {
                write!(w, "DELTA {} {} {}\n", base_rev, base_offset, base_length)?
            }
        }
        Ok(())
    }

    pub fn parse(line: &str) -> CResult<Self> {
        let line = line.trim_end_matches('\n');
        if line == "PLAIN" {
            return Ok(RepHeader::Plain);
        }
        if line == "DELTA" {
            return Ok(RepHeader::SelfDelta);
        }
        if let Some(rest) = line.strip_prefix("DELTA ") {
            let fields: Vec<&str> = rest.split(' ').collect();
            if fields.len() == 3 {
                return Ok(RepHeader::Delta {
                    base_rev: fields[0].parse()?,
                    base_offset: fields[1].parse()?,
                    base_length: fields[2].parse()?,
                });
            }
        }
        Err(Error::Corrupt(format!("malformed representation header '{}'", line)))
    }
}

/// A single directory entry; the serialized value form is `<kind> <id>`.
#[derive(Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeId,
}

impl DirEntry {
    pub fn unparse(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }

    pub fn parse(s: &str) -> CResult<Self> {
        let (kind, id) = s
            .split_once(' ')
            .ok_or_else(|| Error::Parse(format!("malformed directory entry '{}'", s)))?;
        Ok(Self { kind: NodeKind::parse(kind)?, id: NodeId::parse(id)? })
    }
}

/// Renders directory entries into the string map stored as a dir rep.
pub fn unparse_dir_entries(entries: &BTreeMap<String, DirEntry>) -> BTreeMap<String, String> {
    entries.iter().map(|(name, entry)| (name.clone(), entry.unparse())).collect()
}

/// Parses the string map of a dir rep back into directory entries.
pub fn parse_dir_entries(map: &BTreeMap<String, String>) -> CResult<BTreeMap<String, DirEntry>> {
    map.iter().map(|(name, value)| Ok((name.clone(), DirEntry::parse(value)?))).collect()
}

/// The metadata record for a single versioned node at one revision.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRev {
    pub id: NodeId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeId>,
    pub predecessor_count: u64,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// The path at which this node first appeared.
    pub created_path: String,
    pub copyfrom: Option<(Rev, String)>,
    /// Root of the copy this node was created under; filled with the new
    /// revision at final write when absent.
    pub copyroot: Option<(Rev, String)>,
    pub is_fresh_txn_root: bool,
    pub mergeinfo_count: u64,
    pub has_mergeinfo: bool,
}

impl NodeRev {
    pub fn new(id: NodeId, kind: NodeKind, created_path: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: created_path.into(),
            copyfrom: None,
            copyroot: None,
            is_fresh_txn_root: false,
            mergeinfo_count: 0,
            has_mergeinfo: false,
        }
    }

    /// Serializes the record, including the terminating blank line.
    pub fn write_to<W: Write>(&self, w: &mut W) -> CResult<()> {
        write!(w, "id: {}\n", self.id)?;
        write!(w, "type: {}\n", self.kind)?;
        if let Some(pred) = &self.predecessor_id {
            write!(w, "pred: {}\n", pred)?;
        }
        write!(w, "count: {}\n", self.predecessor_count)?;
        if let Some(rep) = &self.data_rep {
            write!(w, "text: {}\n", rep.unparse())?;
        }
        if let Some(rep) = &self.prop_rep {
            write!(w, "props: {}\n", rep.unparse())?;
        }
        write!(w, "cpath: {}\n", self.created_path)?;
        if let Some((rev, path)) = &self.copyfrom {
            write!(w, "copyfrom: {} {}\n", rev, path)?;
        }
        if let Some((rev, path)) = &self.copyroot {
            write!(w, "copyroot: {} {}\n", rev, path)?;
        }
        if self.is_fresh_txn_root {
            w.write_all(b"is-fresh-txn-root: y\n")?;
        }
        if self.has_mergeinfo {
            w.write_all(b"minfo-here: y\n")?;
        }
        if self.mergeinfo_count > 0 {
            write!(w, "minfo-cnt: {}\n", self.mergeinfo_count)?;
        }
        w.write_all(b"\n")?;
        Ok(())
    }

    /// Reads one record, consuming lines up to and including the blank
    /// terminator (or end-of-file).
    pub fn read_from<R: BufRead>(r: &mut R) -> CResult<Self> {
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if r.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| Error::Corrupt(format!("malformed noderev line '{}'", line)))?;
            headers.push((name.to_string(), value.to_string()));
        }
        Self::from_headers(headers)
    }

    fn from_headers(headers: Vec<(String, String)>) -> CResult<Self> {
        let mut id = None;
        let mut kind = None;
        let mut noderev = {
            // Placeholder until the id and type headers are seen.
            let mut map = BTreeMap::new();
            for (name, value) in headers {
                if map.insert(name.clone(), value).is_some() {
                    return Err(Error::Corrupt(format!("duplicate noderev header '{}'", name)));
                }
            }
            map
        };
        if let Some(v) = noderev.remove("id") {
            id = Some(NodeId::parse(&v)?);
        }
        if let Some(v) = noderev.remove("type") {
            kind = Some(NodeKind::parse(&v)?);
        }
        let id = id.ok_or_else(|| Error::Corrupt("noderev missing id header".into()))?;
        let kind = kind.ok_or_else(|| Error::Corrupt("noderev missing type header".into()))?;
        let mut result = NodeRev::new(id, kind, "");
        if let Some(v) = noderev.remove("pred") {
            result.predecessor_id = Some(NodeId::parse(&v)?);
        }
        if let Some(v) = noderev.remove("count") {
            result.predecessor_count = v.parse()?;
        }
        if let Some(v) = noderev.remove("text") {
            result.data_rep = Some(Representation::parse(&v)?);
        }
        if let Some(v) = noderev.remove("props") {
            result.prop_rep = Some(Representation::parse(&v)?);
        }
        if let Some(v) = noderev.remove("cpath") {
            result.created_path = v;
        }
        if let Some(v) = noderev.remove("copyfrom") {
            result.copyfrom = Some(parse_rev_path(&v)?);
        }
        if let Some(v) = noderev.remove("copyroot") {
            result.copyroot = Some(parse_rev_path(&v)?);
        }
        if let Some(v) = noderev.remove("is-fresh-txn-root") {
            result.is_fresh_txn_root = v == "y";
        }
        if let Some(v) = noderev.remove("minfo-here") {
            result.has_mergeinfo = v == "y";
        }
        if let Some(v) = noderev.remove("minfo-cnt") {
            result.mergeinfo_count = v.parse()?;
        }
        if let Some((name, _)) = noderev.into_iter().next() {
            return Err(Error::Corrupt(format!("unknown noderev header '{}'", name)));
        }
        Ok(result)
    }
}

fn parse_rev_path(s: &str) -> CResult<(Rev, String)> {
    let (rev, path) = s
        .split_once(' ')
        .ok_or_else(|| Error::Parse(format!("malformed revision/path pair '{}'", s)))?;
    Ok((rev.parse()?, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sample_rep() -> Representation {
        Representation {
            location: RepLocation::Rev(3),
            offset: 17,
            size: 60,
            expanded_size: 120,
            md5: Some([0xab; 16]),
            sha1: Some([0xcd; 20]),
            uniquifier: Some("3-a/_2".to_string()),
        }
    }

    #[test]
    fn rep_roundtrip() -> CResult<()> {
        let rep = sample_rep();
        assert_eq!(Representation::parse(&rep.unparse())?, rep);

        let mutable = Representation::new_mutable("5-b");
        assert_eq!(mutable.unparse(), "t5-b 0 0 0 - - -");
        assert_eq!(Representation::parse(&mutable.unparse())?, mutable);
        assert!(mutable.is_txn());
        Ok(())
    }

    #[test]
    fn rep_header_roundtrip() -> CResult<()> {
        for header in [
            RepHeader::Plain,
            RepHeader::SelfDelta,
            RepHeader::Delta { base_rev: 4, base_offset: 99, base_length: 1234 },
        ] {
            let mut buf = Vec::new();
            header.write_to(&mut buf)?;
            let line = String::from_utf8(buf)?;
            assert_eq!(RepHeader::parse(&line)?, header);
        }
        Ok(())
    }

    #[test]
    fn noderev_roundtrip() -> CResult<()> {
        let mut noderev =
            NodeRev::new(NodeId::for_txn("_1", "0", "2-c"), NodeKind::File, "/trunk/a b.txt");
        noderev.predecessor_id = Some(NodeId::for_rev("4", "1", 2, 88));
        noderev.predecessor_count = 3;
        noderev.data_rep = Some(sample_rep());
        noderev.prop_rep = Some(Representation::new_mutable("2-c"));
        noderev.copyfrom = Some((1, "/branches/old path".to_string()));
        noderev.copyroot = Some((2, "/trunk".to_string()));
        noderev.is_fresh_txn_root = true;
        noderev.has_mergeinfo = true;
        noderev.mergeinfo_count = 2;

        let mut buf = Vec::new();
        noderev.write_to(&mut buf)?;
        assert_eq!(NodeRev::read_from(&mut Cursor::new(&buf))?, noderev);
        Ok(())
    }

    #[test]
    fn minimal_noderev() -> CResult<()> {
        let noderev = NodeRev::new(NodeId::for_rev("0", "0", 0, 17), NodeKind::Dir, "/");
        let mut buf = Vec::new();
        noderev.write_to(&mut buf)?;
        let parsed = NodeRev::read_from(&mut Cursor::new(&buf))?;
        assert_eq!(parsed, noderev);
        assert_eq!(parsed.predecessor_count, 0);
        Ok(())
    }

    #[test]
    fn dir_entry_roundtrip() -> CResult<()> {
        let entry =
            DirEntry { kind: NodeKind::Dir, id: NodeId::for_rev("2-1", "0-1", 1, 240) };
        assert_eq!(DirEntry::parse(&entry.unparse())?, entry);
        Ok(())
    }

    #[test]
    fn rejects_unknown_header() {
        let text = "id: 0.0.r0/17\ntype: dir\nbogus: 1\n\n";
        assert!(NodeRev::read_from(&mut Cursor::new(text.as_bytes())).is_err());
    }
}
