//! Path change records: the append-only `changes` log written during a
//! transaction and the folding pass that collapses it into one canonical
//! change per path for the final revision file.
//!
//! A record is two lines. The first is
//! `<node_rev_id> <change_kind> <node_kind> <text_mod> <prop_mod> <path>`
//! (absent ids and kinds render as `-`); the second carries
//! `<copyfrom_rev> <copyfrom_path>` or stays empty. The final changes
//! block in a revision file is the folded map followed by one empty
//! record line as terminator.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use crate::error::{CResult, Error};
use crate::id::{NodeId, Rev};
use crate::noderev::NodeKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
    /// Undo any accumulated change for the path.
    Reset,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Replace => "replace",
            ChangeKind::Modify => "modify",
            ChangeKind::Reset => "reset",
        }
    }

    pub fn parse(s: &str) -> CResult<Self> {
        match s {
            "add" => Ok(ChangeKind::Add),
            "delete" => Ok(ChangeKind::Delete),
            "replace" => Ok(ChangeKind::Replace),
            "modify" => Ok(ChangeKind::Modify),
            "reset" => Ok(ChangeKind::Reset),
            _ => Err(Error::Parse(format!("unknown change kind '{}'", s))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    pub node_rev_id: Option<NodeId>,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub node_kind: Option<NodeKind>,
    pub copyfrom: Option<(Rev, String)>,
}

impl Change {
    pub fn write_to<W: Write>(&self, w: &mut W) -> CResult<()> {
        write!(
            w,
            "{} {} {} {} {} {}\n",
            self.node_rev_id.as_ref().map_or_else(|| "-".to_string(), NodeId::unparse),
            self.kind.as_str(),
            self.node_kind.map_or("-", |k| k.as_str()),
            self.text_mod,
            self.prop_mod,
            self.path,
        )?;
        match &self.copyfrom {
            Some((rev, path)) => write!(w, "{} {}\n", rev, path)?,
            None => w.write_all(b"\n")?,
        }
        Ok(())
    }

    fn parse_record(line: &str, copyfrom_line: &str) -> CResult<Self> {
        let fields: Vec<&str> = line.splitn(6, ' ').collect();
        if fields.len() != 6 {
            return Err(Error::Corrupt(format!("malformed change record '{}'", line)));
        }
        let node_rev_id = match fields[0] {
            "-" => None,
            id => Some(NodeId::parse(id)?),
        };
        let node_kind = match fields[2] {
            "-" => None,
            kind => Some(NodeKind::parse(kind)?),
        };
        let copyfrom = if copyfrom_line.is_empty() {
            None
        } else {
            let (rev, path) = copyfrom_line
                .split_once(' ')
                .ok_or_else(|| Error::Corrupt(format!("malformed copyfrom '{}'", copyfrom_line)))?;
            Some((rev.parse::<Rev>()?, path.to_string()))
        };
        Ok(Self {
            path: fields[5].to_string(),
            kind: ChangeKind::parse(fields[1])?,
            node_rev_id,
            text_mod: parse_bool(fields[3])?,
            prop_mod: parse_bool(fields[4])?,
            node_kind,
            copyfrom,
        })
    }
}

fn parse_bool(s: &str) -> CResult<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Corrupt(format!("malformed change flag '{}'", s))),
    }
}

/// Reads change records in write order until end-of-file or, at a record
/// boundary, an empty line (the terminator of a final changes block).
pub fn read_changes<R: BufRead>(r: &mut R) -> CResult<Vec<Change>> {
    let mut changes = Vec::new();
    loop {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Ok(changes);
        }
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            return Ok(changes);
        }
        let mut copyfrom_line = String::new();
        if r.read_line(&mut copyfrom_line)? == 0 {
            return Err(Error::Corrupt("change record missing copyfrom line".into()));
        }
        changes.push(Change::parse_record(line, copyfrom_line.trim_end_matches('\n'))?);
    }
}

/// Writes a folded change map as a final changes block, terminator line
/// included.
pub fn write_changes<W: Write>(w: &mut W, changes: &BTreeMap<String, Change>) -> CResult<()> {
    for change in changes.values() {
        change.write_to(w)?;
    }
    w.write_all(b"\n")?;
    Ok(())
}

/// True if PATH is a strict child of PARENT ("" and "/" both denote the
/// root; paths are not assumed to be normalized beyond that).
pub fn is_child(parent: &str, path: &str) -> bool {
    if path == parent {
        return false;
    }
    match parent {
        "" | "/" => !path.is_empty() && path != "/",
        _ => {
            let parent = parent.trim_end_matches('/');
            path.len() > parent.len() + 1
                && path.starts_with(parent)
                && path.as_bytes()[parent.len()] == b'/'
        }
    }
}

/// Merges the raw change log into a canonical per-path map. Folding is a
/// pure function of the record order.
pub fn fold_changes(changes: &[Change]) -> CResult<BTreeMap<String, Change>> {
    let mut folded: BTreeMap<String, Change> = BTreeMap::new();
    for change in changes {
        fold_change(&mut folded, change)?;

        // A deletion or replacement invalidates everything accumulated so
        // far underneath the path. This inner sweep is quadratic in the
        // number of changed paths and must stay a semantic of folding, not
        // an optimization.
        if matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) {
            folded.retain(|path, _| !is_child(&change.path, path));
        }
    }
    Ok(folded)
}

fn fold_change(folded: &mut BTreeMap<String, Change>, change: &Change) -> CResult<()> {
    let mut old = match folded.remove(&change.path) {
        Some(old) => old,
        None => {
            folded.insert(change.path.clone(), change.clone());
            return Ok(());
        }
    };

    if change.node_rev_id.is_none() && change.kind != ChangeKind::Reset {
        return Err(Error::Corrupt("missing required node revision id".into()));
    }
    if change.node_rev_id.is_some()
        && change.node_rev_id != old.node_rev_id
        && old.kind != ChangeKind::Delete
    {
        return Err(Error::Corrupt(
            "invalid change ordering: new node revision id without delete".into(),
        ));
    }
    if old.kind == ChangeKind::Delete
        && !matches!(change.kind, ChangeKind::Replace | ChangeKind::Reset | ChangeKind::Add)
    {
        return Err(Error::Corrupt(
            "invalid change ordering: non-add change on deleted path".into(),
        ));
    }
    if change.kind == ChangeKind::Add
        && !matches!(old.kind, ChangeKind::Delete | ChangeKind::Reset)
    {
        return Err(Error::Corrupt(
            "invalid change ordering: add change on preexisting path".into(),
        ));
    }

    match change.kind {
        ChangeKind::Reset => {
            // The entry stays removed.
            return Ok(());
        }
        ChangeKind::Delete => {
            if old.kind == ChangeKind::Add {
                // The path was introduced by this transaction; deleting it
                // makes the whole thing a no-op.
                return Ok(());
            }
            old.kind = ChangeKind::Delete;
            old.text_mod = change.text_mod;
            old.prop_mod = change.prop_mod;
            old.copyfrom = None;
        }
        ChangeKind::Add | ChangeKind::Replace => {
            // An add here must follow a delete, so it becomes a replace.
            old.kind = ChangeKind::Replace;
            old.node_rev_id = change.node_rev_id.clone();
            old.text_mod = change.text_mod;
            old.prop_mod = change.prop_mod;
            old.copyfrom = change.copyfrom.clone();
        }
        ChangeKind::Modify => {
            if change.text_mod {
                old.text_mod = true;
            }
            if change.prop_mod {
                old.prop_mod = true;
            }
        }
    }
    folded.insert(change.path.clone(), old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn change(path: &str, kind: ChangeKind) -> Change {
        let node_rev_id = match kind {
            ChangeKind::Reset => None,
            _ => Some(NodeId::for_txn("_1", "0", "1-a")),
        };
        Change {
            path: path.to_string(),
            kind,
            node_rev_id,
            text_mod: kind != ChangeKind::Delete,
            prop_mod: false,
            node_kind: Some(NodeKind::File),
            copyfrom: None,
        }
    }

    #[test]
    fn record_roundtrip() -> CResult<()> {
        let mut rec = change("/a dir/with spaces", ChangeKind::Add);
        rec.copyfrom = Some((3, "/old path".to_string()));
        let mut buf = Vec::new();
        rec.write_to(&mut buf)?;
        change("/b", ChangeKind::Delete).write_to(&mut buf)?;

        let parsed = read_changes(&mut Cursor::new(&buf))?;
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], rec);
        assert_eq!(parsed[1].path, "/b");
        Ok(())
    }

    #[test]
    fn terminator_stops_reading() -> CResult<()> {
        let mut buf = Vec::new();
        let mut folded = BTreeMap::new();
        folded.insert("/a".to_string(), change("/a", ChangeKind::Add));
        write_changes(&mut buf, &folded)?;
        buf.extend_from_slice(b"trailing garbage that must not be read\n");

        let parsed = read_changes(&mut Cursor::new(&buf))?;
        assert_eq!(parsed.len(), 1);
        Ok(())
    }

    #[test]
    fn add_then_delete_vanishes() -> CResult<()> {
        let log =
            vec![change("/x", ChangeKind::Add), change("/x", ChangeKind::Modify), change("/x", ChangeKind::Delete)];
        assert!(fold_changes(&log)?.is_empty());
        Ok(())
    }

    #[test]
    fn delete_collapses() -> CResult<()> {
        let log = vec![change("/x", ChangeKind::Modify), change("/x", ChangeKind::Delete)];
        let folded = fold_changes(&log)?;
        assert_eq!(folded["/x"].kind, ChangeKind::Delete);
        assert_eq!(folded["/x"].copyfrom, None);
        Ok(())
    }

    #[test]
    fn add_after_delete_becomes_replace() -> CResult<()> {
        let mut re_add = change("/x", ChangeKind::Add);
        re_add.node_rev_id = Some(NodeId::for_txn("_2", "0", "1-a"));
        let log = vec![change("/x", ChangeKind::Modify), change("/x", ChangeKind::Delete), re_add];
        let folded = fold_changes(&log)?;
        assert_eq!(folded["/x"].kind, ChangeKind::Replace);
        Ok(())
    }

    #[test]
    fn reset_removes_entry() -> CResult<()> {
        let log = vec![change("/x", ChangeKind::Add), change("/x", ChangeKind::Reset)];
        assert!(fold_changes(&log)?.is_empty());
        Ok(())
    }

    #[test]
    fn delete_drops_children() -> CResult<()> {
        let log = vec![
            change("/d/a", ChangeKind::Modify),
            change("/d/b/c", ChangeKind::Add),
            change("/e", ChangeKind::Modify),
            change("/d", ChangeKind::Delete),
        ];
        let folded = fold_changes(&log)?;
        assert_eq!(folded.keys().collect::<Vec<_>>(), vec!["/d", "/e"]);
        Ok(())
    }

    #[test]
    fn modify_ors_mod_bits() -> CResult<()> {
        let mut text_only = change("/x", ChangeKind::Modify);
        text_only.text_mod = true;
        text_only.prop_mod = false;
        let mut prop_only = change("/x", ChangeKind::Modify);
        prop_only.text_mod = false;
        prop_only.prop_mod = true;
        let folded = fold_changes(&[text_only, prop_only])?;
        assert!(folded["/x"].text_mod);
        assert!(folded["/x"].prop_mod);
        Ok(())
    }

    #[test]
    fn fold_is_idempotent() -> CResult<()> {
        let log = vec![
            change("/a", ChangeKind::Add),
            change("/a", ChangeKind::Modify),
            change("/b", ChangeKind::Delete),
        ];
        let once = fold_changes(&log)?;
        let again = fold_changes(&once.values().cloned().collect::<Vec<_>>())?;
        assert_eq!(once, again);
        Ok(())
    }

    #[test]
    fn ordering_violations_are_corrupt() {
        // Null id outside reset.
        let mut anon = change("/x", ChangeKind::Modify);
        anon.node_rev_id = None;
        assert!(fold_changes(&[change("/x", ChangeKind::Add), anon]).is_err());

        // New id without an intervening delete.
        let mut other = change("/x", ChangeKind::Modify);
        other.node_rev_id = Some(NodeId::for_txn("_9", "0", "1-a"));
        assert!(fold_changes(&[change("/x", ChangeKind::Add), other]).is_err());

        // Modify on a deleted path.
        assert!(fold_changes(&[
            change("/x", ChangeKind::Modify),
            change("/x", ChangeKind::Delete),
            change("/x", ChangeKind::Modify),
        ])
        .is_err());

        // Add on a preexisting path.
        assert!(
            fold_changes(&[change("/x", ChangeKind::Modify), change("/x", ChangeKind::Add)])
                .is_err()
        );
    }

    #[test]
    fn child_relation() {
        assert!(is_child("/", "/a"));
        assert!(is_child("", "/a"));
        assert!(is_child("/a", "/a/b"));
        assert!(is_child("/a/", "/a/b"));
        assert!(!is_child("/a", "/a"));
        assert!(!is_child("/a", "/ab"));
        assert!(!is_child("/a/b", "/a"));
        assert!(!is_child("/", "/"));
    }
}
