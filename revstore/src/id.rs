//! Node identifiers. The textual form is `<node_id>.<copy_id>.<origin>`
//! where the origin is `t<txn_id>` for a mutable node inside a transaction
//! or `r<rev>/<offset>` for an immutable node stored at a byte offset of a
//! revision file. Node and copy ids freshly allocated inside a transaction
//! are prefixed with `_` and receive their final form at commit time.

use std::fmt::{self, Display};

use crate::error::{CResult, Error};

/// A revision number. Negative values mean "no revision".
pub type Rev = i64;

pub const INVALID_REV: Rev = -1;

/// Where a node revision lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Mutable, inside the named transaction.
    Txn(String),
    /// Immutable, at a byte offset inside a revision file.
    Rev { rev: Rev, offset: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub node_id: String,
    pub copy_id: String,
    pub origin: Origin,
}

impl NodeId {
    pub fn for_txn(node_id: impl Into<String>, copy_id: impl Into<String>, txn_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            origin: Origin::Txn(txn_id.into()),
        }
    }

    pub fn for_rev(node_id: impl Into<String>, copy_id: impl Into<String>, rev: Rev, offset: u64) -> Self {
        Self { node_id: node_id.into(), copy_id: copy_id.into(), origin: Origin::Rev { rev, offset } }
    }

    pub fn is_txn(&self) -> bool {
        matches!(self.origin, Origin::Txn(_))
    }

    pub fn txn_id(&self) -> Option<&str> {
        match &self.origin {
            Origin::Txn(id) => Some(id),
            Origin::Rev { .. } => None,
        }
    }

    /// The revision this id points into, or `INVALID_REV` for txn ids.
    pub fn rev(&self) -> Rev {
        match self.origin {
            Origin::Rev { rev, .. } => rev,
            Origin::Txn(_) => INVALID_REV,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self.origin {
            Origin::Rev { offset, .. } => Some(offset),
            Origin::Txn(_) => None,
        }
    }

    /// True for node/copy ids allocated inside the transaction, which still
    /// need their final form assigned during the final revision write.
    pub fn node_id_is_fresh(&self) -> bool {
        self.node_id.starts_with('_')
    }

    pub fn unparse(&self) -> String {
        match &self.origin {
            Origin::Txn(txn_id) => format!("{}.{}.t{}", self.node_id, self.copy_id, txn_id),
            Origin::Rev { rev, offset } => {
                format!("{}.{}.r{}/{}", self.node_id, self.copy_id, rev, offset)
            }
        }
    }

    pub fn parse(s: &str) -> CResult<Self> {
        let mut parts = s.splitn(3, '.');
        let (node_id, copy_id, origin) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(c), Some(o)) if !n.is_empty() && !c.is_empty() && !o.is_empty() => {
                (n, c, o)
            }
            _ => return Err(Error::Parse(format!("malformed node id '{}'", s))),
        };
        let origin = if let Some(txn_id) = origin.strip_prefix('t').filter(|t| !t.is_empty()) {
            Origin::Txn(txn_id.to_string())
        } else if let Some(rest) = origin.strip_prefix('r') {
            let (rev, offset) = rest
                .split_once('/')
                .ok_or_else(|| Error::Parse(format!("malformed node id '{}'", s)))?;
            Origin::Rev { rev: rev.parse()?, offset: offset.parse()? }
        } else {
            return Err(Error::Parse(format!("malformed node id '{}'", s)));
        };
        Ok(Self { node_id: node_id.to_string(), copy_id: copy_id.to_string(), origin })
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unparse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_txn() -> CResult<()> {
        let id = NodeId::for_txn("_3", "0", "5-b");
        assert_eq!(id.unparse(), "_3.0.t5-b");
        assert_eq!(NodeId::parse("_3.0.t5-b")?, id);
        assert!(id.is_txn());
        assert_eq!(id.txn_id(), Some("5-b"));
        assert_eq!(id.rev(), INVALID_REV);
        assert!(id.node_id_is_fresh());
        Ok(())
    }

    #[test]
    fn roundtrip_rev() -> CResult<()> {
        let id = NodeId::for_rev("3-2", "1-2", 7, 1234);
        assert_eq!(id.unparse(), "3-2.1-2.r7/1234");
        assert_eq!(NodeId::parse("3-2.1-2.r7/1234")?, id);
        assert!(!id.is_txn());
        assert_eq!(id.rev(), 7);
        assert_eq!(id.offset(), Some(1234));
        assert!(!id.node_id_is_fresh());
        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "0", "0.0", "0.0.x5", "0.0.r5", "0.0.r5/x", "0.0.t", "..t1"] {
            assert!(NodeId::parse(s).is_err(), "{:?} should not parse", s);
        }
    }
}
