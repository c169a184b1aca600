//! Node and node-revision identifiers
//!
//! An ID is a sequence of numbers. Even-length IDs name a node revision:
//! `n.v` is revision `v` of node `n`, and `n.v.b.w` is revision `w` on branch
//! `b` sprouted from `n.v`. Odd-length IDs name a line of history (a node or
//! a branch) rather than one version of it.

use crate::error::{FsError, Result};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(Vec<u64>);

impl Id {
    /// Build an ID from its components
    pub fn new(components: Vec<u64>) -> Self {
        Self(components)
    }

    /// The ID of the root directory created with a new filesystem
    pub fn root() -> Self {
        Self(vec![0, 0])
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn node_number(&self) -> u64 {
        self.0.first().copied().unwrap_or_default()
    }

    /// Whether this names a single node revision (even component count)
    pub fn is_node_revision(&self) -> bool {
        !self.0.is_empty() && self.0.len() & 1 == 0
    }

    /// Fail with `NotNodeRevisionId` unless this is a node-revision ID
    pub fn require_node_revision(&self) -> Result<&Self> {
        if self.is_node_revision() {
            Ok(self)
        } else {
            Err(FsError::NotNodeRevisionId(self.to_string()))
        }
    }

    /// Parse the dotted textual form
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let text = std::str::from_utf8(data).ok()?;
        let mut components = Vec::new();
        for part in text.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            components.push(part.parse().ok()?);
        }
        Some(Self(components))
    }

    /// Parse a node-revision ID, rejecting odd-length IDs
    pub fn parse_node_revision(data: &[u8]) -> Result<Self> {
        let id = Self::parse(data)
            .ok_or_else(|| FsError::NotNodeRevisionId(String::from_utf8_lossy(data).into_owned()))?;
        id.require_node_revision()?;
        Ok(id)
    }

    /// Order-preserving storage key: 8 big-endian bytes per component
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.0.len() * 8);
        for c in &self.0 {
            key.extend_from_slice(&c.to_be_bytes());
        }
        key
    }

    /// Inverse of [`Id::to_key`]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.is_empty() || key.len() % 8 != 0 {
            return None;
        }
        let components = key
            .chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                u64::from_be_bytes(buf)
            })
            .collect();
        Some(Self(components))
    }

    /// `n.v` becomes `n.(v+1)`
    pub fn next_in_line(&self) -> Result<Self> {
        self.require_node_revision()?;
        let mut next = self.0.clone();
        if let Some(last) = next.last_mut() {
            *last += 1;
        }
        Ok(Self(next))
    }

    /// First revision on branch `branch` off this node revision
    pub fn branch(&self, branch: u64) -> Result<Self> {
        self.require_node_revision()?;
        let mut id = self.0.clone();
        id.push(branch);
        id.push(1);
        Ok(Self(id))
    }

    /// Same-lineage test: both IDs share the node number
    pub fn same_node(&self, other: &Id) -> bool {
        self.node_number() == other.node_number()
    }

    /// Whether `self` is an ancestor of `other` in its lineage.
    ///
    /// `a` precedes `b` when, at the first component where they differ
    /// (checked pairwise), `a` has the lower revision on the same branch and
    /// `a` ends there, or `b` extends `a` by branching.
    pub fn is_ancestor(&self, other: &Id) -> bool {
        if !self.is_node_revision() || !other.is_node_revision() || self == other {
            return false;
        }
        if self.len() > other.len() {
            return false;
        }
        let a = &self.0;
        let b = &other.0;
        let mut i = 0;
        while i < a.len() {
            // The branch/node component must match.
            if a[i] != b[i] {
                return false;
            }
            let (ra, rb) = (a[i + 1], b[i + 1]);
            if i + 2 == a.len() {
                return ra < rb || (ra == rb && b.len() > a.len());
            }
            if ra != rb {
                return false;
            }
            i += 2;
        }
        false
    }

    /// Best-effort predecessor in the numbering scheme: `n.v` → `n.(v-1)`,
    /// `…b.1` → `…` (back to the branch point). `None` for first revisions.
    pub fn predecessor_hint(&self) -> Option<Self> {
        if !self.is_node_revision() {
            return None;
        }
        let mut id = self.0.clone();
        let last = *id.last()?;
        if last > 1 {
            *id.last_mut()? -= 1;
            return Some(Self(id));
        }
        if id.len() > 2 {
            id.truncate(id.len() - 2);
            return Some(Self(id));
        }
        None
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}
