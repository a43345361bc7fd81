//! Minimal object payload decoding.
//!
//! Full revision walking is a client of this crate; the core only
//! needs enough structure to peel tags, order commits by time and
//! close over a graph when writing a pack.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ObjectKind};

#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    /// Committer timestamp in seconds; what the negotiation queue
    /// orders by.
    pub commit_time: i64,
}

pub fn parse_commit(data: &[u8]) -> Result<CommitInfo> {
    let mut tree = None;
    let mut parents = Vec::new();
    let mut commit_time = 0;

    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            break; // header/message boundary
        }
        if let Some(hex) = line.strip_prefix(b"tree ") {
            tree = Some(ObjectId::from_hex(hex)?);
        } else if let Some(hex) = line.strip_prefix(b"parent ") {
            parents.push(ObjectId::from_hex(hex)?);
        } else if let Some(rest) = line.strip_prefix(b"committer ") {
            commit_time = ident_time(rest)?;
        }
    }

    Ok(CommitInfo {
        tree: tree.ok_or_else(|| Error::corrupt("commit has no tree header"))?,
        parents,
        commit_time,
    })
}

// `name <email> <seconds> <zone>`: the timestamp is the second to
// last whitespace-separated field.
fn ident_time(ident: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(ident)
        .map_err(|_| Error::corrupt("committer line is not UTF-8"))?;
    let mut fields = text.rsplitn(3, ' ');
    let _zone = fields.next();
    fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corrupt("committer line has no timestamp"))
}

#[derive(Clone, Debug)]
pub struct TagInfo {
    pub target: ObjectId,
    pub target_kind: ObjectKind,
}

pub fn parse_tag(data: &[u8]) -> Result<TagInfo> {
    let mut target = None;
    let mut target_kind = None;

    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        if let Some(hex) = line.strip_prefix(b"object ") {
            target = Some(ObjectId::from_hex(hex)?);
        } else if let Some(name) = line.strip_prefix(b"type ") {
            let name = std::str::from_utf8(name)
                .map_err(|_| Error::corrupt("tag type line is not UTF-8"))?;
            target_kind = Some(
                name.parse::<ObjectKind>()
                    .map_err(|bad| Error::corrupt(format!("tag targets unknown type {bad}")))?,
            );
        }
    }

    Ok(TagInfo {
        target: target.ok_or_else(|| Error::corrupt("tag has no object header"))?,
        target_kind: target_kind.ok_or_else(|| Error::corrupt("tag has no type header"))?,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    /// Submodule pointers name commits in another repository.
    pub fn is_gitlink(&self) -> bool {
        self.mode & 0o170000 == 0o160000
    }
}

/// Decode `<octal-mode> <name>\0<20-byte id>` records.
pub fn parse_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt("tree entry has no mode"))?;
        let mode = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .ok_or_else(|| Error::corrupt("tree entry mode is not octal"))?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|&b| b == b'\0')
            .ok_or_else(|| Error::corrupt("tree entry name unterminated"))?;
        let name = rest[..nul].to_vec();
        rest = &rest[nul + 1..];

        if rest.len() < 20 {
            return Err(Error::corrupt("tree entry id truncated"));
        }
        let id = ObjectId::from_bytes(&rest[..20])?;
        rest = &rest[20..];

        entries.push(TreeEntry { mode, name, id });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::hash_bytes;

    fn commit_bytes(tree: &ObjectId, parents: &[ObjectId], time: i64) -> Vec<u8> {
        let mut out = format!("tree {tree}\n");
        for parent in parents {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!(
            "author A U Thor <a@example.com> {time} +0000\n\
             committer A U Thor <a@example.com> {time} +0000\n\n\
             message\n"
        ));
        out.into_bytes()
    }

    #[test]
    fn commit_headers_parse() {
        let tree = hash_bytes(ObjectKind::Tree, b"");
        let parent = hash_bytes(ObjectKind::Commit, b"fake");
        let info = parse_commit(&commit_bytes(&tree, &[parent], 1234567)).unwrap();
        assert_eq!(info.tree, tree);
        assert_eq!(info.parents, vec![parent]);
        assert_eq!(info.commit_time, 1234567);
    }

    #[test]
    fn root_commit_has_no_parents() {
        let tree = hash_bytes(ObjectKind::Tree, b"");
        let info = parse_commit(&commit_bytes(&tree, &[], 9)).unwrap();
        assert!(info.parents.is_empty());
    }

    #[test]
    fn tag_headers_parse() {
        let target = hash_bytes(ObjectKind::Commit, b"fake");
        let data = format!(
            "object {target}\ntype commit\ntag v1.0\n\
             tagger T <t@example.com> 1 +0000\n\nrelease\n"
        );
        let info = parse_tag(data.as_bytes()).unwrap();
        assert_eq!(info.target, target);
        assert_eq!(info.target_kind, ObjectKind::Commit);
    }

    #[test]
    fn tree_entries_parse() {
        let blob = hash_bytes(ObjectKind::Blob, b"x");
        let sub = hash_bytes(ObjectKind::Tree, b"");
        let mut data = Vec::new();
        data.extend_from_slice(b"100644 file\0");
        data.extend_from_slice(blob.as_bytes());
        data.extend_from_slice(b"40000 dir\0");
        data.extend_from_slice(sub.as_bytes());

        let entries = parse_tree(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"file");
        assert!(!entries[0].is_tree());
        assert_eq!(entries[1].id, sub);
        assert!(entries[1].is_tree());
    }

    #[test]
    fn truncated_tree_is_corrupt() {
        assert!(parse_tree(b"100644 file\0shortid").is_err());
    }
}
