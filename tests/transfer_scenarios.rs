//! Wire-level scenarios: negotiation against a scripted peer, and
//! writer-to-indexer pack transfer between two object stores.

use rusty_git_core::object::{hash_bytes, ObjectId, ObjectKind};
use rusty_git_core::odb::ObjectDatabase;
use rusty_git_core::negotiate::{Negotiator, CAPABILITIES, COMMON, REACHABLE};
use rusty_git_core::pack::indexer::PackIndexer;
use rusty_git_core::pack::writer::PackWriter;
use rusty_git_core::pkt::{Packet, PacketLineIn, PacketLineOut};
use rusty_git_core::progress::NullProgress;
use std::io::Cursor;
use tempfile::TempDir;

fn fresh_db(dir: &TempDir, name: &str) -> ObjectDatabase {
    let objects = dir.path().join(name).join("objects");
    std::fs::create_dir_all(&objects).unwrap();
    ObjectDatabase::open(&objects).unwrap()
}

fn commit_bytes(tree: &ObjectId, parents: &[ObjectId], time: i64) -> Vec<u8> {
    let mut text = format!("tree {tree}\n");
    for parent in parents {
        text.push_str(&format!("parent {parent}\n"));
    }
    text.push_str(&format!(
        "author A U Thor <a@example.com> {time} +0000\n\
         committer A U Thor <a@example.com> {time} +0000\n\ncommit at {time}\n"
    ));
    text.into_bytes()
}

fn tree_bytes(entries: &[(&str, u32, ObjectId)]) -> Vec<u8> {
    let mut sorted: Vec<_> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = Vec::new();
    for (name, mode, id) in sorted {
        out.extend_from_slice(format!("{mode:o} {name}\0").as_bytes());
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Store a small history; returns (root commit, tip commit).
fn seed_history(db: &ObjectDatabase) -> (ObjectId, ObjectId) {
    let blob_a = db.insert_loose(ObjectKind::Blob, b"alpha\n").unwrap();
    let blob_b = db
        .insert_loose(ObjectKind::Blob, b"alpha\nbeta, quite a bit longer this time\n")
        .unwrap();

    let tree1 = db
        .insert_loose(ObjectKind::Tree, &tree_bytes(&[("a.txt", 0o100644, blob_a)]))
        .unwrap();
    let root = db
        .insert_loose(ObjectKind::Commit, &commit_bytes(&tree1, &[], 10))
        .unwrap();

    let tree2 = db
        .insert_loose(
            ObjectKind::Tree,
            &tree_bytes(&[("a.txt", 0o100644, blob_a), ("b.txt", 0o100644, blob_b)]),
        )
        .unwrap();
    let tip = db
        .insert_loose(ObjectKind::Commit, &commit_bytes(&tree2, &[root], 20))
        .unwrap();
    (root, tip)
}

#[test]
fn negotiation_converges_on_the_common_ancestor() {
    let dir = TempDir::new().unwrap();
    let db = fresh_db(&dir, "local");

    // local history: a single commit L1 at t=10
    let tree = db.insert_loose(ObjectKind::Tree, b"").unwrap();
    let l1 = db
        .insert_loose(ObjectKind::Commit, &commit_bytes(&tree, &[], 10))
        .unwrap();

    // the peer advertises R1 (t=12) and R2 (t=8), neither local
    let r1 = hash_bytes(ObjectKind::Commit, b"remote r1");
    let r2 = hash_bytes(ObjectKind::Commit, b"remote r2");

    // scripted responses: batch reply, then the final ACK
    let mut script = Vec::new();
    {
        let mut out = PacketLineOut::new(&mut script);
        out.write_text(&format!("ACK {l1} continue")).unwrap();
        out.write_text("NAK").unwrap();
        out.write_text(&format!("ACK {l1}")).unwrap();
    }

    let mut sent = Vec::new();
    let mut negotiator = Negotiator::new(&db);
    negotiator.add_local_tip(l1).unwrap();
    let result = negotiator
        .negotiate(
            &[r1, r2],
            &[r1, r2],
            &mut PacketLineIn::new(Cursor::new(script)),
            &mut PacketLineOut::new(&mut sent),
            &mut NullProgress,
        )
        .unwrap();

    assert_eq!(result.asked, vec![r1, r2]);
    assert_eq!(result.common, vec![l1]);
    assert_eq!(result.sent_haves, 1);
    assert!(result.complete);
    assert_eq!(negotiator.flags_of(&l1) & COMMON, COMMON);
    assert_eq!(negotiator.flags_of(&l1) & REACHABLE, REACHABLE);

    // the exact wire sequence: wants with capabilities, flush, the
    // have probe, flush, done
    let mut replay = PacketLineIn::new(Cursor::new(sent));
    let first = replay.read().unwrap();
    assert_eq!(
        std::str::from_utf8(first.text().unwrap()).unwrap(),
        format!("want {r1} {CAPABILITIES}")
    );
    assert_eq!(
        std::str::from_utf8(replay.read().unwrap().text().unwrap()).unwrap(),
        format!("want {r2}")
    );
    assert_eq!(replay.read().unwrap(), Packet::Flush);
    assert_eq!(
        std::str::from_utf8(replay.read().unwrap().text().unwrap()).unwrap(),
        format!("have {l1}")
    );
    assert_eq!(replay.read().unwrap(), Packet::Flush);
    assert_eq!(replay.read().unwrap().text().unwrap(), b"done");
    assert_eq!(replay.read().unwrap(), Packet::Flush);
    assert!(replay.read_opt().unwrap().is_none());
}

#[test]
fn locally_present_wants_are_dropped_from_the_ask() {
    let dir = TempDir::new().unwrap();
    let db = fresh_db(&dir, "local");
    let tree = db.insert_loose(ObjectKind::Tree, b"").unwrap();
    let l1 = db
        .insert_loose(ObjectKind::Commit, &commit_bytes(&tree, &[], 10))
        .unwrap();

    let mut sent = Vec::new();
    let mut negotiator = Negotiator::new(&db);
    negotiator.add_local_tip(l1).unwrap();
    let result = negotiator
        .negotiate(
            &[l1],
            &[l1],
            &mut PacketLineIn::new(Cursor::new(Vec::new())),
            &mut PacketLineOut::new(&mut sent),
            &mut NullProgress,
        )
        .unwrap();

    assert!(result.asked.is_empty());
    assert!(sent.is_empty(), "nothing to ask, nothing sent");
}

#[test]
fn written_pack_transfers_history_between_stores() {
    let dir = TempDir::new().unwrap();
    let src = fresh_db(&dir, "src");
    let dst = fresh_db(&dir, "dst");
    let (_, tip) = seed_history(&src);

    let writer = PackWriter::new(&src);
    let list = writer.object_list(&[tip], &[]).unwrap();
    assert_eq!(list.len(), 6, "2 commits + 2 trees + 2 blobs");

    let mut pack = Vec::new();
    let written = writer
        .write_pack(&list, &mut pack, &mut NullProgress)
        .unwrap();
    assert_eq!(written.object_count(), 6);

    let mut indexer = PackIndexer::new(&dst, &pack[..]);
    indexer.set_index_version(2);
    indexer.index(&mut NullProgress).unwrap();
    let pack_file = indexer.rename_and_open_pack().unwrap().unwrap();
    pack_file.verify().unwrap();

    for id in list.ids() {
        let original = src.open_object(id).unwrap();
        let copied = dst.open_object(id).unwrap();
        assert_eq!(original.kind(), copied.kind());
        assert_eq!(original.cached_bytes(), copied.cached_bytes());
    }
}

#[test]
fn incremental_pack_stops_at_haves() {
    let dir = TempDir::new().unwrap();
    let src = fresh_db(&dir, "src");
    let (root, tip) = seed_history(&src);

    let writer = PackWriter::new(&src);
    let list = writer.object_list(&[tip], &[root]).unwrap();

    // only the tip commit, its tree and the new blob remain
    assert_eq!(list.len(), 3);
    assert!(list.ids().any(|id| *id == tip));
    assert!(!list.ids().any(|id| *id == root));
}

#[test]
fn thin_pack_round_trip_repairs_at_the_receiver() {
    let dir = TempDir::new().unwrap();
    let src = fresh_db(&dir, "src");
    let dst = fresh_db(&dir, "dst");
    let (root, tip) = seed_history(&src);

    // the receiver already has the root commit's objects
    {
        let writer = PackWriter::new(&src);
        let list = writer.object_list(&[root], &[]).unwrap();
        let mut pack = Vec::new();
        writer.write_pack(&list, &mut pack, &mut NullProgress).unwrap();
        let mut indexer = PackIndexer::new(&dst, &pack[..]);
        indexer.index(&mut NullProgress).unwrap();
        indexer.rename_and_open_pack().unwrap().unwrap();
    }

    let mut writer = PackWriter::new(&src);
    writer.set_thin(true);
    let list = writer.object_list(&[tip], &[root]).unwrap();
    let mut pack = Vec::new();
    writer.write_pack(&list, &mut pack, &mut NullProgress).unwrap();

    let mut indexer = PackIndexer::new(&dst, &pack[..]);
    indexer.set_fix_thin(true);
    indexer.index(&mut NullProgress).unwrap();
    indexer.rename_and_open_pack().unwrap().unwrap();

    let original = src.open_object(&tip).unwrap();
    let copied = dst.open_object(&tip).unwrap();
    assert_eq!(original.cached_bytes(), copied.cached_bytes());
}
