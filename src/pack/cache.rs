//! Softly-bounded cache of reconstructed delta bases.
//!
//! Keyed by `(pack, data offset)` through a fixed 1024-slot table
//! (slot = low 10 bits of the offset). Trees and blobs that were
//! expensive to reconstruct get reused by neighbouring deltas;
//! commits are never inserted, they are read once and dropped.

use crate::object::ObjectKind;
use crate::pack::PackId;
use bytes::Bytes;
use parking_lot::Mutex;

const TABLE_SIZE: usize = 1024;

struct Slot {
    pack: PackId,
    offset: u64,
    kind: ObjectKind,
    data: Bytes,
    tick: u64,
}

struct Table {
    slots: Vec<Option<Slot>>,
    total_bytes: usize,
    clock: u64,
}

pub struct DeltaBaseCache {
    limit: usize,
    table: Mutex<Table>,
}

impl DeltaBaseCache {
    pub fn new(limit: usize) -> Self {
        let mut slots = Vec::with_capacity(TABLE_SIZE);
        slots.resize_with(TABLE_SIZE, || None);
        Self {
            limit,
            table: Mutex::new(Table {
                slots,
                total_bytes: 0,
                clock: 0,
            }),
        }
    }

    fn slot_of(offset: u64) -> usize {
        (offset as u32 & (TABLE_SIZE as u32 - 1)) as usize
    }

    pub fn get(&self, pack: PackId, offset: u64) -> Option<(ObjectKind, Bytes)> {
        let mut table = self.table.lock();
        table.clock += 1;
        let tick = table.clock;
        let slot = table.slots[Self::slot_of(offset)].as_mut()?;
        if slot.pack != pack || slot.offset != offset {
            return None;
        }
        slot.tick = tick;
        Some((slot.kind, slot.data.clone()))
    }

    pub fn put(&self, pack: PackId, offset: u64, kind: ObjectKind, data: Bytes) {
        if data.len() > self.limit {
            return;
        }
        let mut table = self.table.lock();
        table.clock += 1;
        let tick = table.clock;
        let at = Self::slot_of(offset);
        if let Some(old) = table.slots[at].take() {
            table.total_bytes -= old.data.len();
        }
        table.total_bytes += data.len();
        table.slots[at] = Some(Slot {
            pack,
            offset,
            kind,
            data,
            tick,
        });
        while table.total_bytes > self.limit {
            let victim = table
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.tick)))
                .filter(|&(i, _)| i != at)
                .min_by_key(|&(_, tick)| tick)
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    if let Some(gone) = table.slots[i].take() {
                        table.total_bytes -= gone.data.len();
                    }
                }
                None => break,
            }
        }
    }

    /// Wipe every entry belonging to a pack being closed or tainted.
    pub fn purge(&self, pack: PackId) {
        let mut table = self.table.lock();
        for at in 0..TABLE_SIZE {
            if table.slots[at].as_ref().is_some_and(|s| s.pack == pack) {
                if let Some(gone) = table.slots[at].take() {
                    table.total_bytes -= gone.data.len();
                }
            }
        }
    }

    pub fn resident_bytes(&self) -> usize {
        self.table.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let cache = DeltaBaseCache::new(1 << 20);
        let pack = PackId::next();
        cache.put(pack, 12, ObjectKind::Tree, Bytes::from_static(b"tree bytes"));

        let (kind, data) = cache.get(pack, 12).unwrap();
        assert_eq!(kind, ObjectKind::Tree);
        assert_eq!(&data[..], b"tree bytes");

        assert!(cache.get(pack, 13).is_none());
        assert!(cache.get(PackId::next(), 12).is_none());
    }

    #[test]
    fn colliding_slots_keep_the_newest() {
        let cache = DeltaBaseCache::new(1 << 20);
        let pack = PackId::next();
        // offsets 12 and 12 + 1024 share a slot
        cache.put(pack, 12, ObjectKind::Blob, Bytes::from_static(b"a"));
        cache.put(pack, 12 + 1024, ObjectKind::Blob, Bytes::from_static(b"b"));
        assert!(cache.get(pack, 12).is_none());
        assert!(cache.get(pack, 12 + 1024).is_some());
    }

    #[test]
    fn byte_cap_evicts_least_recently_used() {
        let cache = DeltaBaseCache::new(100);
        let pack = PackId::next();
        cache.put(pack, 1, ObjectKind::Blob, Bytes::from(vec![0u8; 60]));
        cache.put(pack, 2, ObjectKind::Blob, Bytes::from(vec![0u8; 30]));
        cache.get(pack, 1); // offset 1 is now most recently used
        cache.put(pack, 3, ObjectKind::Blob, Bytes::from(vec![0u8; 30]));
        assert!(cache.get(pack, 1).is_some());
        assert!(cache.get(pack, 2).is_none());
        assert!(cache.resident_bytes() <= 100);
    }

    #[test]
    fn oversized_payloads_are_not_cached() {
        let cache = DeltaBaseCache::new(10);
        let pack = PackId::next();
        cache.put(pack, 1, ObjectKind::Blob, Bytes::from(vec![0u8; 64]));
        assert!(cache.get(pack, 1).is_none());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn purge_removes_only_that_pack() {
        let cache = DeltaBaseCache::new(1 << 20);
        let a = PackId::next();
        let b = PackId::next();
        cache.put(a, 1, ObjectKind::Blob, Bytes::from_static(b"a"));
        cache.put(b, 2, ObjectKind::Blob, Bytes::from_static(b"b"));
        cache.purge(a);
        assert!(cache.get(a, 1).is_none());
        assert!(cache.get(b, 2).is_some());
    }
}
