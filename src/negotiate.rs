//! Fetch-side common-ancestor discovery.
//!
//! The initiating peer streams `have` lines in descending
//! commit-time order and the responder acknowledges the commits it
//! shares, so "continue" ACKs monotonically walk the common subgraph
//! inward until a minimal cut is found or the round-trip budget runs
//! out.

use crate::errors::{Error, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::odb::ObjectDatabase;
use crate::pkt::{Packet, PacketLineIn, PacketLineOut};
use crate::progress::{check_cancelled, ProgressMonitor};
use crate::revision;
use std::collections::{BinaryHeap, HashMap};
use std::io::{Read, Write};

/// Locally reachable.
pub const REACHABLE: u8 = 1 << 0;
/// Proven common with the peer.
pub const COMMON: u8 = 1 << 1;
/// Offered by the peer's ref advertisement.
pub const ADVERTISED: u8 = 1 << 2;

/// Capabilities attached to the first want line.
pub const CAPABILITIES: &str =
    "multi_ack thin-pack side-band side-band-64k include-tag ofs-delta no-progress";

/// Stop probing after this many unacknowledged haves.
const MAX_HAVES: usize = 256;
/// Haves per flush batch.
const HAVES_PER_FLUSH: usize = 32;

#[derive(Debug)]
pub struct NegotiationResult {
    /// Commits the peer acknowledged, in acknowledgement order.
    pub common: Vec<ObjectId>,
    /// Wants actually requested (locally-present wants are dropped).
    pub asked: Vec<ObjectId>,
    pub sent_haves: usize,
    /// The peer sent a final ACK rather than a bare NAK.
    pub complete: bool,
}

struct Candidate {
    time: i64,
    id: ObjectId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    // max-heap: newest commit time first
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time).then(self.id.cmp(&other.id))
    }
}

pub struct Negotiator<'db> {
    odb: &'db ObjectDatabase,
    flags: HashMap<ObjectId, u8>,
    queue: BinaryHeap<Candidate>,
}

impl<'db> Negotiator<'db> {
    pub fn new(odb: &'db ObjectDatabase) -> Self {
        Self {
            odb,
            flags: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    /// Seed the candidate queue with a local ref tip. Tags peel to
    /// their commit; trees and blobs carry no time and are skipped.
    pub fn add_local_tip(&mut self, id: ObjectId) -> Result<()> {
        let mut id = id;
        for _ in 0..32 {
            let loader = match self.odb.open_object(&id) {
                Ok(loader) => loader,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            };
            match loader.kind() {
                ObjectKind::Tag => id = revision::parse_tag(loader.cached_bytes())?.target,
                ObjectKind::Commit => {
                    let info = revision::parse_commit(loader.cached_bytes())?;
                    self.push_candidate(id, info.commit_time);
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
        Err(Error::corrupt(format!("tag chain at {id} too deep")))
    }

    fn push_candidate(&mut self, id: ObjectId, time: i64) {
        let flags = self.flags.entry(id).or_insert(0);
        if *flags & REACHABLE != 0 {
            return;
        }
        *flags |= REACHABLE;
        self.queue.push(Candidate { time, id });
    }

    pub fn flags_of(&self, id: &ObjectId) -> u8 {
        self.flags.get(id).copied().unwrap_or(0)
    }

    /// Carry COMMON along parent edges so later candidates skip the
    /// already-proven subgraph.
    fn mark_common(&mut self, id: ObjectId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let flags = self.flags.entry(id).or_insert(0);
            if *flags & COMMON != 0 {
                continue;
            }
            *flags |= COMMON;
            let loader = match self.odb.open_object(&id) {
                Ok(loader) => loader,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            if loader.kind() == ObjectKind::Commit {
                stack.extend(revision::parse_commit(loader.cached_bytes())?.parents);
            }
        }
        Ok(())
    }

    /// Run the want/have exchange. `advertised` is the peer's ref
    /// advertisement; `wants` the tips the caller asked to fetch.
    pub fn negotiate<R: Read, W: Write>(
        &mut self,
        wants: &[ObjectId],
        advertised: &[ObjectId],
        input: &mut PacketLineIn<R>,
        output: &mut PacketLineOut<W>,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<NegotiationResult> {
        for id in advertised {
            *self.flags.entry(*id).or_insert(0) |= ADVERTISED;
        }

        // drop wants the local side already has
        let asked: Vec<ObjectId> = wants
            .iter()
            .copied()
            .filter(|id| !self.odb.has_object(id))
            .collect();
        let mut result = NegotiationResult {
            common: Vec::new(),
            asked: asked.clone(),
            sent_haves: 0,
            complete: false,
        };
        if asked.is_empty() {
            return Ok(result);
        }

        for (i, id) in asked.iter().enumerate() {
            if i == 0 {
                output.write_text(&format!("want {id} {CAPABILITIES}"))?;
            } else {
                output.write_text(&format!("want {id}"))?;
            }
        }
        output.flush()?;

        let mut since_ack = 0usize;
        let mut batched = 0usize;
        let mut satisfied = false;
        while let Some(candidate) = self.queue.pop() {
            check_cancelled(progress)?;
            if self.flags_of(&candidate.id) & COMMON != 0 {
                continue; // proven while it sat in the queue
            }
            output.write_text(&format!("have {}", candidate.id))?;
            result.sent_haves += 1;
            since_ack += 1;
            batched += 1;

            // enqueue parents so probing walks history inward
            if let Ok(loader) = self.odb.open_object(&candidate.id) {
                if loader.kind() == ObjectKind::Commit {
                    for parent in revision::parse_commit(loader.cached_bytes())?.parents {
                        if let Ok(pl) = self.odb.open_object(&parent) {
                            if pl.kind() == ObjectKind::Commit {
                                let time =
                                    revision::parse_commit(pl.cached_bytes())?.commit_time;
                                self.push_candidate(parent, time);
                            }
                        }
                    }
                }
            }

            if batched == HAVES_PER_FLUSH {
                batched = 0;
                output.flush()?;
                let acked_before = result.common.len();
                match self.read_acks(input, &mut result)? {
                    AckState::KeepGoing => {}
                    AckState::Satisfied => {
                        satisfied = true;
                        break;
                    }
                }
                if result.common.len() > acked_before {
                    since_ack = 0;
                } else if since_ack >= MAX_HAVES {
                    break; // bound the round-trip cost
                }
            }
        }

        if batched > 0 && !satisfied {
            output.flush()?;
            match self.read_acks(input, &mut result)? {
                AckState::KeepGoing | AckState::Satisfied => {}
            }
        }

        output.write_text("done")?;
        output.flush()?;

        // final ACK/NAK before the pack follows
        if !satisfied {
            if let Some(packet) = input.read_opt()? {
                self.note_final(&packet, &mut result)?;
            }
        } else {
            result.complete = true;
        }
        Ok(result)
    }

    fn note_final(&mut self, packet: &Packet, result: &mut NegotiationResult) -> Result<()> {
        let Some(text) = packet.text() else {
            return Ok(());
        };
        let line = std::str::from_utf8(text)
            .map_err(|_| Error::Protocol("non-UTF-8 ACK line".into()))?;
        if let Some(rest) = line.strip_prefix("ACK ") {
            let hex = rest.split(' ').next().unwrap_or("");
            let id = ObjectId::from_hex(hex.as_bytes())
                .map_err(|_| Error::Protocol(format!("bad ACK line {line:?}")))?;
            if !result.common.contains(&id) {
                result.common.push(id);
            }
            result.complete = true;
        }
        Ok(())
    }

    fn read_acks<R: Read>(
        &mut self,
        input: &mut PacketLineIn<R>,
        result: &mut NegotiationResult,
    ) -> Result<AckState> {
        loop {
            let Some(packet) = input.read_opt()? else {
                return Ok(AckState::KeepGoing);
            };
            let Some(text) = packet.text() else { continue };
            let line = std::str::from_utf8(text)
                .map_err(|_| Error::Protocol("non-UTF-8 ACK line".into()))?;
            if line == "NAK" {
                return Ok(AckState::KeepGoing);
            }
            let Some(rest) = line.strip_prefix("ACK ") else {
                return Err(Error::Protocol(format!("unexpected response {line:?}")));
            };
            let mut fields = rest.split(' ');
            let hex = fields.next().unwrap_or("");
            let id = ObjectId::from_hex(hex.as_bytes())
                .map_err(|_| Error::Protocol(format!("bad ACK line {line:?}")))?;
            match fields.next() {
                Some("continue") => {
                    // the peer has this commit and wants more probes
                    self.mark_common(id)?;
                    if !result.common.contains(&id) {
                        result.common.push(id);
                    }
                }
                None => {
                    // the peer chose everything it needs
                    if !result.common.contains(&id) {
                        result.common.push(id);
                    }
                    result.complete = true;
                    return Ok(AckState::Satisfied);
                }
                Some(other) => {
                    return Err(Error::Protocol(format!("unknown ACK status {other:?}")));
                }
            }
        }
    }
}

enum AckState {
    KeepGoing,
    Satisfied,
}
