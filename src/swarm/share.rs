//! Arena of share managers, addressed by index handles rather than owning
//! references back into the engine (design note §9: replace cyclic
//! manager<->engine references with arena + index handles).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::ids::ContentId;
use crate::swarm::state::ShareState;

/// Opaque identity for a registered share. `generation` guards against a
/// stale handle from a since-removed slot matching a newly inserted one at
/// the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareHandle {
    pub(crate) index: u64,
    pub(crate) generation: u64,
}

/// Snapshot of one share's progress, returned by `SwarmClient::stats`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareStats {
    pub state: ShareState,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub progress: f64,
    pub connected_peers: u32,
    pub connected_seeds: u32,
}

pub(crate) struct ShareManager {
    pub generation: u64,
    pub content_id: ContentId,
    pub storage_dir: PathBuf,
    pub state: ShareState,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub connected_peers: u32,
    pub connected_seeds: u32,
    pub peer_mismatch_counts: HashMap<SocketAddr, u32>,
    pub untrustworthy_peers: std::collections::HashSet<SocketAddr>,
}

impl ShareManager {
    pub fn new(content_id: ContentId, storage_dir: PathBuf, generation: u64) -> Self {
        ShareManager {
            generation,
            content_id,
            storage_dir,
            state: ShareState::Initializing,
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            connected_peers: 0,
            connected_seeds: 0,
            peer_mismatch_counts: HashMap::new(),
            untrustworthy_peers: std::collections::HashSet::new(),
        }
    }

    pub fn stats(&self) -> ShareStats {
        let progress = if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0)
        };
        ShareStats {
            state: self.state,
            uploaded_bytes: self.uploaded_bytes,
            downloaded_bytes: self.downloaded_bytes,
            progress,
            connected_peers: self.connected_peers,
            connected_seeds: self.connected_seeds,
        }
    }

    /// Record a piece-level mismatch from `peer`. After the third mismatch
    /// from the same peer, it is disconnected and marked untrustworthy for
    /// this share (spec §4.8).
    pub fn record_piece_mismatch(&mut self, peer: SocketAddr) -> bool {
        let count = self.peer_mismatch_counts.entry(peer).or_insert(0);
        *count += 1;
        if *count >= 3 {
            self.untrustworthy_peers.insert(peer);
            true
        } else {
            false
        }
    }
}

/// Slab-style arena: `slots[i]` is `None` once removed, so indices are
/// stable for the engine's lifetime and a `ShareHandle`'s generation check
/// rejects use-after-remove.
#[derive(Default)]
pub(crate) struct ShareArena {
    slots: Vec<Option<ShareManager>>,
    next_generation: u64,
}

impl ShareArena {
    pub fn insert(&mut self, content_id: ContentId, storage_dir: PathBuf) -> ShareHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let manager = ShareManager::new(content_id, storage_dir, generation);

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(manager);
                return ShareHandle {
                    index: index as u64,
                    generation,
                };
            }
        }
        self.slots.push(Some(manager));
        ShareHandle {
            index: (self.slots.len() - 1) as u64,
            generation,
        }
    }

    pub fn get(&self, handle: ShareHandle) -> Option<&ShareManager> {
        let slot = self.slots.get(handle.index as usize)?.as_ref()?;
        (slot.generation == handle.generation).then_some(slot)
    }

    pub fn get_mut(&mut self, handle: ShareHandle) -> Option<&mut ShareManager> {
        let slot = self.slots.get_mut(handle.index as usize)?.as_mut()?;
        (slot.generation == handle.generation).then_some(slot)
    }

    pub fn remove(&mut self, handle: ShareHandle) -> Option<ShareManager> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.as_ref().map(|s| s.generation) == Some(handle.generation) {
            slot.take()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShareHandle, &ShareManager)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|manager| {
                (
                    ShareHandle {
                        index: index as u64,
                        generation: manager.generation,
                    },
                    manager,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut arena = ShareArena::default();
        let id = ContentId::new_unchecked("a".repeat(40));
        let first = arena.insert(id.clone(), PathBuf::from("/tmp/a"));
        arena.remove(first);
        let second = arena.insert(id, PathBuf::from("/tmp/b"));

        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
    }

    #[test]
    fn three_mismatches_mark_peer_untrustworthy() {
        let mut manager = ShareManager::new(
            ContentId::new_unchecked("b".repeat(40)),
            PathBuf::from("/tmp"),
            0,
        );
        let peer: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(!manager.record_piece_mismatch(peer));
        assert!(!manager.record_piece_mismatch(peer));
        assert!(manager.record_piece_mismatch(peer));
        assert!(manager.untrustworthy_peers.contains(&peer));
    }
}
