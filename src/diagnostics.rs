//! Diagnostics harness (C10): a synthetic `SwarmClient` double plus the
//! scope guard that swaps it into a `CacheOptimizer` for the duration of a
//! test.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::DccError;
use crate::ids::ContentId;
use crate::swarm::{ShareHandle, ShareStats, ShareState, SwarmClient};

/// Everything a test needs to fabricate for one share, without touching the
/// network.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticShareStats {
    pub state: ShareState,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub progress: f64,
    pub connected_peers: u32,
    pub connected_seeds: u32,
}

impl Default for SyntheticShareStats {
    fn default() -> Self {
        SyntheticShareStats {
            state: ShareState::Seeding,
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            progress: 1.0,
            connected_peers: 0,
            connected_seeds: 0,
        }
    }
}

impl From<SyntheticShareStats> for ShareStats {
    fn from(s: SyntheticShareStats) -> Self {
        ShareStats {
            state: s.state,
            uploaded_bytes: s.uploaded_bytes,
            downloaded_bytes: s.downloaded_bytes,
            progress: s.progress,
            connected_peers: s.connected_peers,
            connected_seeds: s.connected_seeds,
        }
    }
}

#[derive(Default)]
struct SyntheticState {
    shares: HashMap<u64, SyntheticShareStats>,
    next_index: u64,
}

/// The test-only `SwarmClient` implementation. Every operation is
/// synchronous bookkeeping over an in-memory map; nothing ever touches a
/// socket.
#[derive(Default)]
pub struct SyntheticSwarmClient {
    state: Mutex<SyntheticState>,
}

impl SyntheticSwarmClient {
    pub fn new() -> Self {
        SyntheticSwarmClient::default()
    }

    /// Register a fake share with the given stats and return its handle.
    pub fn register_synthetic_share(&self, stats: SyntheticShareStats) -> ShareHandle {
        let mut state = self.state.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.shares.insert(index, stats);
        ShareHandle {
            index,
            generation: index,
        }
    }

    pub fn unregister_synthetic_share(&self, handle: ShareHandle) {
        self.state.lock().shares.remove(&handle.index);
    }

    pub fn set_synthetic_stats(&self, handle: ShareHandle, stats: SyntheticShareStats) {
        self.state.lock().shares.insert(handle.index, stats);
    }
}

#[async_trait]
impl SwarmClient for SyntheticSwarmClient {
    async fn seed_local_file(
        &self,
        _content_id: ContentId,
        _descriptor_bytes: Vec<u8>,
        _storage_dir: PathBuf,
    ) -> Result<ShareHandle, DccError> {
        Ok(self.register_synthetic_share(SyntheticShareStats::default()))
    }

    async fn join_swarm_for_download(
        &self,
        _content_id: ContentId,
        _descriptor_bytes: Vec<u8>,
        _storage_dir: PathBuf,
        _cancellation: CancellationToken,
    ) -> Result<ShareHandle, DccError> {
        Ok(self.register_synthetic_share(SyntheticShareStats {
            state: ShareState::Downloading,
            progress: 0.0,
            ..Default::default()
        }))
    }

    async fn unregister_share(&self, handle: ShareHandle) -> Result<(), DccError> {
        self.unregister_synthetic_share(handle);
        Ok(())
    }

    fn stats(&self, handle: ShareHandle) -> Option<ShareStats> {
        self.state
            .lock()
            .shares
            .get(&handle.index)
            .copied()
            .map(Into::into)
    }

    fn all_stats(&self) -> Vec<ShareStats> {
        self.state.lock().shares.values().copied().map(Into::into).collect()
    }

    async fn pause(&self, handle: ShareHandle) -> Result<(), DccError> {
        let mut state = self.state.lock();
        let entry = state
            .shares
            .get_mut(&handle.index)
            .ok_or_else(|| DccError::InvalidArgument {
                message: "no synthetic share for this handle".into(),
            })?;
        entry.state = ShareState::Paused;
        Ok(())
    }

    async fn resume(&self, handle: ShareHandle) -> Result<(), DccError> {
        let mut state = self.state.lock();
        let entry = state
            .shares
            .get_mut(&handle.index)
            .ok_or_else(|| DccError::InvalidArgument {
                message: "no synthetic share for this handle".into(),
            })?;
        entry.state = ShareState::Discovering;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DccError> {
        self.state.lock().shares.clear();
        Ok(())
    }

    fn total_uploaded_bytes(&self) -> u64 {
        self.state.lock().shares.values().map(|s| s.uploaded_bytes).sum()
    }

    fn connected_sources_count(&self) -> u32 {
        self.state
            .lock()
            .shares
            .values()
            .map(|s| s.connected_peers + s.connected_seeds)
            .sum()
    }

    fn active_share_count(&self) -> usize {
        self.state.lock().shares.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_registered_shares_report_combined_stats() {
        let client = SyntheticSwarmClient::new();
        let a = client.register_synthetic_share(SyntheticShareStats {
            uploaded_bytes: 100,
            connected_peers: 1,
            ..Default::default()
        });
        let _b = client.register_synthetic_share(SyntheticShareStats {
            uploaded_bytes: 200,
            connected_peers: 2,
            ..Default::default()
        });

        assert_eq!(client.active_share_count(), 2);
        assert_eq!(client.total_uploaded_bytes(), 300);
        assert_eq!(client.connected_sources_count(), 3);

        client.unregister_synthetic_share(a);
        assert_eq!(client.active_share_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_clears_all_synthetic_shares() {
        let client = SyntheticSwarmClient::new();
        client.register_synthetic_share(SyntheticShareStats::default());
        client.shutdown().await.unwrap();
        assert_eq!(client.active_share_count(), 0);
        assert_eq!(client.total_uploaded_bytes(), 0);
    }
}
