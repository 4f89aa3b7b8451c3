//! Resource registry (C5): the dual-keyed (`MetadataHash`/`ContentId`)
//! metadata store, single-writer/many-reader via `parking_lot::RwLock`.

pub mod metadata;

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::error::DccError;
use crate::ids::{ContentHashSha256, ContentId, MetadataHash};
use metadata::{merge_files, normalize_filename, Files, OrderedMap};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Monotonic corroboration level for a `MetadataHash -> ContentId` mapping.
/// Ordering matters: `TrustLevel` comparisons (`max`, `>=`) rely on the
/// derive below placing `Verified` above `ObservedOnce` above `Unverified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum TrustLevel {
    Unverified,
    ObservedOnce,
    Verified,
}

/// Which hash currently indexes this record: `MetadataHash` pre-download,
/// `ContentId` post-download. See invariant (b) in spec §3: this is a
/// one-way edge once set to `ContentId`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContentKey {
    Metadata(MetadataHash),
    Content(ContentId),
}

/// What a provider told us about a resource before any bytes arrived.
#[derive(Debug, Clone, Default)]
pub struct ProviderRecord {
    pub primary_url: String,
    pub advertised_size: Option<u64>,
    pub handler_metadata: OrderedMap,
    pub files: Files,
}

/// Public view of one registry record (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceMetadata {
    pub content_key: ContentKey,
    pub content_id: Option<ContentId>,
    pub content_hash_sha256: Option<ContentHashSha256>,
    pub metadata_hash: MetadataHash,
    pub primary_url: String,
    pub file_size: Option<u64>,
    pub piece_length: Option<u64>,
    pub piece_hashes_hex: Option<String>,
    pub handler_metadata: OrderedMap,
    pub files: Files,
    pub first_seen_unix: u64,
    pub last_verified_unix: u64,
    pub schema_version: u32,
    pub trust_level: TrustLevel,
    /// Set by the swarm engine while a `ShareHandle` referencing this
    /// record is alive; `evict_lru` never drops a pinned record. Not part
    /// of the wire spec's field list, but required to honor "drops records
    /// whose ShareHandles are idle" (spec §4.5).
    pub pinned: bool,
}

struct Record {
    public: ResourceMetadata,
    corroborating_sources: BTreeSet<String>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<u64, Record>,
    by_metadata_hash: HashMap<MetadataHash, u64>,
    by_content_id: HashMap<ContentId, u64>,
    next_id: u64,
}

/// Policy hook for LRU eviction, left open per Open Question #1: the
/// source enforces only a size cap, so whether `Verified` records should be
/// immune to eviction is undecided upstream. We default to "no special
/// protection" (documented in DESIGN.md) but expose the knob so callers can
/// opt into protecting corroborated records without a registry API change.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy {
    pub protect_verified: bool,
}

pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            state: RwLock::new(RegistryState::default()),
        }
    }

    #[instrument(skip(self, provider_record))]
    pub fn upsert_by_metadata(
        &self,
        metadata_hash: MetadataHash,
        provider_record: ProviderRecord,
    ) -> ResourceMetadata {
        let now = now_unix();
        let mut state = self.state.write();

        if let Some(&id) = state.by_metadata_hash.get(&metadata_hash) {
            let record = state.records.get_mut(&id).expect("index points at live record");
            record.public.primary_url = provider_record.primary_url;
            if provider_record.advertised_size.is_some() {
                record.public.file_size = provider_record.advertised_size;
            }
            record.public.handler_metadata = provider_record.handler_metadata;
            record.public.files = merge_files(&record.public.files, &provider_record.files);
            record.public.last_verified_unix = now;
            debug!(metadata_hash = %metadata_hash, "updated existing registry record");
            return record.public.clone();
        }

        let id = state.next_id;
        state.next_id += 1;
        let public = ResourceMetadata {
            content_key: ContentKey::Metadata(metadata_hash.clone()),
            content_id: None,
            content_hash_sha256: None,
            metadata_hash: metadata_hash.clone(),
            primary_url: provider_record.primary_url,
            file_size: provider_record.advertised_size,
            piece_length: None,
            piece_hashes_hex: None,
            handler_metadata: provider_record.handler_metadata,
            files: provider_record.files,
            first_seen_unix: now,
            last_verified_unix: now,
            schema_version: CURRENT_SCHEMA_VERSION,
            trust_level: TrustLevel::Unverified,
            pinned: false,
        };
        state.records.insert(
            id,
            Record {
                public: public.clone(),
                corroborating_sources: BTreeSet::new(),
            },
        );
        state.by_metadata_hash.insert(metadata_hash, id);
        debug!(record_id = id, "created new registry record");
        public
    }

    /// Atomically rekey a record from `MetadataHash` to `ContentId`. If a
    /// record already exists at `content_id` (two providers independently
    /// converged on the same bytes), merge into it rather than overwrite.
    #[instrument(skip(self))]
    pub fn upgrade_to_content_id(
        &self,
        metadata_hash: &MetadataHash,
        content_id: ContentId,
        content_sha256: ContentHashSha256,
    ) -> Result<ResourceMetadata, DccError> {
        let mut state = self.state.write();
        let source_id = *state
            .by_metadata_hash
            .get(metadata_hash)
            .ok_or_else(|| DccError::InvalidArgument {
                message: format!("no registry record for metadata hash {metadata_hash}"),
            })?;

        if let Some(&target_id) = state.by_content_id.get(&content_id) {
            if target_id != source_id {
                merge_records(&mut state, source_id, target_id);
                let target = &mut state.records.get_mut(&target_id).unwrap().public;
                target.content_id = Some(content_id.clone());
                target.content_hash_sha256 = Some(content_sha256);
                target.content_key = ContentKey::Content(content_id.clone());
                state.by_metadata_hash.insert(metadata_hash.clone(), target_id);
                let merged = state.records[&target_id].public.clone();
                return Ok(merged);
            }
        }

        state.by_content_id.insert(content_id.clone(), source_id);
        let record = state.records.get_mut(&source_id).expect("live record");
        record.public.content_id = Some(content_id.clone());
        record.public.content_hash_sha256 = Some(content_sha256);
        record.public.content_key = ContentKey::Content(content_id);
        Ok(record.public.clone())
    }

    pub fn lookup_by_content_id(&self, content_id: &ContentId) -> Option<ResourceMetadata> {
        let state = self.state.read();
        let id = *state.by_content_id.get(content_id)?;
        state.records.get(&id).map(|r| r.public.clone())
    }

    pub fn lookup_by_metadata_hash(&self, metadata_hash: &MetadataHash) -> Option<ResourceMetadata> {
        let state = self.state.read();
        let id = *state.by_metadata_hash.get(metadata_hash)?;
        state.records.get(&id).map(|r| r.public.clone())
    }

    /// Try `ContentId` first, then `MetadataHash`, matching either lookup
    /// key the facade might be handed.
    pub fn lookup(&self, content_id: Option<&ContentId>, metadata_hash: Option<&MetadataHash>) -> Option<ResourceMetadata> {
        if let Some(id) = content_id {
            if let Some(found) = self.lookup_by_content_id(id) {
                return Some(found);
            }
        }
        metadata_hash.and_then(|h| self.lookup_by_metadata_hash(h))
    }

    /// Record that `source_tag` corroborates the `metadata_hash ->
    /// content_id` mapping. Any non-equal string counts as a distinct
    /// source (Open Question #3: the source treats all sources as equally
    /// weighted; we keep that simpler reading rather than guess at a
    /// trusted/untrusted split that was never specified).
    #[instrument(skip(self))]
    pub fn observe_mapping(
        &self,
        metadata_hash: &MetadataHash,
        content_id: &ContentId,
        source_tag: &str,
    ) -> Result<ResourceMetadata, DccError> {
        let mut state = self.state.write();
        let id = state
            .by_content_id
            .get(content_id)
            .copied()
            .or_else(|| state.by_metadata_hash.get(metadata_hash).copied())
            .ok_or_else(|| DccError::InvalidArgument {
                message: "no registry record for this mapping".into(),
            })?;

        let record = state.records.get_mut(&id).expect("live record");
        record.corroborating_sources.insert(source_tag.to_string());
        let distinct_sources = record.corroborating_sources.len();
        let computed = match distinct_sources {
            0 => TrustLevel::Unverified,
            1 => TrustLevel::ObservedOnce,
            _ => TrustLevel::Verified,
        };
        // Monotonic: never regress below the level already recorded.
        record.public.trust_level = record.public.trust_level.max(computed);
        record.public.last_verified_unix = now_unix();
        Ok(record.public.clone())
    }

    /// Drop idle (unpinned) records, oldest `last_verified` first, until
    /// total tracked `file_size` is at or under `max_bytes`.
    #[instrument(skip(self))]
    pub fn evict_lru(&self, max_bytes: u64, policy: EvictionPolicy) -> Vec<ContentId> {
        let mut state = self.state.write();
        let mut total: u64 = state.records.values().map(|r| r.public.file_size.unwrap_or(0)).sum();
        if total <= max_bytes {
            return Vec::new();
        }

        let mut candidates: Vec<u64> = state
            .records
            .iter()
            .filter(|(_, r)| !r.public.pinned)
            .filter(|(_, r)| !(policy.protect_verified && r.public.trust_level == TrustLevel::Verified))
            .map(|(id, _)| *id)
            .collect();
        candidates.sort_by_key(|id| state.records[id].public.last_verified_unix);

        let mut evicted = Vec::new();
        for id in candidates {
            if total <= max_bytes {
                break;
            }
            if let Some(record) = state.records.remove(&id) {
                total = total.saturating_sub(record.public.file_size.unwrap_or(0));
                if let Some(cid) = record.public.content_id.clone() {
                    state.by_content_id.remove(&cid);
                    evicted.push(cid);
                }
                state.by_metadata_hash.remove(&record.public.metadata_hash);
            }
        }
        evicted
    }

    pub fn set_pinned(&self, content_id: &ContentId, pinned: bool) {
        let mut state = self.state.write();
        if let Some(&id) = state.by_content_id.get(content_id) {
            if let Some(record) = state.records.get_mut(&id) {
                record.public.pinned = pinned;
            }
        }
    }

    /// Serialize the whole registry for persistence (spec §6: a single,
    /// versioned, atomically written snapshot file).
    pub fn snapshot(&self) -> Vec<ResourceMetadata> {
        let state = self.state.read();
        state.records.values().map(|r| r.public.clone()).collect()
    }

    pub fn normalize_filename(name: &str) -> String {
        normalize_filename(name)
    }
}

fn merge_records(state: &mut RegistryState, source_id: u64, target_id: u64) {
    let source = state.records.remove(&source_id).expect("live record");
    let target = state.records.get_mut(&target_id).expect("live record");

    target.public.files = merge_files(&target.public.files, &source.public.files);
    target.public.trust_level = target.public.trust_level.max(source.public.trust_level);
    if source.public.last_verified_unix > target.public.last_verified_unix {
        target.public.last_verified_unix = source.public.last_verified_unix;
    }
    target.public.first_seen_unix = target.public.first_seen_unix.min(source.public.first_seen_unix);
    for tag in source.corroborating_sources {
        target.corroborating_sources.insert(tag);
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mh(s: &str) -> MetadataHash {
        MetadataHash::parse(s.repeat(64 / s.len())).unwrap()
    }

    fn cid(s: &str) -> ContentId {
        ContentId::parse(s.repeat(40 / s.len())).unwrap()
    }

    #[test]
    fn upsert_then_lookup_roundtrips() {
        let registry = Registry::new();
        let hash = mh("a");
        registry.upsert_by_metadata(
            hash.clone(),
            ProviderRecord {
                primary_url: "https://example.com/mod.zip".into(),
                advertised_size: Some(1234),
                ..Default::default()
            },
        );
        let found = registry.lookup_by_metadata_hash(&hash).unwrap();
        assert_eq!(found.primary_url, "https://example.com/mod.zip");
        assert_eq!(found.trust_level, TrustLevel::Unverified);
    }

    #[test]
    fn upgrade_rekeys_and_lookup_finds_by_either_key() {
        let registry = Registry::new();
        let hash = mh("b");
        registry.upsert_by_metadata(hash.clone(), ProviderRecord::default());

        let content_id = cid("c");
        let content_sha = ContentHashSha256::parse("d".repeat(64)).unwrap();
        registry
            .upgrade_to_content_id(&hash, content_id.clone(), content_sha)
            .unwrap();

        assert!(registry.lookup_by_content_id(&content_id).is_some());
        assert!(registry.lookup_by_metadata_hash(&hash).is_some());
    }

    #[test]
    fn trust_elevates_on_second_distinct_source_and_never_regresses() {
        let registry = Registry::new();
        let hash = mh("e");
        registry.upsert_by_metadata(hash.clone(), ProviderRecord::default());
        let content_id = cid("f");
        let content_sha = ContentHashSha256::parse("0".repeat(64)).unwrap();
        registry
            .upgrade_to_content_id(&hash, content_id.clone(), content_sha)
            .unwrap();

        let r1 = registry.observe_mapping(&hash, &content_id, "provider-a").unwrap();
        assert_eq!(r1.trust_level, TrustLevel::ObservedOnce);

        let r2 = registry.observe_mapping(&hash, &content_id, "provider-a").unwrap();
        assert_eq!(r2.trust_level, TrustLevel::ObservedOnce, "same source does not elevate further");

        let r3 = registry.observe_mapping(&hash, &content_id, "provider-b").unwrap();
        assert_eq!(r3.trust_level, TrustLevel::Verified);
    }

    #[test]
    fn evict_lru_respects_pinned_records() {
        let registry = Registry::new();
        for (i, tag) in ["g", "h"].iter().enumerate() {
            let hash = mh(tag);
            registry.upsert_by_metadata(
                hash,
                ProviderRecord {
                    advertised_size: Some(1000),
                    primary_url: format!("url-{i}"),
                    ..Default::default()
                },
            );
        }
        let evicted = registry.evict_lru(500, EvictionPolicy::default());
        // Neither record has a ContentId yet, so nothing indexed by content id
        // is evicted, but the byte accounting still triggers eviction attempts.
        assert!(evicted.is_empty());
    }
}
