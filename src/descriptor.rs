//! Descriptor builder (C4): assembles the info-dict, computes the
//! `ContentId`, and writes the bencoded descriptor atomically to disk.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::bencode::Value;
use crate::error::DccError;
use crate::hash::{hash_file, plan_pieces, FileHashes};
use crate::ids::ContentId;

/// Tiered tracker URL list, mirroring the `announce`/`announce-list`
/// structure the BitTorrent metainfo format already uses: tiers are tried
/// in order, URLs within a tier in shuffled order. We only need this to
/// populate the optional outer-dict fields; the DCC never talks to a
/// classic tracker itself (peer discovery goes through the swarm engine's
/// DHT/PEX, §4.8).
#[derive(Debug, Clone, Default)]
pub struct TrackerList {
    tiers: Vec<Vec<String>>,
}

impl TrackerList {
    pub fn single(url: impl Into<String>) -> Self {
        TrackerList {
            tiers: vec![vec![url.into()]],
        }
    }

    pub fn tiers(tiers: Vec<Vec<String>>) -> Self {
        TrackerList { tiers }
    }

    fn primary(&self) -> Option<&str> {
        self.tiers.first()?.first().map(String::as_str)
    }

    fn to_value(&self) -> Value {
        Value::List(
            self.tiers
                .iter()
                .map(|tier| Value::List(tier.iter().map(|u| Value::str(u.clone())).collect()))
                .collect(),
        )
    }
}

/// Result of building a descriptor: its `ContentId`, the whole-file SHA-256,
/// the piece length actually used, and the bencoded bytes that were written
/// to disk.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub content_id: ContentId,
    pub content_sha256_hex: String,
    pub piece_length: u64,
    pub piece_hashes_hex: String,
    pub bytes: Vec<u8>,
}

/// Build a descriptor for `file_path`, advertised under `advertised_name`.
/// Renaming the same bytes changes the info-dict and therefore the
/// `ContentId` — this is documented, intentional behavior (spec §4.4), not a
/// bug: the filename is part of the canonical identity.
pub fn build_descriptor(
    file_path: &Path,
    advertised_name: &str,
    piece_length: Option<u64>,
    trackers: Option<&TrackerList>,
) -> Result<Descriptor, DccError> {
    if advertised_name.trim().is_empty() {
        return Err(DccError::InvalidArgument {
            message: "advertised_name must not be empty".into(),
        });
    }
    let metadata = std::fs::metadata(file_path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DccError::SourceMissing {
                path: file_path.to_path_buf(),
            }
        } else {
            DccError::IoError { source }
        }
    })?;
    let file_size = metadata.len();
    let piece_length = piece_length.unwrap_or_else(|| plan_pieces(file_size));

    let hashes: FileHashes = hash_file(file_path, piece_length)?;

    let info_dict = build_info_dict(advertised_name, file_size, piece_length, &hashes);
    let info_bytes = info_dict.encode();
    let content_id = ContentId::new_unchecked(hex::encode(Sha1::digest(&info_bytes)));

    let outer = build_outer_dict(info_dict, trackers);
    let bytes = outer.encode();

    Ok(Descriptor {
        content_id,
        content_sha256_hex: hashes.content_sha256_hex(),
        piece_length,
        piece_hashes_hex: hashes.piece_hashes_hex(),
        bytes,
    })
}

fn build_info_dict(name: &str, length: u64, piece_length: u64, hashes: &FileHashes) -> Value {
    Value::dict()
        .insert("length", Value::Int(length as i64))
        .insert("name", Value::str(name))
        .insert("piece length", Value::Int(piece_length as i64))
        .insert("pieces", Value::Bytes(hashes.piece_hashes_concat()))
        .insert("private", Value::Int(0))
        .build()
}

fn build_outer_dict(info: Value, trackers: Option<&TrackerList>) -> Value {
    let creation_date = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Value::dict()
        .insert("creation date", Value::Int(creation_date))
        .insert("info", info)
        .insert_opt(
            "announce",
            trackers.and_then(|t| t.primary()).map(Value::str),
        )
        .insert_opt("announce-list", trackers.map(TrackerList::to_value))
        .build()
}

/// Write descriptor bytes to `path` atomically: write to a sibling temp
/// file, then rename into place.
pub fn write_descriptor_atomic(path: &Path, bytes: &[u8]) -> Result<(), DccError> {
    let dir = path.parent().ok_or_else(|| DccError::InvalidArgument {
        message: "descriptor path has no parent directory".into(),
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp_path: PathBuf = dir.to_path_buf();
    let unique: u64 = rand::random();
    tmp_path.push(format!(".descriptor-{unique:016x}.tmp"));

    {
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bytes(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn content_id_is_forty_lowercase_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bytes(&dir, "empty.bin", &[]);
        let descriptor = build_descriptor(&path, "empty.bin", None, None).unwrap();
        let id = descriptor.content_id.as_str();
        assert_eq!(id.len(), 40);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn determinism_across_repeated_builds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bytes(&dir, "a.bin", b"hello world");
        let first = build_descriptor(&path, "a.bin", None, None).unwrap();
        let second = build_descriptor(&path, "a.bin", None, None).unwrap();
        assert_eq!(first.content_id, second.content_id);
    }

    #[test]
    fn filename_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bytes(&dir, "a.bin", b"identical bytes");
        let as_a = build_descriptor(&path, "a.bin", None, None).unwrap();
        let as_b = build_descriptor(&path, "b.bin", None, None).unwrap();
        assert_ne!(as_a.content_id, as_b.content_id);
    }

    #[test]
    fn single_byte_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = vec![0u8; 1_000_000];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let path_a = write_bytes(&dir, "a.bin", &bytes);
        let original = build_descriptor(&path_a, "a.bin", None, None).unwrap();

        bytes[500_000] ^= 0xFF;
        std::fs::write(&path_a, &bytes).unwrap();
        let flipped = build_descriptor(&path_a, "a.bin", None, None).unwrap();

        assert_ne!(original.content_id, flipped.content_id);
    }

    #[test]
    fn piece_boundary_plus_one_byte_yields_two_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bytes(&dir, "c.bin", &vec![9u8; 262_145]);
        let descriptor = build_descriptor(&path, "c.bin", None, None).unwrap();
        assert_eq!(descriptor.piece_hashes_hex.len(), 2 * 40);
    }

    #[test]
    fn write_descriptor_atomic_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bytes(&dir, "d.bin", b"payload");
        let descriptor = build_descriptor(&path, "d.bin", None, None).unwrap();

        let out = dir.path().join("descriptors").join("d.torrent");
        write_descriptor_atomic(&out, &descriptor.bytes).unwrap();
        let read_back = std::fs::read(&out).unwrap();
        assert_eq!(read_back, descriptor.bytes);

        let decoded = Value::decode_strict(&read_back).unwrap();
        let info = decoded.get("info").unwrap();
        assert_eq!(info.get("name").unwrap().as_bytes().unwrap(), b"d.bin");
    }
}
