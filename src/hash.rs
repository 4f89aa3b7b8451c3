//! Piece planning (C2) and integrity hashing (C3).

use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::DccError;

/// Candidate piece lengths, smallest first. `plan_pieces` picks the
/// smallest that keeps the piece count at or under 1,048,576; `4 MiB` is the
/// fallback for anything larger still.
const CANDIDATE_PIECE_LENGTHS: &[u64] = &[
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
    2 * 1024 * 1024,
    4 * 1024 * 1024,
];

const MAX_PIECE_COUNT: u64 = 1_048_576;
const FALLBACK_PIECE_LENGTH: u64 = 4 * 1024 * 1024;

/// Choose a piece length such that `ceil(file_size / piece_length) <= 1,048,576`.
pub fn plan_pieces(file_size: u64) -> u64 {
    if file_size == 0 {
        return CANDIDATE_PIECE_LENGTHS[0];
    }
    for &candidate in CANDIDATE_PIECE_LENGTHS {
        if piece_count(file_size, candidate) <= MAX_PIECE_COUNT {
            return candidate;
        }
    }
    FALLBACK_PIECE_LENGTH
}

fn piece_count(file_size: u64, piece_length: u64) -> u64 {
    (file_size + piece_length - 1) / piece_length
}

/// Result of hashing a file: the whole-file SHA-256, the piece length used,
/// and the concatenated per-piece SHA-1 hashes.
#[derive(Debug, Clone)]
pub struct FileHashes {
    pub content_sha256: [u8; 32],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl FileHashes {
    pub fn content_sha256_hex(&self) -> String {
        hex::encode(self.content_sha256)
    }

    pub fn piece_hashes_hex(&self) -> String {
        self.piece_hashes
            .iter()
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join("")
    }

    /// The concatenated raw piece hashes, as the bencoded `pieces` field
    /// expects them: one 20-byte SHA-1 digest per piece, back to back.
    pub fn piece_hashes_concat(&self) -> Vec<u8> {
        self.piece_hashes.iter().flatten().copied().collect()
    }
}

/// Read `path` sequentially in piece-sized chunks, computing a streaming
/// SHA-256 over the whole file and one SHA-1 per piece. Deterministic: two
/// calls against the same bytes produce the same `FileHashes`.
pub fn hash_file(path: &Path, piece_length: u64) -> Result<FileHashes, DccError> {
    let mut file = std::fs::File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DccError::SourceMissing {
                path: path.to_path_buf(),
            }
        } else {
            DccError::IoError { source }
        }
    })?;

    let mut whole_file_hasher = Sha256::new();
    let mut piece_hashes = Vec::new();
    let mut buf = vec![0u8; piece_length.min(8 * 1024 * 1024).max(1) as usize];
    let mut piece_hasher = Sha1::new();
    let mut bytes_in_piece: u64 = 0;

    loop {
        let max_read = ((piece_length - bytes_in_piece).min(buf.len() as u64)) as usize;
        let n = file.read(&mut buf[..max_read]).map_err(DccError::from)?;
        if n == 0 {
            break;
        }
        whole_file_hasher.update(&buf[..n]);
        piece_hasher.update(&buf[..n]);
        bytes_in_piece += n as u64;
        if bytes_in_piece == piece_length {
            piece_hashes.push(finalize_sha1(std::mem::replace(&mut piece_hasher, Sha1::new())));
            bytes_in_piece = 0;
        }
    }
    if bytes_in_piece > 0 {
        piece_hashes.push(finalize_sha1(piece_hasher));
    }

    Ok(FileHashes {
        content_sha256: whole_file_hasher.finalize().into(),
        piece_length,
        piece_hashes,
    })
}

fn finalize_sha1(hasher: Sha1) -> [u8; 20] {
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plan_pieces_matches_spec_table() {
        assert_eq!(plan_pieces(0), 64 * 1024);
        assert_eq!(plan_pieces(1), 64 * 1024);
        assert_eq!(plan_pieces(262_145), 256 * 1024);
    }

    #[test]
    fn plan_pieces_falls_back_to_4mib_for_huge_files() {
        let huge = 4 * 1024 * 1024 * MAX_PIECE_COUNT + 1;
        assert_eq!(plan_pieces(huge), FALLBACK_PIECE_LENGTH);
    }

    #[test]
    fn hash_file_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let a = hash_file(&path, plan_pieces(10_000)).unwrap();
        let b = hash_file(&path, plan_pieces(10_000)).unwrap();
        assert_eq!(a.content_sha256, b.content_sha256);
        assert_eq!(a.piece_hashes, b.piece_hashes);
    }

    #[test]
    fn piece_count_matches_length_times_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![1u8; 262_145]).unwrap();
        drop(f);

        let piece_length = plan_pieces(262_145);
        let hashes = hash_file(&path, piece_length).unwrap();
        assert_eq!(hashes.piece_hashes.len(), 2);
        assert_eq!(hashes.piece_hashes_concat().len(), 40);
    }

    #[test]
    fn missing_file_surfaces_source_missing() {
        let err = hash_file(Path::new("/nonexistent/does-not-exist"), 1024).unwrap_err();
        assert!(matches!(err, DccError::SourceMissing { .. }));
    }
}
