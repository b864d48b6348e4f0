//! Whole-file SHA-256 hashing.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{DeltaError, DeltaResult};
use crate::model::ContentHash;

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 content hash of a file.
pub fn hash_file(path: &Path) -> DeltaResult<ContentHash> {
    let mut file = File::open(path).map_err(|e| DeltaError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| DeltaError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentHash(hasher.finalize().into()))
}

/// Hash a file on the blocking thread pool.
pub async fn hash_file_blocking(path: PathBuf) -> DeltaResult<ContentHash> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| DeltaError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_matches_in_memory_hash() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), ContentHash::compute(&data));
    }

    #[test]
    fn test_hash_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        File::create(&path).unwrap();

        assert_eq!(
            hash_file(&path).unwrap().to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_missing_file_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing");
        match hash_file(&path) {
            Err(DeltaError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hash_file_blocking() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(
            hash_file_blocking(path).await.unwrap(),
            ContentHash::compute(b"hello world")
        );
    }
}
