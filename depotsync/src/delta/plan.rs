//! Per-file reuse planning.
//!
//! Runs on the blocking pool. Creates the pre-sized output file, copies
//! every chunk that can be proven unchanged from the previous file, and
//! returns the chunks that still have to be downloaded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::trace;

use super::{DeltaError, DeltaResult};
use crate::model::{ChunkDescriptor, FileEntry};

/// Outcome of planning one file.
#[derive(Debug, Default)]
pub(crate) struct FilePlan {
    /// Chunks copied from the previous file.
    pub reused: usize,
    /// Chunks that must be fetched.
    pub pending: Vec<ChunkDescriptor>,
}

/// Create `output` at the target size and fill in reusable chunks.
///
/// A chunk is reused when the previous entry records a chunk with the same
/// id at the same offset and the bytes read back from `previous_path` match
/// the target's block checksum. Anything that goes wrong while reading the
/// previous file only sends the chunk to the download queue. Write errors on
/// the output are returned.
pub(crate) fn prepare_file(
    target: &FileEntry,
    output: &Path,
    previous: Option<(&FileEntry, &Path)>,
) -> DeltaResult<FilePlan> {
    let mut out = File::create(output).map_err(|e| DeltaError::io(output, e))?;
    out.set_len(target.size)
        .map_err(|e| DeltaError::io(output, e))?;

    let mut previous = previous.and_then(|(entry, path)| match File::open(path) {
        Ok(file) => Some((entry, file)),
        Err(e) => {
            trace!(path = %path.display(), error = %e, "Previous file not readable");
            None
        }
    });

    let mut plan = FilePlan::default();
    for chunk in &target.chunks {
        let bytes = previous
            .as_mut()
            .and_then(|(entry, file)| reusable_bytes(chunk, entry, file));

        match bytes {
            Some(bytes) => {
                write_at(&mut out, chunk.offset, &bytes).map_err(|e| DeltaError::io(output, e))?;
                plan.reused += 1;
            }
            None => plan.pending.push(*chunk),
        }
    }

    out.flush().map_err(|e| DeltaError::io(output, e))?;
    Ok(plan)
}

fn reusable_bytes(
    chunk: &ChunkDescriptor,
    previous: &FileEntry,
    file: &mut File,
) -> Option<Vec<u8>> {
    let old = previous.chunk_at(chunk.offset)?;
    if old.id != chunk.id {
        return None;
    }

    let mut buffer = vec![0u8; chunk.uncompressed_len as usize];
    file.seek(SeekFrom::Start(chunk.offset)).ok()?;
    file.read_exact(&mut buffer).ok()?;

    if chunk.matches(&buffer) {
        Some(buffer)
    } else {
        trace!(chunk = %chunk.id, offset = chunk.offset, "Previous bytes fail block checksum");
        None
    }
}

pub(crate) fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// Open an existing output file for offset writes.
pub(crate) fn open_for_writes(path: &Path) -> DeltaResult<File> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| DeltaError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::file_entry;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_without_previous_queues_everything() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("out.bin");
        let (target, _) = file_entry("out.bin", &[7u8; 10], 4);

        let plan = prepare_file(&target, &output, None).unwrap();

        assert_eq!(plan.reused, 0);
        assert_eq!(plan.pending.len(), 3);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 10);
    }

    #[test]
    fn test_prepare_reuses_matching_chunks_only() {
        let temp = TempDir::new().unwrap();
        let old_data = b"AAAABBBBCCCC".to_vec();
        let new_data = b"AAAAXXXXCCCC".to_vec();
        let previous_path = temp.path().join("prev.bin");
        std::fs::write(&previous_path, &old_data).unwrap();

        let (previous, _) = file_entry("f", &old_data, 4);
        let (target, _) = file_entry("f", &new_data, 4);
        let output = temp.path().join("out.bin");

        let plan = prepare_file(&target, &output, Some((&previous, &previous_path))).unwrap();

        assert_eq!(plan.reused, 2);
        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.pending[0].offset, 4);

        let written = std::fs::read(&output).unwrap();
        assert_eq!(&written[0..4], b"AAAA");
        assert_eq!(&written[4..8], &[0u8; 4]);
        assert_eq!(&written[8..12], b"CCCC");
    }

    #[test]
    fn test_prepare_rejects_tampered_previous_bytes() {
        let temp = TempDir::new().unwrap();
        let data = b"AAAABBBB".to_vec();
        let previous_path = temp.path().join("prev.bin");
        std::fs::write(&previous_path, b"AAAAZZZZ").unwrap();

        let (previous, _) = file_entry("f", &data, 4);
        let (target, _) = file_entry("f", &data, 4);
        let output = temp.path().join("out.bin");

        let plan = prepare_file(&target, &output, Some((&previous, &previous_path))).unwrap();

        assert_eq!(plan.reused, 1);
        assert_eq!(plan.pending[0].offset, 4);
    }

    #[test]
    fn test_prepare_missing_previous_file_falls_through() {
        let temp = TempDir::new().unwrap();
        let data = b"AAAABBBB".to_vec();
        let (previous, _) = file_entry("f", &data, 4);
        let (target, _) = file_entry("f", &data, 4);
        let missing = temp.path().join("missing.bin");
        let output = temp.path().join("out.bin");

        let plan = prepare_file(&target, &output, Some((&previous, &missing))).unwrap();

        assert_eq!(plan.reused, 0);
        assert_eq!(plan.pending.len(), 2);
    }

    #[test]
    fn test_prepare_short_previous_file_falls_through() {
        let temp = TempDir::new().unwrap();
        let data = b"AAAABBBB".to_vec();
        let previous_path = temp.path().join("prev.bin");
        std::fs::write(&previous_path, b"AAAABB").unwrap();

        let (previous, _) = file_entry("f", &data, 4);
        let (target, _) = file_entry("f", &data, 4);
        let output = temp.path().join("out.bin");

        let plan = prepare_file(&target, &output, Some((&previous, &previous_path))).unwrap();

        assert_eq!(plan.reused, 1);
        assert_eq!(plan.pending.len(), 1);
    }
}
