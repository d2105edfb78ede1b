//! Versioned per-handle checkpoint storage and the per-client checkpoint
//! station.

use std::collections::BTreeMap;
use std::io::Write;

use shade_core::{ShadeError, ShadeResult};

/// One captured version of a handle's device-resident state.
#[derive(Debug, Clone)]
pub struct CheckpointSlot {
    pub data: Vec<u8>,
    /// Device stream the capture copy was issued on.
    pub stream_id: u64,
}

/// Per-handle store mapping version id to captured state.
#[derive(Debug, Default)]
pub struct CheckpointBag {
    versions: BTreeMap<u64, CheckpointSlot>,
}

impl CheckpointBag {
    pub fn new() -> Self {
        Self { versions: BTreeMap::new() }
    }

    pub fn insert(&mut self, version: u64, data: Vec<u8>, stream_id: u64) {
        self.versions.insert(version, CheckpointSlot { data, stream_id });
    }

    pub fn get_latest(&self) -> Option<(u64, &CheckpointSlot)> {
        self.versions.iter().next_back().map(|(v, s)| (*v, s))
    }

    pub fn get_version(&self, version: u64) -> Option<&CheckpointSlot> {
        self.versions.get(&version)
    }

    /// Drop the newest version after a compute/checkpoint conflict on the
    /// async copy. `NotReady` when nothing has been recorded yet.
    pub fn invalidate_latest(&mut self) -> ShadeResult<u64> {
        match self.versions.pop_last() {
            Some((v, _)) => Ok(v),
            None => Err(ShadeError::NotReady("no checkpoint recorded".into())),
        }
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.versions.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &CheckpointSlot)> {
        self.versions.iter()
    }
}

/// Station collecting checkpointed chunks for one client. The chunk list is
/// collapsed to an image file or streamed to a peer daemon, in enqueue order.
#[derive(Debug, Default)]
pub struct CkptStation {
    chunks: Vec<Vec<u8>>,
    byte_size: u64,
}

impl CkptStation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_value_u32(&mut self, v: u32) {
        self.load_chunk(v.to_le_bytes().to_vec());
    }

    pub fn load_value_u64(&mut self, v: u64) {
        self.load_chunk(v.to_le_bytes().to_vec());
    }

    pub fn load_chunk(&mut self, chunk: Vec<u8>) {
        self.byte_size += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.byte_size = 0;
    }

    /// Dump all chunks to a binary image file, in enqueue order.
    pub fn collapse_to_image_file(&self, path: &str) -> ShadeResult<()> {
        let mut file = std::fs::File::create(path)
            .map_err(|e| ShadeError::Failed(format!("failed to open image {path}: {e}")))?;
        for chunk in &self.chunks {
            file.write_all(chunk)?;
        }
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_tracks_highest_version() {
        let mut bag = CheckpointBag::new();
        assert!(bag.get_latest().is_none());
        bag.insert(3, vec![3], 0);
        bag.insert(7, vec![7], 0);
        bag.insert(5, vec![5], 0);
        let (v, slot) = bag.get_latest().unwrap();
        assert_eq!(v, 7);
        assert_eq!(slot.data, vec![7]);
    }

    #[test]
    fn invalidate_drops_newest_only() {
        let mut bag = CheckpointBag::new();
        bag.insert(1, vec![1], 0);
        bag.insert(2, vec![2], 0);
        assert_eq!(bag.invalidate_latest().unwrap(), 2);
        assert_eq!(bag.get_latest().unwrap().0, 1);

        let mut empty = CheckpointBag::new();
        assert!(matches!(empty.invalidate_latest(), Err(ShadeError::NotReady(_))));
    }

    #[test]
    fn station_collapses_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.bin");
        let mut station = CkptStation::new();
        station.load_value_u32(0xAABBCCDD);
        station.load_chunk(vec![1, 2, 3]);
        assert_eq!(station.byte_size(), 7);

        station.collapse_to_image_file(path.to_str().unwrap()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0xDD, 0xCC, 0xBB, 0xAA, 1, 2, 3]);

        station.clear();
        assert_eq!(station.byte_size(), 0);
    }
}
