//! # Piece Storage
//!
//! Verified pieces are handed to a [`Storage`] sink exactly once each, in
//! whatever order they complete. Sinks are shared by every worker thread and
//! must place each piece at its own offset.

use crate::metainfo::TorrentDescriptor;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Destination of verified pieces.
pub trait Storage: Send + Sync {
    /// Store piece `index`. Called at most once per piece, possibly from
    /// several threads at the same time.
    fn write_piece(&self, index: u32, data: &[u8]) -> io::Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("storage lock poisoned"))
}

/// Writes pieces into `<path>.part`, renamed to `path` by [`FileStorage::finalize`].
///
/// Until finalized the output path is never touched, so a failed download
/// leaves no truncated file behind under the real name.
#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
    piece_length: u64,
    part_path: PathBuf,
    path: PathBuf,
}

impl FileStorage {
    /// Create (or truncate) the partial file, sized to the whole torrent.
    ///
    /// # Arguments
    ///
    /// * `path` - Final output path.
    /// * `descriptor` - Torrent whose pieces will be written.
    ///
    pub fn create<P: AsRef<Path>>(path: P, descriptor: &TorrentDescriptor) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut part_name = path.as_os_str().to_owned();
        part_name.push(".part");
        let part_path = PathBuf::from(part_name);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)?;
        file.set_len(descriptor.total_length)?;

        debug!("Writing pieces to {}", part_path.display());

        Ok(FileStorage {
            file: Mutex::new(file),
            piece_length: descriptor.piece_length as u64,
            part_path,
            path,
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Flush the partial file and move it to the output path.
    pub fn finalize(self) -> io::Result<PathBuf> {
        lock(&self.file)?.sync_all()?;
        fs::rename(&self.part_path, &self.path)?;
        Ok(self.path)
    }

    /// Delete the partial file.
    pub fn discard(self) -> io::Result<()> {
        drop(self.file);
        fs::remove_file(&self.part_path)
    }
}

impl Storage for FileStorage {
    fn write_piece(&self, index: u32, data: &[u8]) -> io::Result<()> {
        let mut file = lock(&self.file)?;
        file.seek(SeekFrom::Start(index as u64 * self.piece_length))?;
        file.write_all(data)
    }
}

/// Keeps pieces in memory, keyed by index.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pieces: Mutex<BTreeMap<u32, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of piece `index`, if it was written.
    pub fn piece(&self, index: u32) -> Option<Vec<u8>> {
        self.pieces.lock().ok()?.get(&index).cloned()
    }

    /// Number of pieces written so far.
    pub fn len(&self) -> usize {
        self.pieces.lock().map_or(0, |pieces| pieces.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate all pieces in index order.
    pub fn into_bytes(self) -> Vec<u8> {
        let pieces = match self.pieces.into_inner() {
            Ok(pieces) => pieces,
            Err(poisoned) => poisoned.into_inner(),
        };
        pieces.into_values().flatten().collect()
    }
}

impl Storage for MemoryStorage {
    fn write_piece(&self, index: u32, data: &[u8]) -> io::Result<()> {
        lock(&self.pieces)?.insert(index, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn descriptor() -> TorrentDescriptor {
        TorrentDescriptor::new("f".into(), vec![], 10, 4, vec![[0; 20]; 3], [0; 20]).unwrap()
    }

    #[test]
    fn file_storage_places_pieces_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        let storage = Arc::new(FileStorage::create(&output, &descriptor()).unwrap());
        assert!(storage.part_path().exists());
        assert!(!output.exists());

        // Out of order, from several threads
        let handles: Vec<_> = [(2u32, vec![9u8, 9]), (0, vec![1, 1, 1, 1]), (1, vec![5, 5, 5, 5])]
            .into_iter()
            .map(|(index, data)| {
                let storage = storage.clone();
                thread::spawn(move || storage.write_piece(index, &data).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let storage = Arc::try_unwrap(storage).unwrap();
        let path = storage.finalize().unwrap();
        assert_eq!(fs::read(path).unwrap(), vec![1, 1, 1, 1, 5, 5, 5, 5, 9, 9]);
        assert!(!dir.path().join("out.bin.part").exists());
    }

    #[test]
    fn discard_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        let storage = FileStorage::create(&output, &descriptor()).unwrap();
        storage.write_piece(0, &[1, 2, 3, 4]).unwrap();
        storage.discard().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn memory_storage_orders_by_index() {
        let storage = MemoryStorage::new();
        storage.write_piece(1, &[2]).unwrap();
        storage.write_piece(0, &[1]).unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.piece(1), Some(vec![2]));
        assert_eq!(storage.into_bytes(), vec![1, 2]);
    }
}
