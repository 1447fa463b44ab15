//! Durable gallery store.
//!
//! Two artifacts live side by side in the data directory:
//!
//! - `faces.bin`: header (`RCFV`, version, vector length, count) followed by
//!   `count` raw feature vectors of `dim` bytes each.
//! - `labels.json`: JSON array of label strings, same order and length.
//!
//! Each append rewrites both files through a temp file + rename, vectors
//! first and labels last. `labels.json` is the commit record: a load reads
//! exactly as many vectors as there are labels, so a crash between the two
//! renames leaves the previous gallery visible and nothing partial.
//!
//! The store assumes a single writer. Two processes enrolling at the same
//! time can lose one batch; deployments must serialize enrollment runs.

use crate::types::{FaceSample, Gallery, InvalidSample};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const VECTORS_FILE: &str = "faces.bin";
const LABELS_FILE: &str = "labels.json";
const MAGIC: &[u8; 4] = b"RCFV";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O: {0}")]
    Io(#[from] io::Error),
    #[error("gallery store corrupt: {0}")]
    Corrupt(String),
    #[error("invalid sample: {0}")]
    InvalidSample(#[from] InvalidSample),
}

/// File-backed, append-only gallery.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    dir: PathBuf,
}

impl GalleryStore {
    /// Use `dir` as the gallery location, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    fn labels_path(&self) -> PathBuf {
        self.dir.join(LABELS_FILE)
    }

    /// Load the whole gallery. `Ok(None)` means nothing has been stored yet.
    pub fn load(&self) -> Result<Option<Gallery>, GalleryError> {
        let labels_path = self.labels_path();
        let vectors_path = self.vectors_path();

        if !labels_path.exists() {
            if vectors_path.exists() {
                tracing::warn!(
                    path = %vectors_path.display(),
                    "vector file without labels; treating gallery as empty"
                );
            }
            return Ok(None);
        }

        let labels: Vec<String> = serde_json::from_reader(BufReader::new(File::open(&labels_path)?))
            .map_err(|e| GalleryError::Corrupt(format!("{}: {e}", labels_path.display())))?;
        if labels.is_empty() {
            return Ok(None);
        }

        if !vectors_path.exists() {
            return Err(GalleryError::Corrupt(format!(
                "{} lists {} labels but {} is missing",
                labels_path.display(),
                labels.len(),
                vectors_path.display()
            )));
        }
        let (dim, vectors) = read_vectors(&vectors_path)?;

        if vectors.len() < labels.len() {
            return Err(GalleryError::Corrupt(format!(
                "{} labels but only {} vectors",
                labels.len(),
                vectors.len()
            )));
        }
        if vectors.len() > labels.len() {
            tracing::warn!(
                labels = labels.len(),
                vectors = vectors.len(),
                "ignoring uncommitted vectors past the last label"
            );
        }

        let mut gallery = Gallery::new();
        for (label, features) in labels.into_iter().zip(vectors) {
            gallery
                .push(FaceSample { label, features })
                .map_err(|e| GalleryError::Corrupt(e.to_string()))?;
        }

        tracing::debug!(samples = gallery.len(), dim, "loaded gallery");
        Ok(Some(gallery))
    }

    /// Append a batch of samples. Either the whole batch becomes visible to
    /// later loads or none of it does.
    pub fn append(&self, samples: &[FaceSample]) -> Result<(), GalleryError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut gallery = self.load()?.unwrap_or_default();
        for sample in samples {
            gallery.push(sample.clone())?;
        }

        let dim = gallery.dim().unwrap_or(0);
        write_atomic(&self.vectors_path(), |w| {
            w.write_all(MAGIC)?;
            w.write_all(&FORMAT_VERSION.to_le_bytes())?;
            w.write_all(&(dim as u32).to_le_bytes())?;
            w.write_all(&(gallery.len() as u64).to_le_bytes())?;
            for sample in gallery.samples() {
                w.write_all(&sample.features)?;
            }
            Ok(())
        })?;

        let labels: Vec<&str> = gallery.samples().iter().map(|s| s.label.as_str()).collect();
        write_atomic(&self.labels_path(), |w| {
            serde_json::to_writer(&mut *w, &labels).map_err(io::Error::from)
        })?;

        // Make both renames durable.
        if let Err(err) = File::open(&self.dir).and_then(|dir| dir.sync_all()) {
            tracing::warn!(
                dir = %self.dir.display(),
                error = %err,
                "gallery directory sync failed; last batch may not survive a crash"
            );
        }

        tracing::info!(
            added = samples.len(),
            total = gallery.len(),
            dim,
            "gallery batch committed"
        );
        Ok(())
    }
}

fn read_vectors(path: &Path) -> Result<(usize, Vec<Vec<u8>>), GalleryError> {
    let corrupt = |msg: &str| GalleryError::Corrupt(format!("{}: {msg}", path.display()));

    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(corrupt("bad header"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {version}")));
    }
    let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..HEADER_LEN]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    let body = &bytes[HEADER_LEN..];
    if dim == 0 || body.len() != dim.saturating_mul(count) {
        return Err(corrupt(&format!(
            "expected {count} vectors of {dim} bytes, found {} body bytes",
            body.len()
        )));
    }

    Ok((dim, body.chunks_exact(dim).map(<[u8]>::to_vec).collect()))
}

/// Write `path` via a sibling temp file, fsync, then rename over the target.
fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    let result = write(&mut writer).and_then(|_| writer.flush());
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn samples(label: &str, n: usize, dim: usize) -> Vec<FaceSample> {
        (0..n)
            .map(|i| FaceSample::new(label, vec![i as u8; dim]))
            .collect()
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_append_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();

        store.append(&samples("alice", 5, 7500)).unwrap();
        store.append(&samples("bob", 3, 7500)).unwrap();

        let gallery = store.load().unwrap().unwrap();
        assert_eq!(gallery.len(), 8);
        assert_eq!(gallery.dim(), Some(7500));
        let labels: Vec<_> = gallery.samples().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["alice"; 5].iter().chain(["bob"; 3].iter()).copied().collect::<Vec<_>>());
        assert_eq!(gallery.samples()[6].features, vec![1u8; 7500]);
    }

    #[test]
    fn test_append_rejects_mismatched_length_without_writing() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        store.append(&samples("alice", 2, 12)).unwrap();

        let mut batch = samples("bob", 2, 12);
        batch.push(FaceSample::new("bob", vec![0; 11]));
        assert!(matches!(
            store.append(&batch),
            Err(GalleryError::InvalidSample(_))
        ));

        let gallery = store.load().unwrap().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.distinct_labels().len(), 1);
    }

    #[test]
    fn test_uncommitted_vectors_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        store.append(&samples("alice", 2, 4)).unwrap();
        let committed_labels = fs::read(dir.path().join(LABELS_FILE)).unwrap();

        // Simulate a crash after the vector rename but before the label rename.
        store.append(&samples("bob", 3, 4)).unwrap();
        fs::write(dir.path().join(LABELS_FILE), committed_labels).unwrap();

        let gallery = store.load().unwrap().unwrap();
        assert_eq!(gallery.len(), 2);
        assert!(gallery.samples().iter().all(|s| s.label == "alice"));
    }

    #[test]
    fn test_truncated_vectors_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        store.append(&samples("alice", 2, 4)).unwrap();

        let path = dir.path().join(VECTORS_FILE);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(matches!(store.load(), Err(GalleryError::Corrupt(_))));
    }

    #[test]
    fn test_garbage_labels_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        store.append(&samples("alice", 1, 4)).unwrap();
        fs::write(dir.path().join(LABELS_FILE), b"not json").unwrap();

        assert!(matches!(store.load(), Err(GalleryError::Corrupt(_))));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::open(dir.path()).unwrap();
        store.append(&[]).unwrap();
        assert!(!dir.path().join(VECTORS_FILE).exists());
    }
}
