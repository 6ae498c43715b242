//! `.npz`-backed [`ArrayStore`].
//!
//! Each array `key` becomes the entry `key.npy`; its dimension names and
//! labels are newline-joined UTF-8 bytes in `key.dims.npy` and
//! `key.labels.npy`. Writes are buffered and the archive is produced on
//! `close`, under an exclusive lock on `<path>.lock`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use ndarray::{Array1, ArrayD, Ix1, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use tracing::debug;

use super::{ArrayStore, StoreMode, StoredArray};

pub struct NpzStore {
    path: PathBuf,
    mode: StoreMode,
    reader: Option<NpzReader<File>>,
    pending: BTreeMap<String, StoredArray>,
    lock: Option<File>,
}

fn encode_lines(lines: &[String]) -> Array1<u8> {
    Array1::from_vec(lines.join("\n").into_bytes())
}

fn decode_lines(bytes: Array1<u8>) -> Result<Vec<String>> {
    let text = String::from_utf8(bytes.to_vec()).context("non UTF-8 descriptor")?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split('\n').map(String::from).collect())
}

impl NpzStore {
    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Keys of the arrays held by the store.
    pub fn keys(&mut self) -> Result<Vec<String>> {
        match self.reader.as_mut() {
            Some(npz) => {
                let names = npz.names().context("listing npz entries")?;
                Ok(names
                    .iter()
                    .filter_map(|n| n.strip_suffix(".npy"))
                    .filter(|k| !k.ends_with(".dims") && !k.ends_with(".labels"))
                    .map(String::from)
                    .collect())
            }
            None => Ok(self.pending.keys().cloned().collect()),
        }
    }
}

impl ArrayStore for NpzStore {
    fn open(path: &Path, mode: StoreMode) -> Result<Self> {
        let reader = match mode {
            StoreMode::ReadOnly => {
                let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
                Some(NpzReader::new(f).context("read npz")?)
            }
            StoreMode::Create => None,
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            reader,
            pending: BTreeMap::new(),
            lock: None,
        })
    }

    fn read(&mut self, key: &str) -> Result<StoredArray> {
        let Some(npz) = self.reader.as_mut() else {
            return self
                .pending
                .get(key)
                .cloned()
                .with_context(|| format!("no array {key} in the store"));
        };
        let data: ArrayD<f64> = npz
            .by_name::<OwnedRepr<f64>, IxDyn>(&format!("{key}.npy"))
            .with_context(|| format!("missing {key}.npy"))?;
        let dims: Array1<u8> = npz
            .by_name::<OwnedRepr<u8>, Ix1>(&format!("{key}.dims.npy"))
            .with_context(|| format!("missing shape descriptor of {key}"))?;
        let labels = match npz.by_name::<OwnedRepr<u8>, Ix1>(&format!("{key}.labels.npy")) {
            Ok(bytes) => decode_lines(bytes)?,
            Err(_) => Vec::new(),
        };
        let mut arr = StoredArray::new(decode_lines(dims)?, data)?;
        arr.labels = labels;
        Ok(arr)
    }

    fn write(&mut self, key: &str, array: &StoredArray) -> Result<()> {
        if self.mode != StoreMode::Create {
            bail!("store {} is read-only", self.path.display());
        }
        if self.lock.is_none() {
            bail!("write of {key} before single-writer mode was enabled");
        }
        if array.dims.len() != array.data.ndim() {
            bail!("{key}: {} dims for a {}-D array", array.dims.len(), array.data.ndim());
        }
        self.pending.insert(key.to_string(), array.clone());
        Ok(())
    }

    fn enable_single_writer_mode(&mut self) -> Result<()> {
        if self.mode != StoreMode::Create {
            bail!("store {} is read-only", self.path.display());
        }
        if self.lock.is_some() {
            return Ok(());
        }
        let lock_path = self.lock_path();
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("create {}", lock_path.display()))?;
        f.try_lock_exclusive()
            .with_context(|| format!("another writer holds {}", lock_path.display()))?;
        self.lock = Some(f);
        debug!(path = %self.path.display(), "single-writer mode enabled");
        Ok(())
    }

    fn close(self) -> Result<()> {
        let lock_path = self.lock_path();
        if self.mode == StoreMode::Create && !self.pending.is_empty() {
            let f = File::create(&self.path)
                .with_context(|| format!("create {}", self.path.display()))?;
            let mut npz = NpzWriter::new(f);
            for (key, arr) in &self.pending {
                npz.add_array(format!("{key}.npy"), &arr.data)?;
                npz.add_array(format!("{key}.dims.npy"), &encode_lines(&arr.dims))?;
                if !arr.labels.is_empty() {
                    npz.add_array(format!("{key}.labels.npy"), &encode_lines(&arr.labels))?;
                }
            }
            npz.finish()?;
            debug!(path = %self.path.display(), arrays = self.pending.len(), "store written");
        }
        if let Some(lock) = self.lock {
            lock.unlock().context("release store lock")?;
            std::fs::remove_file(&lock_path).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sample() -> StoredArray {
        let data = Array2::from_shape_vec((2, 3), vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6])
            .unwrap()
            .into_dyn();
        StoredArray::new(vec!["mag".into(), "poe".into()], data).unwrap()
    }

    #[test]
    fn writes_need_single_writer_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = NpzStore::open(&dir.path().join("out.npz"), StoreMode::Create).unwrap();
        assert!(store.write("a", &sample()).is_err());
        store.enable_single_writer_mode().unwrap();
        store.write("a", &sample()).unwrap();
        store.close().unwrap();
    }

    #[test]
    fn arrays_come_back_with_their_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.npz");
        let mut store = NpzStore::open(&path, StoreMode::Create).unwrap();
        store.enable_single_writer_mode().unwrap();
        let mut labelled = sample();
        labelled.labels = vec!["Active".into(), "Stable".into()];
        store.write("disagg/sid-0/mean/Mag_Dist", &labelled).unwrap();
        store.close().unwrap();

        let mut reader = NpzStore::open(&path, StoreMode::ReadOnly).unwrap();
        assert_eq!(reader.keys().unwrap(), vec!["disagg/sid-0/mean/Mag_Dist".to_string()]);
        let back = reader.read("disagg/sid-0/mean/Mag_Dist").unwrap();
        assert_eq!(back, labelled);
        assert!(reader.read("missing").is_err());
        assert!(reader.write("x", &sample()).is_err());
    }

    #[test]
    fn second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.npz");
        let mut first = NpzStore::open(&path, StoreMode::Create).unwrap();
        first.enable_single_writer_mode().unwrap();
        let mut second = NpzStore::open(&path, StoreMode::Create).unwrap();
        assert!(second.enable_single_writer_mode().is_err());
        first.close().unwrap();
    }
}
