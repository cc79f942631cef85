use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Directory of JSON records, one file per key.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    dir: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonStore<T> {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _record: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &str) -> Result<T> {
        let data = fs::read(self.path(key)?).map_err(|e| not_found_or(e, key))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.exists())
    }

    /// Writes through a temporary file so readers never see a torn record.
    pub fn put(&self, key: &str, record: &T) -> Result<()> {
        let path = self.path(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path(key)?).map_err(|e| not_found_or(e, key))
    }

    /// All records, ordered by key.
    pub fn list(&self) -> Result<Vec<T>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type()?.is_file() {
                keys.push(name);
            }
        }
        keys.sort();
        self.records(&keys)
    }

    /// Reads `keys`, skipping records deleted since the directory was read.
    fn records(&self, keys: &[String]) -> Result<Vec<T>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(key) {
                Ok(record) => records.push(record),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Result<Option<T>> {
        Ok(self.list()?.into_iter().find(|record| pred(record)))
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('.') || key.contains('/') {
            return Err(Error::MalformedArgs(format!("invalid record key {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

fn not_found_or(e: io::Error, key: &str) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::ResourceNotFound(key.to_string())
    } else {
        e.into()
    }
}
