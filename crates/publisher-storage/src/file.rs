//! Filesystem-backed object store.
//!
//! Each bucket is a directory; object keys map to relative paths below it.
//! User metadata and tags live in a hidden sidecar file next to the object
//! (`.<name>.meta.json`), so folder listings never see them.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ObjectMeta, ObjectStore, PutOptions, Result, StorageError, StorageType};

/// Filesystem-based storage backend.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    bucket: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tagging: Option<String>,
}

impl FileStorage {
    /// Store objects directly below `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            bucket: "local".to_string(),
        }
    }

    /// Store the objects of `bucket` in `base_path/bucket`.
    pub fn for_bucket(base_path: PathBuf, bucket: &str) -> Self {
        if bucket.is_empty() {
            return Self::new(base_path);
        }
        Self {
            root: base_path.join(bucket),
            bucket: bucket.to_string(),
        }
    }

    /// Directory holding this bucket's objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "object keys must name a file",
            });
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "object keys must be relative and must not contain `..`",
            });
        }
        Ok(self.root.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.meta.json"))
    }

    fn read_sidecar(path: &Path) -> Result<Sidecar> {
        let sidecar = Self::sidecar_path(path);
        match fs::read(&sidecar) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Io {
                action: "failed to parse metadata",
                path: sidecar,
                source: std::io::Error::new(ErrorKind::InvalidData, e),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(source) => Err(StorageError::Io {
                action: "failed to read metadata",
                path: sidecar,
                source,
            }),
        }
    }

    fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<()> {
        let target = Self::sidecar_path(path);
        let json = serde_json::to_vec_pretty(sidecar).map_err(|e| StorageError::Io {
            action: "failed to encode metadata",
            path: target.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;
        write_atomically(&target, &json)
    }
}

/// Write to a temp file first, then rename for atomicity.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            action: "failed to create directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{name}.tmp"));
    fs::write(&tmp_path, data).map_err(|source| StorageError::Io {
        action: "failed to write file",
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| StorageError::Io {
        action: "failed to rename file to",
        path: path.to_path_buf(),
        source,
    })
}

impl ObjectStore for FileStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::not_found(&self.bucket, key))
            }
            Err(source) => Err(StorageError::Io {
                action: "failed to read file",
                path,
                source,
            }),
        }
    }

    fn put(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()> {
        let path = self.object_path(key)?;
        write_atomically(&path, data)?;

        if options.tagging.is_some() {
            let mut sidecar = Self::read_sidecar(&path)?;
            sidecar.tagging = options.tagging.clone();
            Self::write_sidecar(&path, &sidecar)?;
        }
        debug!(bucket = %self.bucket, key, bytes = data.len(), "wrote object");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        for target in [Self::sidecar_path(&path), path] {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StorageError::Io {
                        action: "failed to delete file",
                        path: target,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        let path = self.object_path(key)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(StorageError::not_found(&self.bucket, key)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::not_found(&self.bucket, key));
            }
            Err(source) => {
                return Err(StorageError::Io {
                    action: "failed to stat file",
                    path,
                    source,
                });
            }
        };
        let sidecar = Self::read_sidecar(&path)?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.len(),
            replication_status: None,
            metadata: sidecar.metadata,
        })
    }

    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir_part, name_part) = match prefix.rfind('/') {
            Some(idx) => prefix.split_at(idx + 1),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_part.trim_end_matches('/'))?
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    action: "failed to list directory",
                    path: dir,
                    source,
                });
            }
        };

        let mut prefixes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                action: "failed to list directory",
                path: dir.clone(),
                source,
            })?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && name.starts_with(name_part) {
                prefixes.push(format!("{dir_part}{name}/"));
            }
        }
        prefixes.sort();
        Ok(prefixes)
    }

    fn replace_metadata(&self, key: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(StorageError::not_found(&self.bucket, key));
        }
        let mut sidecar = Self::read_sidecar(&path)?;
        sidecar.metadata = metadata.clone();
        Self::write_sidecar(&path, &sidecar)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
