use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::{
    ObjectMeta, ObjectStore, Operation, PutOptions, ReplicationStatus, Result, StorageError,
    StorageType,
};

/// In-memory object store.
///
/// Clones share the same objects, so a test can keep a handle for
/// inspection and fault injection while the component under test owns
/// another.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bucket: String,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    replication: BTreeMap<String, ReplicationScript>,
    failures: HashSet<(String, Operation)>,
    head_delay: Duration,
    head_count: usize,
    get_count: usize,
    put_count: usize,
}

#[derive(Debug, Clone, Default)]
struct StoredObject {
    data: Vec<u8>,
    tagging: Option<String>,
    metadata: BTreeMap<String, String>,
}

/// Replication states reported by successive `head` calls. The last one
/// repeats forever.
#[derive(Debug, Clone, Default)]
struct ReplicationScript {
    pending: VecDeque<Option<ReplicationStatus>>,
    last: Option<ReplicationStatus>,
}

impl ReplicationScript {
    fn next(&mut self) -> Option<ReplicationStatus> {
        if let Some(status) = self.pending.pop_front() {
            self.last = status;
        }
        self.last.clone()
    }
}

impl MemoryStorage {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report `status` for `key` on every following `head`.
    pub fn set_replication_status(&self, key: &str, status: Option<ReplicationStatus>) {
        self.script_replication(key, vec![status]);
    }

    /// Report each status in turn on successive `head` calls for `key`.
    pub fn script_replication(&self, key: &str, statuses: Vec<Option<ReplicationStatus>>) {
        self.inner().replication.insert(
            key.to_string(),
            ReplicationScript {
                pending: statuses.into(),
                last: None,
            },
        );
    }

    /// Make `op` on `key` fail with a backend error until cleared.
    pub fn fail_on(&self, key: &str, op: Operation) {
        self.inner().failures.insert((key.to_string(), op));
    }

    pub fn clear_failures(&self) {
        self.inner().failures.clear();
    }

    /// Sleep this long inside every `head` call.
    pub fn set_head_delay(&self, delay: Duration) {
        self.inner().head_delay = delay;
    }

    pub fn head_count(&self) -> usize {
        self.inner().head_count
    }

    pub fn get_count(&self) -> usize {
        self.inner().get_count
    }

    pub fn put_count(&self) -> usize {
        self.inner().put_count
    }

    /// Tags recorded on the last write of `key`.
    pub fn tagging(&self, key: &str) -> Option<String> {
        self.inner().objects.get(key).and_then(|o| o.tagging.clone())
    }

    /// Keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.inner().objects.keys().cloned().collect()
    }

    fn check(&self, inner: &Inner, key: &str, op: Operation) -> Result<()> {
        if inner.failures.contains(&(key.to_string(), op)) {
            return Err(StorageError::backend(op, &self.bucket, key, "injected failure"));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner();
        inner.get_count += 1;
        self.check(&inner, key, Operation::Get)?;
        inner
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(&self.bucket, key))
    }

    fn put(&self, key: &str, data: &[u8], options: &PutOptions) -> Result<()> {
        let mut inner = self.inner();
        inner.put_count += 1;
        self.check(&inner, key, Operation::Put)?;
        let object = inner.objects.entry(key.to_string()).or_default();
        object.data = data.to_vec();
        object.tagging = options.tagging.clone();
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner();
        self.check(&inner, key, Operation::Delete)?;
        inner.objects.remove(key);
        Ok(())
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        let delay = {
            let mut inner = self.inner();
            inner.head_count += 1;
            inner.head_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut inner = self.inner();
        self.check(&inner, key, Operation::Head)?;
        let (size, metadata) = match inner.objects.get(key) {
            Some(object) => (object.data.len() as u64, object.metadata.clone()),
            None => return Err(StorageError::not_found(&self.bucket, key)),
        };
        let replication_status = inner
            .replication
            .get_mut(key)
            .and_then(ReplicationScript::next);

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            replication_status,
            metadata,
        })
    }

    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner();
        self.check(&inner, prefix, Operation::List)?;
        let mut prefixes: Vec<String> = inner
            .objects
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                let (child, _) = rest.split_once('/')?;
                Some(format!("{prefix}{child}/"))
            })
            .collect();
        prefixes.dedup();
        Ok(prefixes)
    }

    fn replace_metadata(&self, key: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        let mut inner = self.inner();
        self.check(&inner, key, Operation::ReplaceMetadata)?;
        match inner.objects.get_mut(key) {
            Some(object) => {
                object.metadata = metadata.clone();
                Ok(())
            }
            None => Err(StorageError::not_found(&self.bucket, key)),
        }
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
