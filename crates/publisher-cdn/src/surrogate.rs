use std::collections::BTreeMap;

use publisher_storage::{ObjectStore, StorageError};
use tracing::info;

/// User metadata key Fastly reads surrogate keys from.
pub const SURROGATE_KEY_METADATA: &str = "surrogate-key";

/// Surrogate key given to repository metadata objects.
pub const DEFAULT_SURROGATE_KEY: &str = "infrastructure_metadata";

/// Replace the user metadata of every key with a single surrogate key so a
/// later purge by that key reaches them. Stops at the first failure.
///
/// Returns how many objects were tagged.
pub fn tag_surrogate_keys(
    store: &dyn ObjectStore,
    keys: &[String],
    surrogate: &str,
) -> Result<usize, StorageError> {
    let metadata = BTreeMap::from([(SURROGATE_KEY_METADATA.to_string(), surrogate.to_string())]);

    let mut tagged = 0;
    for key in keys.iter().filter(|k| !k.is_empty()) {
        store.replace_metadata(key, &metadata)?;
        info!(bucket = store.bucket(), key = %key, surrogate, "set surrogate key");
        tagged += 1;
    }
    Ok(tagged)
}

#[cfg(test)]
mod tests {
    use publisher_storage::{MemoryStorage, Operation, PutOptions};

    use super::*;

    #[test]
    fn replaces_metadata_on_each_key() {
        let store = MemoryStorage::new("downloads");
        let keys = vec![
            "apt/dists/focal/main/binary-amd64/Packages.bz2".to_string(),
            "yum/el/8/x86_64/repodata/repomd.xml".to_string(),
        ];
        for key in &keys {
            store.put(key, b"index", &PutOptions::default()).unwrap();
        }

        let tagged = tag_surrogate_keys(&store, &keys, DEFAULT_SURROGATE_KEY).unwrap();

        assert_eq!(tagged, 2);
        for key in &keys {
            let meta = store.head(key).unwrap();
            assert_eq!(
                meta.metadata.get("surrogate-key").map(String::as_str),
                Some("infrastructure_metadata")
            );
            assert_eq!(store.get(key).unwrap(), b"index");
        }
    }

    #[test]
    fn previous_metadata_is_replaced() {
        let store = MemoryStorage::new("downloads");
        store.put("k", b"", &PutOptions::default()).unwrap();
        tag_surrogate_keys(&store, &["k".to_string()], "first").unwrap();

        tag_surrogate_keys(&store, &["k".to_string()], "second").unwrap();

        let meta = store.head("k").unwrap();
        assert_eq!(meta.metadata.len(), 1);
        assert_eq!(meta.metadata["surrogate-key"], "second");
    }

    #[test]
    fn missing_object_stops_tagging() {
        let store = MemoryStorage::new("downloads");
        store.put("b", b"", &PutOptions::default()).unwrap();

        let err = tag_surrogate_keys(&store, &["a".to_string(), "b".to_string()], "x").unwrap_err();

        assert!(err.is_not_found());
        assert!(store.head("b").unwrap().metadata.is_empty());
    }

    #[test]
    fn backend_failure_is_returned() {
        let store = MemoryStorage::new("downloads");
        store.put("k", b"", &PutOptions::default()).unwrap();
        store.fail_on("k", Operation::ReplaceMetadata);

        assert!(tag_surrogate_keys(&store, &["k".to_string()], "x").is_err());
    }
}
