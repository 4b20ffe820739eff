use publisher_storage::{ObjectStore, Result, join_key};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where repository metadata lives in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryLayout {
    /// Folder holding one subfolder per APT distribution.
    pub apt_dists: String,
    /// Package index below each APT distribution.
    pub apt_package_index: String,
    /// RPM repository roots laid out as `<distro>/<version>/<arch>/`.
    pub rpm_roots: Vec<String>,
}

impl Default for RepositoryLayout {
    fn default() -> Self {
        Self {
            apt_dists: "infrastructure_agent/linux/apt/dists/".to_string(),
            apt_package_index: "main/binary-amd64/Packages.bz2".to_string(),
            rpm_roots: vec![
                "infrastructure_agent/linux/yum/".to_string(),
                "infrastructure_agent/linux/zypp/".to_string(),
            ],
        }
    }
}

/// List the metadata keys whose replication gates a cache purge: the APT
/// package index of every distribution and `repodata/repomd.xml` of every
/// RPM distro, version and architecture.
pub fn discover_replication_keys(
    store: &dyn ObjectStore,
    layout: &RepositoryLayout,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();

    for dist in store.list_prefixes(&folder(&layout.apt_dists))? {
        keys.push(join_key(&[&dist, &layout.apt_package_index]));
    }

    for root in &layout.rpm_roots {
        for distro in store.list_prefixes(&folder(root))? {
            for version in store.list_prefixes(&distro)? {
                for arch in store.list_prefixes(&version)? {
                    keys.push(format!("{arch}repodata/repomd.xml"));
                }
            }
        }
    }

    debug!(count = keys.len(), "discovered replication keys");
    Ok(keys)
}

fn folder(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
