//! Target list backed by a Prometheus file-based service discovery document
//!
//! The document is a JSON array with one target group per instance:
//!
//! ```json
//! [{ "targets": ["10.0.1.5:9100"], "labels": { "instance_id": "i-123" } }]
//! ```
//!
//! Prometheus watches the file, so every write goes to a fresh temporary
//! file in the same directory that is then renamed over the document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use nodesync_core::config::TargetsConfig;
use nodesync_core::models::InstanceId;
use nodesync_core::resilience::timeout;
use nodesync_core::{Error, Result};

use super::targets::TargetListAdapter;

/// Label identifying the instance a target group belongs to
pub const INSTANCE_ID_LABEL: &str = "instance_id";

/// One `file_sd` target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetGroup {
    fn instance_id(&self) -> Option<&str> {
        self.labels.get(INSTANCE_ID_LABEL).map(String::as_str)
    }
}

/// Prometheus `file_sd` target registry
pub struct FileSdTargetList {
    path: PathBuf,
    port: u16,
    static_labels: BTreeMap<String, String>,
    timeout: Duration,
    /// Serializes read-modify-write cycles on the document. The guard travels
    /// with the blocking write, so a timed-out write still holds it.
    write_lock: Arc<Mutex<()>>,
}

impl FileSdTargetList {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, port: u16, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            port,
            static_labels: BTreeMap::new(),
            timeout,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn from_config(config: &TargetsConfig) -> Self {
        Self::new(
            config.file_sd_path.clone(),
            config.port,
            Duration::from_secs(config.timeout_secs),
        )
        .with_static_labels(&config.labels)
    }

    #[must_use]
    pub fn with_static_labels(mut self, labels: &HashMap<String, String>) -> Self {
        self.static_labels = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current target groups
    pub async fn groups(&self) -> Result<Vec<TargetGroup>> {
        read_document(&self.path).await
    }

    fn group_for(&self, instance_id: &InstanceId, address: IpAddr) -> TargetGroup {
        let mut labels = self.static_labels.clone();
        labels.insert(INSTANCE_ID_LABEL.to_string(), instance_id.to_string());
        TargetGroup {
            targets: vec![SocketAddr::new(address, self.port).to_string()],
            labels,
        }
    }

    /// Apply `change` to the document, writing only when it reports a modification
    async fn modify<F>(&self, operation: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<TargetGroup>) -> bool + Send,
    {
        timeout::bounded(self.timeout, operation, async {
            let guard = Arc::clone(&self.write_lock).lock_owned().await;

            let mut groups = read_document(&self.path).await?;
            if !change(&mut groups) {
                return Ok(());
            }
            groups.sort_by(|a, b| a.instance_id().cmp(&b.instance_id()));
            write_document(self.path.clone(), &groups, guard).await
        })
        .await
    }
}

#[async_trait]
impl TargetListAdapter for FileSdTargetList {
    async fn upsert_target(&self, instance_id: &InstanceId, address: IpAddr) -> Result<()> {
        let group = self.group_for(instance_id, address);

        self.modify("upsert target", move |groups| {
            match groups
                .iter_mut()
                .find(|g| g.instance_id() == Some(instance_id.as_str()))
            {
                Some(existing) if *existing == group => false,
                Some(existing) => {
                    *existing = group;
                    true
                }
                None => {
                    groups.push(group);
                    true
                }
            }
        })
        .await
    }

    async fn remove_target(&self, instance_id: &InstanceId) -> Result<()> {
        self.modify("remove target", |groups| {
            let before = groups.len();
            groups.retain(|g| g.instance_id() != Some(instance_id.as_str()));
            groups.len() != before
        })
        .await
    }
}

async fn read_document(path: &Path) -> Result<Vec<TargetGroup>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from_io(&format!("reading {}", path.display()), &e)),
    };

    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&raw).map_err(|e| {
        Error::Permanent(format!("corrupt target document {}: {e}", path.display()))
    })
}

async fn write_document(
    path: PathBuf,
    groups: &[TargetGroup],
    guard: OwnedMutexGuard<()>,
) -> Result<()> {
    let body = serde_json::to_vec_pretty(groups)
        .map_err(|e| Error::Permanent(format!("failed to encode target document: {e}")))?;

    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        persist_atomically(&path, &body)
    })
    .await
    .map_err(|e| Error::Permanent(format!("target document writer panicked: {e}")))?
}

fn persist_atomically(path: &Path, body: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::from_io(&format!("creating {}", parent.display()), &e))?;

    let writing = format!("writing temporary file in {}", parent.display());
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::from_io(&writing, &e))?;
    tmp.write_all(body).map_err(|e| Error::from_io(&writing, &e))?;
    tmp.as_file().sync_all().map_err(|e| Error::from_io(&writing, &e))?;

    // temp files are created 0600; Prometheus usually runs as another user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::from_io(&writing, &e))?;
    }

    tmp.persist(path)
        .map(|_| ())
        .map_err(|e| Error::from_io(&format!("renaming into {}", path.display()), &e.error))
}
