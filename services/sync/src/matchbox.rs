//! Profiles and groups in the boot-config data directory.
//!
//! Layout under the data directory:
//!
//! - `profiles/<id>.json`: boot parameters and the ignition template to serve
//! - `groups/<id>.json`: selector matching one machine, plus its metadata
//!
//! Files are replaced atomically and left alone when their content is
//! unchanged, so the boot-config service never reads a partial document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use metalcast_reconcile::ContentHash;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Boot {
    pub kernel: String,
    pub initrd: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub ignition_id: String,
    pub boot: Boot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub profile: String,
    pub selector: BTreeMap<String, String>,
    pub metadata: serde_json::Value,
}

/// Result of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Writes profiles and groups below a boot-config data directory.
#[derive(Debug, Clone)]
pub struct MatchboxWriter {
    root: PathBuf,
}

impl MatchboxWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile_path(&self, id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{id}.json"))
    }

    pub fn group_path(&self, id: &str) -> PathBuf {
        self.root.join("groups").join(format!("{id}.json"))
    }

    pub async fn write_profile(&self, profile: &Profile) -> SyncResult<WriteOutcome> {
        let value = serde_json::to_value(profile)?;
        write_if_changed(&self.profile_path(&profile.id), &value).await
    }

    pub async fn write_group(&self, group: &Group) -> SyncResult<WriteOutcome> {
        let value = serde_json::to_value(group)?;
        write_if_changed(&self.group_path(&group.id), &value).await
    }
}

async fn write_if_changed(path: &Path, value: &serde_json::Value) -> SyncResult<WriteOutcome> {
    let wanted = ContentHash::from_json(value);
    if let Some(current) = current_hash(path).await {
        if current == wanted {
            debug!(path = %path.display(), "unchanged");
            return Ok(WriteOutcome::Unchanged);
        }
    }

    let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(SyncError::io(path, std::io::ErrorKind::InvalidInput.into()));
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SyncError::io(dir, e))?;

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| SyncError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SyncError::io(path, e))?;

    info!(path = %path.display(), hash = %wanted, "written");
    Ok(WriteOutcome::Written)
}

/// Hash of the document currently on disk; unreadable files count as absent.
async fn current_hash(path: &Path) -> Option<ContentHash> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    Some(ContentHash::from_json(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(kernel: &str) -> Profile {
        Profile {
            id: "kubernetes_nodes".into(),
            name: "kubernetes_nodes".into(),
            ignition_id: "k8s-node.yaml".into(),
            boot: Boot {
                kernel: kernel.into(),
                initrd: vec!["/assets/initrd".into()],
                args: vec!["coreos.first_boot".into()],
            },
        }
    }

    #[tokio::test]
    async fn writes_once_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MatchboxWriter::new(dir.path());

        assert_eq!(
            writer.write_profile(&profile("/assets/vmlinuz")).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            writer.write_profile(&profile("/assets/vmlinuz")).await.unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            writer.write_profile(&profile("/assets/other")).await.unwrap(),
            WriteOutcome::Written
        );

        let on_disk: serde_json::Value = serde_json::from_slice(
            &std::fs::read(writer.profile_path("kubernetes_nodes")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk["boot"]["kernel"], "/assets/other");
        assert_eq!(on_disk["ignition_id"], "k8s-node.yaml");
    }

    #[tokio::test]
    async fn leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MatchboxWriter::new(dir.path());
        let group = Group {
            id: "kubernetes_nodes-0".into(),
            name: "kubernetes_nodes".into(),
            profile: "kubernetes_nodes".into(),
            selector: BTreeMap::from([("mac".to_string(), "52:54:00:00:00:01".to_string())]),
            metadata: serde_json::json!({"roles": "kubernetes-node"}),
        };
        writer.write_group(&group).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("groups"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["kubernetes_nodes-0.json"]);
    }

    #[tokio::test]
    async fn path_without_file_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_if_changed(&dir.path().join(".."), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
        assert!(!dir.path().join("..tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MatchboxWriter::new(dir.path());
        let path = writer.profile_path("kubernetes_nodes");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        assert_eq!(
            writer.write_profile(&profile("/assets/vmlinuz")).await.unwrap(),
            WriteOutcome::Written
        );
    }
}
