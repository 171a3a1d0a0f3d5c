//! Read-only workspace projection and the content-addressed snapshot store.
//!
//! Workspaces are directories of batch-job outputs. Each carries a
//! `metadata/manifest.json` listing its outputs with size/timestamp/hash;
//! files missing from the manifest (logs etc.) fall back to a disk stat plus
//! a fresh hash. Request snapshots live outside the workspace, keyed by
//! sha256, so later workspace changes never affect files under review.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use airlock_core::{
    AirlockError, ContentHash, FileMetadata, RelPath, RequestId, WorkspaceFileStatus,
};

use crate::store::{RequestDetail, StoreError};

/// Read-only view over the workspace directory tree.
#[derive(Clone)]
pub struct WorkspaceStore {
    workspace_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    outputs: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    size: u64,
    timestamp: i64,
    content_hash: String,
}

/// One child of a workspace directory listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub relpath: String,
    pub is_dir: bool,
    pub metadata: Option<FileMetadata>,
    pub status: Option<WorkspaceFileStatus>,
}

impl WorkspaceStore {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }

    fn root(&self, workspace: &str) -> Result<PathBuf, StoreError> {
        // workspace names come from identity data, but stay defensive
        if workspace.is_empty() || workspace.contains('/') || workspace.contains("..") {
            return Err(AirlockError::NotFound(format!("workspace {workspace}")).into());
        }
        let root = self.workspace_dir.join(workspace);
        if !root.is_dir() {
            return Err(AirlockError::NotFound(format!("workspace {workspace}")).into());
        }
        Ok(root)
    }

    pub fn exists(&self, workspace: &str) -> bool {
        self.root(workspace).is_ok()
    }

    fn manifest(&self, workspace: &str) -> Result<Manifest, StoreError> {
        let path = self.root(workspace)?.join("metadata/manifest.json");
        let raw = fs::read_to_string(&path)
            .map_err(|e| StoreError::storage("read manifest", format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::storage("parse manifest", format!("{}: {e}", path.display())))
    }

    /// Absolute path of a workspace file; the path must exist.
    pub fn abspath(&self, workspace: &str, relpath: &RelPath) -> Result<PathBuf, StoreError> {
        let path = relpath.under(&self.root(workspace)?);
        if !path.is_file() {
            return Err(AirlockError::NotFound(format!("{workspace}/{relpath}")).into());
        }
        Ok(path)
    }

    /// Size, mtime and content hash for a file. Manifest data wins; files not
    /// in the manifest are measured from disk.
    pub fn file_metadata(
        &self,
        workspace: &str,
        relpath: &RelPath,
    ) -> Result<FileMetadata, StoreError> {
        if let Ok(manifest) = self.manifest(workspace) {
            if let Some(entry) = manifest.outputs.get(relpath.as_str()) {
                return Ok(FileMetadata {
                    size: entry.size,
                    timestamp: entry.timestamp,
                    content_hash: ContentHash(entry.content_hash.clone()),
                });
            }
        }

        let path = self.abspath(workspace, relpath)?;
        let meta = fs::metadata(&path).map_err(|e| StoreError::storage("stat file", e))?;
        let timestamp = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileMetadata {
            size: meta.len(),
            timestamp,
            content_hash: hash_file(&path)?,
        })
    }

    pub fn read_bytes(&self, workspace: &str, relpath: &RelPath) -> Result<Vec<u8>, StoreError> {
        let path = self.abspath(workspace, relpath)?;
        fs::read(&path).map_err(|e| StoreError::storage("read file", e))
    }

    /// Ordered children of `path` (or the root) with metadata for files.
    /// The `metadata/` directory itself is not part of the projection.
    pub fn list(
        &self,
        workspace: &str,
        path: Option<&RelPath>,
    ) -> Result<Vec<WorkspaceEntry>, StoreError> {
        let root = self.root(workspace)?;
        let dir = match path {
            Some(p) => {
                let dir = p.under(&root);
                if !dir.is_dir() {
                    return Err(AirlockError::NotFound(format!("{workspace}/{p}")).into());
                }
                dir
            }
            None => root.clone(),
        };

        let mut entries = Vec::new();
        let read_dir = fs::read_dir(&dir).map_err(|e| StoreError::storage("list directory", e))?;
        for entry in read_dir {
            let entry = entry.map_err(|e| StoreError::storage("list directory", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_none() && name == "metadata" {
                continue;
            }
            let is_dir = entry
                .file_type()
                .map_err(|e| StoreError::storage("list directory", e))?
                .is_dir();
            let relpath = match path {
                Some(p) => format!("{}/{}", p.as_str(), name),
                None => name.clone(),
            };
            let metadata = if is_dir {
                None
            } else {
                let rel = RelPath::new(relpath.clone()).map_err(StoreError::Domain)?;
                Some(self.file_metadata(workspace, &rel)?)
            };
            entries.push(WorkspaceEntry {
                name,
                relpath,
                is_dir,
                metadata,
                status: None,
            });
        }
        entries.sort_by(|a, b| (b.is_dir, &a.name).cmp(&(a.is_dir, &b.name)));
        Ok(entries)
    }
}

/// Derive the "status relative to the current request" field for a workspace
/// file, from its metadata, the viewer's current request, and the set of
/// content hashes previously released from this workspace.
pub fn status_relative_to(
    metadata: &FileMetadata,
    relpath: &RelPath,
    current_request: Option<&RequestDetail>,
    released_hashes: &BTreeSet<String>,
) -> Option<WorkspaceFileStatus> {
    if released_hashes.contains(metadata.content_hash.as_str()) {
        return Some(WorkspaceFileStatus::Released);
    }
    let detail = current_request?;
    let file = detail.file(relpath)?;
    if file.is_withdrawn() {
        Some(WorkspaceFileStatus::Withdrawn)
    } else if file.content_hash == metadata.content_hash {
        Some(WorkspaceFileStatus::UnderReview)
    } else {
        Some(WorkspaceFileStatus::Updated)
    }
}

/// Content-addressed storage for request file snapshots.
///
/// Bytes are staged under a temporary name, hashed, then renamed to the hash,
/// so a crash can never leave a partially-written blob under its final name.
#[derive(Clone)]
pub struct SnapshotStore {
    request_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(request_dir: PathBuf) -> Self {
        Self { request_dir }
    }

    fn request_root(&self, workspace: &str, request: &RequestId) -> PathBuf {
        self.request_dir.join(workspace).join(request.as_str())
    }

    /// Copy `src` into the request's snapshot directory. Returns the content
    /// hash and size of the stored bytes.
    pub fn store(
        &self,
        workspace: &str,
        request: &RequestId,
        src: &Path,
    ) -> Result<(ContentHash, u64), StoreError> {
        let root = self.request_root(workspace, request);
        fs::create_dir_all(&root).map_err(|e| StoreError::storage("create snapshot dir", e))?;

        let tmp_path = root.join(format!(".staging-{}", uuid::Uuid::new_v4()));
        let mut reader =
            fs::File::open(src).map_err(|e| StoreError::storage("open source file", e))?;
        let mut writer =
            fs::File::create(&tmp_path).map_err(|e| StoreError::storage("create staging file", e))?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| StoreError::storage("read source file", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer
                .write_all(&buf[..n])
                .map_err(|e| StoreError::storage("write staging file", e))?;
            size += n as u64;
        }
        writer
            .sync_all()
            .map_err(|e| StoreError::storage("sync staging file", e))?;
        drop(writer);

        let digest = format!("{:x}", hasher.finalize());
        let final_path = root.join(&digest);
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| StoreError::storage("finalize snapshot", e))?;

        Ok((ContentHash(digest), size))
    }

    /// Path to a stored snapshot. Errors if the blob is missing.
    pub fn path_for(
        &self,
        workspace: &str,
        request: &RequestId,
        content_hash: &ContentHash,
    ) -> Result<PathBuf, StoreError> {
        let path = self
            .request_root(workspace, request)
            .join(content_hash.as_str());
        if !path.is_file() {
            return Err(AirlockError::NotFound(format!(
                "snapshot {content_hash} for request {request}"
            ))
            .into());
        }
        Ok(path)
    }

    pub fn read(
        &self,
        workspace: &str,
        request: &RequestId,
        content_hash: &ContentHash,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(workspace, request, content_hash)?;
        fs::read(&path).map_err(|e| StoreError::storage("read snapshot", e))
    }
}

fn hash_file(path: &Path) -> Result<ContentHash, StoreError> {
    let mut file = fs::File::open(path).map_err(|e| StoreError::storage("open file", e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| StoreError::storage("hash file", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_workspace_file(root: &Path, workspace: &str, relpath: &str, contents: &[u8]) {
        let path = root.join(workspace).join(relpath);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn write_manifest(root: &Path, workspace: &str, entries: &[(&str, u64, &str)]) {
        let outputs: BTreeMap<String, serde_json::Value> = entries
            .iter()
            .map(|(relpath, size, hash)| {
                (
                    relpath.to_string(),
                    serde_json::json!({
                        "size": size,
                        "timestamp": 1_700_000_000,
                        "content_hash": hash,
                    }),
                )
            })
            .collect();
        let manifest = serde_json::json!({ "outputs": outputs });
        let path = root.join(workspace).join("metadata/manifest.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string(&manifest).unwrap()).unwrap();
    }

    #[test]
    fn test_metadata_prefers_manifest() {
        let dir = TempDir::new().unwrap();
        write_workspace_file(dir.path(), "ws1", "output/a.csv", b"1,2,3\n");
        write_manifest(dir.path(), "ws1", &[("output/a.csv", 6, "manifesthash")]);

        let ws = WorkspaceStore::new(dir.path().to_path_buf());
        let rel = RelPath::new("output/a.csv").unwrap();
        let meta = ws.file_metadata("ws1", &rel).unwrap();
        assert_eq!(meta.content_hash.as_str(), "manifesthash");
        assert_eq!(meta.size, 6);
    }

    #[test]
    fn test_metadata_falls_back_to_disk() {
        let dir = TempDir::new().unwrap();
        write_workspace_file(dir.path(), "ws1", "logs/run.log", b"started\n");
        write_manifest(dir.path(), "ws1", &[]);

        let ws = WorkspaceStore::new(dir.path().to_path_buf());
        let rel = RelPath::new("logs/run.log").unwrap();
        let meta = ws.file_metadata("ws1", &rel).unwrap();
        assert_eq!(meta.size, 8);
        // sha256 of "started\n"
        assert_eq!(meta.content_hash.as_str().len(), 64);
    }

    #[test]
    fn test_missing_workspace_and_file() {
        let dir = TempDir::new().unwrap();
        let ws = WorkspaceStore::new(dir.path().to_path_buf());
        let rel = RelPath::new("a.csv").unwrap();
        assert!(matches!(
            ws.abspath("nope", &rel),
            Err(StoreError::Domain(AirlockError::NotFound(_)))
        ));

        write_manifest(dir.path(), "ws1", &[]);
        assert!(matches!(
            ws.abspath("ws1", &rel),
            Err(StoreError::Domain(AirlockError::NotFound(_)))
        ));
    }

    #[test]
    fn test_list_skips_metadata_and_orders_dirs_first() {
        let dir = TempDir::new().unwrap();
        write_workspace_file(dir.path(), "ws1", "output/a.csv", b"x");
        write_workspace_file(dir.path(), "ws1", "readme.txt", b"y");
        write_manifest(dir.path(), "ws1", &[]);

        let ws = WorkspaceStore::new(dir.path().to_path_buf());
        let entries = ws.list("ws1", None).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["output", "readme.txt"]);
        assert!(entries[0].is_dir);
        assert!(entries[1].metadata.is_some());
    }

    #[test]
    fn test_snapshot_store_round_trip() {
        let dir = TempDir::new().unwrap();
        write_workspace_file(dir.path(), "ws1", "output/a.csv", b"1,2,3\n");

        let snapshots = SnapshotStore::new(dir.path().join("requests"));
        let request = RequestId::from("r1");
        let src = dir.path().join("ws1/output/a.csv");
        let (hash, size) = snapshots.store("ws1", &request, &src).unwrap();
        assert_eq!(size, 6);

        let bytes = snapshots.read("ws1", &request, &hash).unwrap();
        assert_eq!(bytes, b"1,2,3\n");

        // later workspace changes don't touch the snapshot
        fs::write(&src, b"9,9,9,9\n").unwrap();
        let bytes = snapshots.read("ws1", &request, &hash).unwrap();
        assert_eq!(bytes, b"1,2,3\n");

        assert!(snapshots
            .path_for("ws1", &request, &ContentHash::from("missing"))
            .is_err());
    }

    #[test]
    fn test_status_relative_to_released() {
        let meta = FileMetadata {
            size: 1,
            timestamp: 0,
            content_hash: ContentHash::from("h1"),
        };
        let rel = RelPath::new("output/a.csv").unwrap();
        let released: BTreeSet<String> = ["h1".to_string()].into();
        assert_eq!(
            status_relative_to(&meta, &rel, None, &released),
            Some(WorkspaceFileStatus::Released)
        );
        assert_eq!(status_relative_to(&meta, &rel, None, &BTreeSet::new()), None);
    }
}
