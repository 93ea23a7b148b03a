//! Durable storage of the cluster config snapshot (`nodes.conf`).
//!
//! Writes go to a temporary file next to the target, which is synced and
//! then renamed over it, so a crash leaves either the old or the new file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cinder_cluster::{ClusterSnapshot, ConfigParseError};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Parse(#[from] ConfigParseError),
}

/// Loads the snapshot at `path`. A missing file is not an error.
pub fn load(path: &Path) -> Result<Option<ClusterSnapshot>, PersistError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(ClusterSnapshot::parse(&text)?))
}

/// Atomically replaces `path` with the snapshot. With `fsync` the rename
/// itself is made durable too.
pub fn save(path: &Path, snapshot: &ClusterSnapshot, fsync: bool) -> io::Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(snapshot.to_nodes_conf().as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if fsync {
        sync_parent(path)?;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "nodes.conf".into());
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
