use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use tempfile::TempDir;

use crate::error::Result;
use crate::model::Artifact;

/// Scratch directory owned by exactly one search. Dropping it removes every
/// intermediate probe artifact, whichever way the search exits.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    next: AtomicU32,
}

impl Workspace {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("media-compressor-")
            .tempdir()?;
        debug!("Created workspace {:?}", dir.path());
        Ok(Self {
            dir,
            next: AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh path for one probe output.
    pub fn probe_path(&self, extension: &str) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("probe_{:03}.{}", n, extension))
    }

    /// Resolves a source to a path on disk, copying in-memory bytes into the workspace.
    pub fn materialize(&self, source: &Artifact, extension: &str) -> Result<PathBuf> {
        match source {
            Artifact::File(path) => Ok(path.clone()),
            Artifact::Memory(bytes) => {
                let path = self.dir.path().join(format!("input.{}", extension));
                std::fs::write(&path, bytes.as_slice())?;
                Ok(path)
            }
        }
    }

    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to clean up workspace {:?}: {}", path, e);
        } else {
            debug!("Cleaned up workspace {:?}", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let ws = Workspace::create().unwrap();
        let root = ws.path().to_path_buf();
        let probe = ws.probe_path("pdf");
        std::fs::write(&probe, b"x").unwrap();
        drop(ws);
        assert!(!root.exists());
    }

    #[test]
    fn probe_paths_are_unique() {
        let ws = Workspace::create().unwrap();
        assert_ne!(ws.probe_path("mp4"), ws.probe_path("mp4"));
        ws.close();
    }

    #[test]
    fn materializes_memory_sources() {
        let ws = Workspace::create().unwrap();
        let path = ws
            .materialize(&Artifact::from_bytes(b"%PDF-1.4".to_vec()), "pdf")
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.4");
    }
}
