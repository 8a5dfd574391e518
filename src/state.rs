//! File based service discovery output.
//!
//! Every active job is mirrored into `<dir>/<job>.yml` in the format of
//! Prometheus `file_sd_configs`, so a local Prometheus can scrape the same
//! targets the mesh is probing.  Removed jobs are not deleted right away,
//! their file is renamed to `<job>.yml.bak` so it can be restored by hand.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::store::Observer;
use crate::types::{MeshEntry, Status, TargetGroup};

const HEADER: &str = "# This file is generated by gossiping, DO NOT EDIT IT\n\n";

pub struct StateWriter {
    dir: PathBuf,
}

impl StateWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn filename(&self, job: &str) -> Option<PathBuf> {
        if job.is_empty() || job.contains(['/', '\\']) || job.contains("..") {
            return None;
        }

        Some(self.dir.join(format!("{job}.yml")))
    }

    async fn update(&self, path: &Path, group: &TargetGroup) -> anyhow::Result<()> {
        let mut content = HEADER.to_string();
        content.push_str(&serde_yaml::to_string(&[group])?);

        // write aside and rename, so readers never see half a file
        let tmp = path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn backup(&self, path: &Path) -> anyhow::Result<()> {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");

        match tokio::fs::rename(path, &backup).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Observer for StateWriter {
    async fn on_update(&self, entry: Arc<MeshEntry>) {
        let Some(path) = self.filename(&entry.name) else {
            warn!("Refuse to write state file for job {:?}", entry.name);
            return;
        };

        let result = match (entry.status, &entry.target_group) {
            (Status::Active, Some(group)) => self.update(&path, group).await,
            (Status::Active, None) => self.update(&path, &TargetGroup::default()).await,
            (Status::Inactive, _) => self.backup(&path).await,
        };

        match result {
            Ok(()) => debug!("State file {} synced", path.display()),
            Err(err) => warn!("Sync state file {} failed: {}", path.display(), err),
        }
    }
}
