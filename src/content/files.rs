//! The files a content node serves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::membership::types::NodeId;

/// Snapshot of the servable files in one directory, taken at startup.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    dir: PathBuf,
    files: BTreeMap<String, u64>,
}

impl LocalFiles {
    /// Scans `dir`, creating it if needed. Names that cannot travel as a
    /// single protocol token are skipped. When nothing is found and
    /// `create_samples` is set, a few sample files are written first.
    pub async fn scan(dir: &Path, node: &NodeId, create_samples: bool) -> Result<Self> {
        if !tokio::fs::try_exists(dir).await? {
            tokio::fs::create_dir_all(dir).await?;
            tracing::info!("Created files directory {}", dir.display());
        }

        let mut files = read_catalog(dir).await?;

        if files.is_empty() && create_samples {
            tracing::info!("No files found in {}, creating samples", dir.display());
            for (name, content) in sample_files(node) {
                tokio::fs::write(dir.join(&name), &content).await?;
                tracing::info!("Created sample file {} ({} bytes)", name, content.len());
            }
            files = read_catalog(dir).await?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a catalogued file. Only names found by the scan resolve, so
    /// a request can never escape the directory.
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.files.contains_key(name).then(|| self.dir.join(name))
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.files.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `(name, size)` pairs sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.files.iter().map(|(name, size)| (name.as_str(), *size))
    }
}

async fn read_catalog(dir: &Path) -> Result<BTreeMap<String, u64>> {
    let mut files = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            tracing::warn!("Skipping {:?}: names cannot contain whitespace", name);
            continue;
        }

        tracing::debug!("Found file {} ({} bytes)", name, metadata.len());
        files.insert(name, metadata.len());
    }

    Ok(files)
}

fn sample_files(node: &NodeId) -> Vec<(String, Vec<u8>)> {
    vec![
        (
            format!("sample_{}_1.txt", node),
            format!("Hello from content node {}!\nThis is sample file 1.\n", node).into_bytes(),
        ),
        (
            format!("sample_{}_2.txt", node),
            {
                let mut content = format!("Sample file 2 content from {}", node).into_bytes();
                content.extend(std::iter::repeat_n(b'\n', 100));
                content
            },
        ),
        (
            "shared_file.txt".to_string(),
            "This file might be on multiple servers.\n"
                .repeat(50)
                .into_bytes(),
        ),
    ]
}
