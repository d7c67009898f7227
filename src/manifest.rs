use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Extensions precached from a build directory, matching the asset classes
/// the application shell ships with.
const PRECACHE_EXTENSIONS: &[&str] = &[
    "html", "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "json", "woff", "woff2", "ttf",
    "eot",
];

/// Files above this size are left to runtime caching instead of install-time
/// precaching.
const MAX_PRECACHE_FILE_BYTES: u64 = 2 * 1024 * 1024;

const REVISION_PARAM: &str = "__shellcache_rev";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    #[serde(default)]
    pub revision: Option<String>,
}

impl ManifestEntry {
    /// The URL actually fetched during install. The revision rides along as a
    /// cache-busting query parameter; the response is stored under the bare URL.
    pub fn request_url(&self) -> String {
        match &self.revision {
            Some(revision) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}{}={}", self.url, separator, REVISION_PARAM, revision)
            }
            None => self.url.clone(),
        }
    }
}

/// The ordered precache list consumed at install time. Immutable for the
/// lifetime of one worker version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheManifest {
    entries: Vec<ManifestEntry>,
}

impl PrecacheManifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Normalizes raw entries: URLs gain a leading `/` when missing, an
    /// `index.html` entry is aliased to also cover `/`, and duplicate URLs
    /// keep their first occurrence.
    pub fn from_entries(raw: Vec<ManifestEntry>) -> Self {
        let mut entries = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();

        for mut entry in raw {
            if !entry.url.starts_with('/') {
                entry.url = format!("/{}", entry.url);
            }
            let alias = if entry.url == "/index.html" {
                Some(ManifestEntry {
                    url: "/".to_string(),
                    revision: entry.revision.clone(),
                })
            } else {
                None
            };
            if seen.insert(entry.url.clone()) {
                entries.push(entry);
            }
            if let Some(alias) = alias
                && seen.insert(alias.url.clone())
            {
                entries.push(alias);
            }
        }

        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read precache manifest {}", path.display()))?;
        let raw: Vec<ManifestEntry> = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse precache manifest {}", path.display()))?;
        Ok(Self::from_entries(raw))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries)?;
        fs::write(path, data)
            .with_context(|| format!("failed to write precache manifest {}", path.display()))?;
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks a build directory and produces a manifest with blake3 content
    /// revisions. Names in `skip_names` (the manifest itself, deploy
    /// artifacts) and oversized files are left out.
    pub fn generate(dir: &Path, skip_names: &[&str]) -> Result<Self> {
        ensure!(
            dir.is_dir(),
            "manifest source {} is not a directory",
            dir.display()
        );

        let mut files = Vec::new();
        collect_files(dir, &mut files)?;
        files.sort();

        let mut raw = Vec::new();
        for path in files {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if skip_names.contains(&name) {
                continue;
            }
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase());
            let precacheable = extension
                .as_deref()
                .map(|ext| PRECACHE_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !precacheable {
                continue;
            }
            let metadata = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if metadata.len() > MAX_PRECACHE_FILE_BYTES {
                tracing::warn!(
                    path = %path.display(),
                    size = metadata.len(),
                    "skipping oversized file from precache manifest"
                );
                continue;
            }
            let contents = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let revision = blake3::hash(&contents).to_hex().to_string();
            let url = relative_url(dir, &path)?;
            raw.push(ManifestEntry {
                url,
                revision: Some(revision),
            });
        }

        Ok(Self::from_entries(raw))
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn relative_url(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} escapes manifest root", path.display()))?;
    let mut url = String::new();
    for component in relative.components() {
        url.push('/');
        url.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(url)
}
