use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const DOCUMENTS_DIR: &str = "documents";

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub sha256: String,
    pub size_bytes: u64,
    /// Path relative to the workspace root.
    pub stored_path: String,
    pub already_present: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn stored_name(digest: &str, src: &Path) -> String {
    match src
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
    {
        Some(ext) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{}.{}", digest, ext)
        }
        _ => digest.to_string(),
    }
}

/// Copies `src` into the workspace document store, addressed by content hash.
/// Content that is already stored is not written again.
pub fn store_file(workspace: &Path, src: &Path) -> anyhow::Result<StoredDocument> {
    if !src.is_file() {
        return Err(anyhow!("document not found: {}", src.to_string_lossy()));
    }
    let bytes = std::fs::read(src)
        .with_context(|| format!("failed to read {}", src.to_string_lossy()))?;
    let digest = sha256_hex(&bytes);

    let shard = &digest[..2];
    let dir: PathBuf = workspace.join(DOCUMENTS_DIR).join(shard);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.to_string_lossy()))?;

    let name = stored_name(&digest, src);
    let dst = dir.join(&name);
    let already_present = dst.is_file();
    if !already_present {
        let tmp = dir.join(format!("{}.partial", name));
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
        std::fs::rename(&tmp, &dst)
            .with_context(|| format!("failed to move document to {}", dst.to_string_lossy()))?;
    }

    Ok(StoredDocument {
        sha256: digest.clone(),
        size_bytes: bytes.len() as u64,
        stored_path: format!("{}/{}/{}", DOCUMENTS_DIR, shard, name),
        already_present,
    })
}
