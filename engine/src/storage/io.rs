use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{fs, io::AsyncWriteExt};

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Reads and deserializes a json file; a missing or empty file yields the
/// type's default instead of an error.
pub async fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Atomically writes json to disk: temp file, fsync, rename. A crash mid-write
/// leaves the previous file intact.
pub async fn write_json_file<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    ensure_parent_dir(path).await?;

    let tmp_path = temp_path(path);
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&serde_json::to_vec_pretty(value)?).await?;
    file.sync_all().await?;

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|name| format!("{}.tmp", name.to_string_lossy()))
        .unwrap_or_else(|| "tmp.json".to_string());
    tmp.set_file_name(file_name);
    tmp
}
