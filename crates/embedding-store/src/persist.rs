use crate::error::Result;
use crate::store::LifecycleMetadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub(crate) struct PersistedStoreV1 {
    pub schema_version: u32,
    pub embeddings: BTreeMap<String, Vec<f32>>,
    pub lifecycle: LifecycleMetadata,
}

pub(crate) fn encode(
    embeddings: &HashMap<String, Vec<f32>>,
    lifecycle: &LifecycleMetadata,
) -> Result<Vec<u8>> {
    let persisted = PersistedStoreV1 {
        schema_version: STORE_SCHEMA_VERSION,
        embeddings: embeddings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        lifecycle: lifecycle.clone(),
    };
    Ok(rmp_serde::to_vec_named(&persisted)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<(HashMap<String, Vec<f32>>, LifecycleMetadata)> {
    let persisted: PersistedStoreV1 = rmp_serde::from_slice(bytes)?;
    Ok((
        persisted.embeddings.into_iter().collect(),
        persisted.lifecycle,
    ))
}

/// Write `bytes` to `path` through a sibling temp file and rename, so a
/// crash mid-write never leaves a partial store behind.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("msgpack.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp, perms).await?;
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    Ok(())
}

/// Move a file the decoder rejected out of the way so the next save does
/// not clobber evidence, then let the caller start empty.
pub(crate) async fn quarantine_corrupt(path: &Path) {
    let aside = path.with_extension("msgpack.corrupt");
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => log::warn!(
            "embedding store was corrupt; moved aside to {}",
            aside.display()
        ),
        Err(err) => log::warn!("failed to move corrupt embedding store aside: {err}"),
    }
}
