//! JSON file channel store
//!
//! Manages a JSON file mapping channel IDs to channel records. All writes use
//! atomic temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes concurrent writes from the request path, quota flushes and the
//! background refresh task; the lock is held across the file write so two
//! partial updates can never interleave and drop each other's fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use channel_auth::Credential;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::{ChannelRecord, HealthRecord, QuotaRecord};
use crate::{ChannelStore, StoreFuture};

/// File-backed `ChannelStore`.
pub struct JsonChannelStore {
    path: PathBuf,
    state: Mutex<HashMap<String, ChannelRecord>>,
}

impl JsonChannelStore {
    /// Load channel records from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// channels).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading channel file: {e}")))?;
            let records: HashMap<String, ChannelRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing channel file: {e}")))?;
            info!(path = %path.display(), channels = records.len(), "loaded channel records");
            records
        } else {
            info!(path = %path.display(), "channel file not found, starting with empty store");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `apply` to an existing record and persist.
    async fn update<F>(&self, channel_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ChannelRecord),
    {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(channel_id)
            .ok_or_else(|| Error::NotFound(format!("channel {channel_id} not in store")))?;
        apply(record);
        write_atomic(&self.path, &state).await
    }
}

impl ChannelStore for JsonChannelStore {
    fn load_channel<'a>(&'a self, channel_id: &'a str) -> StoreFuture<'a, Option<ChannelRecord>> {
        Box::pin(async move { Ok(self.state.lock().await.get(channel_id).cloned()) })
    }

    fn save_channel(&self, record: ChannelRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            debug!(channel_id = %record.id, "saved channel record");
            state.insert(record.id.clone(), record);
            write_atomic(&self.path, &state).await
        })
    }

    fn update_credential<'a>(
        &'a self,
        channel_id: &'a str,
        credential: Credential,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.update(channel_id, move |r| r.credential = credential))
    }

    fn update_quota<'a>(&'a self, channel_id: &'a str, quota: QuotaRecord) -> StoreFuture<'a, ()> {
        Box::pin(self.update(channel_id, move |r| r.quota = quota))
    }

    fn update_health<'a>(
        &'a self,
        channel_id: &'a str,
        health: HealthRecord,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.update(channel_id, move |r| r.health = health))
    }

    fn set_active<'a>(&'a self, channel_id: &'a str, active: bool) -> StoreFuture<'a, ()> {
        Box::pin(self.update(channel_id, move |r| r.active = active))
    }
}

/// Write records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file contains OAuth
/// refresh tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, ChannelRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing channel records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("channel file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".channels.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp channel file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting channel file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp channel file: {e}")))?;

    debug!(path = %path.display(), "persisted channel records");
    Ok(())
}
