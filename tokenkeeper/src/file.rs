//! A session store persisted to a local file

use std::{
    error, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, sync::watch};

use crate::{InMemorySessionStore, SessionPatch, SessionRecord, SessionStore};

/// A session store that survives restarts by writing the record to a file
///
/// The record is held in memory and written out after every change. Writes
/// are serialized so the file always reflects the latest record. A failed
/// write is logged and does not affect the in-memory session.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    memory: InMemorySessionStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    /// Opens the store, loading any session previously written to `path`
    ///
    /// A missing file yields an empty session.
    pub async fn open(path: PathBuf) -> Result<Self, io::Error> {
        let record = match read_record(&path).await {
            Ok(record) => {
                tracing::debug!(path = %path.display(), "loaded persisted session");
                record
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => SessionRecord::default(),
            Err(err) => return Err(err),
        };

        Ok(Self {
            path,
            memory: InMemorySessionStore::new(record),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

async fn read_record(path: &Path) -> Result<SessionRecord, io::Error> {
    use tokio::io::AsyncReadExt;

    let mut file = OpenOptions::new().read(true).open(path).await?;
    let mut data = String::new();
    file.read_to_string(&mut data).await?;
    let record = serde_json::from_str(&data)?;
    Ok(record)
}

async fn write_record(path: &Path, record: &SessionRecord) -> Result<(), io::Error> {
    use tokio::io::AsyncWriteExt;

    let mut file_opts = OpenOptions::new();

    file_opts.create(true).truncate(true).write(true);

    #[cfg(unix)]
    file_opts.mode(0o600);

    let mut file = file_opts.open(path).await?;
    let data = serde_json::to_string_pretty(record)?;
    file.write_all(data.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn read(&self) -> Arc<SessionRecord> {
        self.memory.read()
    }

    async fn update(&self, patch: SessionPatch) -> Arc<SessionRecord> {
        let _write = self.write_lock.lock().await;
        let record = self.memory.apply(patch);

        if let Err(error) = write_record(&self.path, &record).await {
            tracing::warn!(
                path = %self.path.display(),
                error = (&error as &dyn error::Error),
                "unable to persist session"
            );
        }

        record
    }

    fn subscribe(&self) -> watch::Receiver<Arc<SessionRecord>> {
        self.memory.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use tokenkeeper_clock::UnixTime;

    use super::*;
    use crate::{test_util::identity, AccessToken, RefreshToken, TokenPair};

    fn tokens() -> TokenPair {
        TokenPair::new(
            AccessToken::from_static("a1"),
            RefreshToken::from_static("r1"),
            UnixTime::from_secs(1_700_000_900),
        )
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("session.json"))
            .await
            .unwrap();
        assert_eq!(*store.read(), SessionRecord::default());
    }

    #[tokio::test]
    async fn session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileSessionStore::open(path.clone()).await.unwrap();
        store
            .update(SessionPatch::SignedIn {
                tokens: tokens(),
                identity: identity(),
            })
            .await;
        drop(store);

        let reopened = FileSessionStore::open(path).await.unwrap();
        let record = reopened.read();
        assert_eq!(record.tokens, Some(tokens()));
        assert_eq!(record.identity, Some(identity()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = FileSessionStore::open(path.clone()).await.unwrap();
        store.update(SessionPatch::SignInFailed).await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileSessionStore::open(path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn write_failure_keeps_session_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("missing/session.json"))
            .await
            .unwrap();

        let record = store
            .update(SessionPatch::SignedIn {
                tokens: tokens(),
                identity: identity(),
            })
            .await;

        assert!(record.is_signed_in());
        assert!(store.read().is_signed_in());
        assert!(logs_contain("unable to persist session"));
    }
}
