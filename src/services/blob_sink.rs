//! Pluggable append-only storage behind the upload protocol.
//!
//! The protocol only ever needs five operations against the backing object:
//! reset it to a clean zero-length state, append bytes, open it for reading,
//! measure it, and delete it. Two interchangeable backends provide them:
//!
//! - [`LocalFileSink`] — plain files under a base directory, opened in
//!   append-binary mode. The development default.
//! - [`AppendBlobSink`] — drives an [`AppendBlobClient`], the boundary where
//!   a cloud append-blob SDK plugs in. A filesystem-backed client ships for
//!   local use and tests.
//!
//! The backend is chosen once at construction time; nothing in the append
//! path inspects which variant it is talking to.

use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;

/// Append-capable blob service boundary.
///
/// Mirrors the minimal surface of a cloud append-blob API: existence check,
/// delete, create-once, append-block, plus read/size for checksum
/// verification and the completion handle. Implementations must make each
/// `append_block` durable before returning; the protocol advances the
/// session offset only after a successful return.
#[async_trait]
pub trait AppendBlobClient: Send + Sync {
    async fn exists(&self, name: &str) -> io::Result<bool>;
    async fn delete_blob(&self, name: &str) -> io::Result<()>;
    async fn create_append_blob(&self, name: &str) -> io::Result<()>;
    async fn append_block(&self, name: &str, data: &[u8]) -> io::Result<()>;
    async fn open_read(&self, name: &str) -> io::Result<File>;
    async fn len(&self, name: &str) -> io::Result<u64>;
}

/// Filesystem-backed [`AppendBlobClient`].
///
/// Stands in for a real blob service in development and tests while keeping
/// the create-once / append-block discipline of the cloud API.
pub struct FsAppendBlobClient {
    root: PathBuf,
}

impl FsAppendBlobClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl AppendBlobClient for FsAppendBlobClient {
    async fn exists(&self, name: &str) -> io::Result<bool> {
        match fs::metadata(self.blob_path(name)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn delete_blob(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.blob_path(name)).await
    }

    async fn create_append_blob(&self, name: &str) -> io::Result<()> {
        let path = self.blob_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // create_new: creating an existing blob is a protocol error upstream.
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(())
    }

    async fn append_block(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.blob_path(name))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn open_read(&self, name: &str) -> io::Result<File> {
        File::open(self.blob_path(name)).await
    }

    async fn len(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.blob_path(name)).await?.len())
    }
}

/// Local-file backend: one file per session under `base_path`, written in
/// append-binary mode.
#[derive(Clone)]
pub struct LocalFileSink {
    base_path: PathBuf,
}

impl LocalFileSink {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, storage_ref: &str) -> PathBuf {
        self.base_path.join(storage_ref)
    }
}

/// Append-blob backend: delegates to an [`AppendBlobClient`].
#[derive(Clone)]
pub struct AppendBlobSink {
    client: Arc<dyn AppendBlobClient>,
}

impl AppendBlobSink {
    pub fn new(client: Arc<dyn AppendBlobClient>) -> Self {
        Self { client }
    }
}

/// Storage backend for upload payloads, selected once at construction from
/// configuration.
#[derive(Clone)]
pub enum BlobSink {
    Local(LocalFileSink),
    AppendBlob(AppendBlobSink),
}

impl BlobSink {
    /// Reset `storage_ref` to a clean zero-length state.
    ///
    /// Called exactly once per session, before its first append: creates the
    /// object fresh, deleting any stale object left under the same name.
    pub async fn reset(&self, storage_ref: &str) -> io::Result<()> {
        match self {
            BlobSink::Local(sink) => {
                let path = sink.object_path(storage_ref);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                // Truncate-create clears any stale file under the same name.
                File::create(&path).await?;
                Ok(())
            }
            BlobSink::AppendBlob(sink) => {
                if sink.client.exists(storage_ref).await? {
                    debug!("deleting stale blob {storage_ref} before recreate");
                    sink.client.delete_blob(storage_ref).await?;
                }
                sink.client.create_append_blob(storage_ref).await
            }
        }
    }

    /// Append `data` to `storage_ref` and return the object's new total
    /// length. `declared_len` is the caller-declared chunk size and is taken
    /// as authoritative when present; otherwise the length is measured from
    /// the object after the write.
    ///
    /// Never retries. A failure here must leave the session's offset alone,
    /// which the caller guarantees by only advancing it on `Ok`.
    pub async fn append(
        &self,
        storage_ref: &str,
        current_offset: i64,
        data: &[u8],
        declared_len: Option<i64>,
    ) -> io::Result<i64> {
        match self {
            BlobSink::Local(sink) => {
                let path = sink.object_path(storage_ref);
                let mut file = OpenOptions::new().append(true).open(&path).await?;
                file.write_all(data).await?;
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                match declared_len {
                    Some(len) => Ok(current_offset + len),
                    None => Ok(fs::metadata(&path).await?.len() as i64),
                }
            }
            BlobSink::AppendBlob(sink) => {
                // First append of a session: start from a clean slate even if
                // a stale blob is sitting under the same name.
                if current_offset == 0 {
                    if sink.client.exists(storage_ref).await? {
                        debug!("deleting stale blob {storage_ref} before first append");
                        sink.client.delete_blob(storage_ref).await?;
                    }
                    sink.client.create_append_blob(storage_ref).await?;
                }
                sink.client.append_block(storage_ref, data).await?;
                let advanced = declared_len.unwrap_or(data.len() as i64);
                Ok(current_offset + advanced)
            }
        }
    }

    /// Open the assembled object for reading (checksum computation and the
    /// completion handle).
    pub async fn open_read(&self, storage_ref: &str) -> io::Result<File> {
        match self {
            BlobSink::Local(sink) => File::open(sink.object_path(storage_ref)).await,
            BlobSink::AppendBlob(sink) => sink.client.open_read(storage_ref).await,
        }
    }

    /// Current physical length of the object.
    pub async fn len(&self, storage_ref: &str) -> io::Result<u64> {
        match self {
            BlobSink::Local(sink) => Ok(fs::metadata(sink.object_path(storage_ref)).await?.len()),
            BlobSink::AppendBlob(sink) => sink.client.len(storage_ref).await,
        }
    }

    /// Delete the backing object. Missing objects are not an error so that
    /// record-plus-blob deletion stays idempotent.
    pub async fn delete(&self, storage_ref: &str) -> io::Result<()> {
        let result = match self {
            BlobSink::Local(sink) => fs::remove_file(sink.object_path(storage_ref)).await,
            BlobSink::AppendBlob(sink) => sink.client.delete_blob(storage_ref).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {storage_ref} already missing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Base directory used by the readiness probe, when the backend has one.
    pub fn probe_dir(&self) -> Option<&Path> {
        match self {
            BlobSink::Local(sink) => Some(&sink.base_path),
            BlobSink::AppendBlob(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    async fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("blob-sink-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&root).await.unwrap();
        root
    }

    async fn read_all(sink: &BlobSink, storage_ref: &str) -> Vec<u8> {
        let mut file = sink.open_read(storage_ref).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn local_sink_appends_sequentially() {
        let root = temp_root().await;
        let sink = BlobSink::Local(LocalFileSink::new(&root));

        sink.reset("a.part").await.unwrap();
        let len = sink.append("a.part", 0, b"hello ", Some(6)).await.unwrap();
        assert_eq!(len, 6);
        let len = sink.append("a.part", 6, b"world", Some(5)).await.unwrap();
        assert_eq!(len, 11);

        assert_eq!(read_all(&sink, "a.part").await, b"hello world");
        assert_eq!(sink.len("a.part").await.unwrap(), 11);

        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn local_sink_reset_clears_stale_object() {
        let root = temp_root().await;
        let sink = BlobSink::Local(LocalFileSink::new(&root));

        sink.reset("b.part").await.unwrap();
        sink.append("b.part", 0, b"stale bytes", Some(11)).await.unwrap();
        sink.reset("b.part").await.unwrap();
        assert_eq!(sink.len("b.part").await.unwrap(), 0);

        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn local_sink_measures_length_without_declared_size() {
        let root = temp_root().await;
        let sink = BlobSink::Local(LocalFileSink::new(&root));

        sink.reset("c.part").await.unwrap();
        let len = sink.append("c.part", 0, b"12345", None).await.unwrap();
        assert_eq!(len, 5);

        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn append_blob_sink_recreates_on_reset() {
        let root = temp_root().await;
        let client = Arc::new(FsAppendBlobClient::new(&root));
        let sink = BlobSink::AppendBlob(AppendBlobSink::new(client));

        sink.reset("d.blob").await.unwrap();
        sink.append("d.blob", 0, b"old", Some(3)).await.unwrap();

        // Second reset must delete and recreate, not fail on create_new.
        sink.reset("d.blob").await.unwrap();
        let len = sink.append("d.blob", 0, b"new", Some(3)).await.unwrap();
        assert_eq!(len, 3);
        assert_eq!(read_all(&sink, "d.blob").await, b"new");

        fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let root = temp_root().await;
        let sink = BlobSink::Local(LocalFileSink::new(&root));

        sink.reset("e.part").await.unwrap();
        sink.delete("e.part").await.unwrap();
        sink.delete("e.part").await.unwrap();

        fs::remove_dir_all(&root).await.unwrap();
    }
}
