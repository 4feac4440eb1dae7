use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::atomic::AtomicFile;
use crate::config::ALLOWED_MIME_TYPES;
use crate::quota::StorageAccountant;

const PUBLISH_ATTEMPTS: usize = 16;

/// The storage area: a flat directory of uploaded files plus a staging directory
/// for uploads that have not completed yet.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    staging: PathBuf,
    last_stamp: AtomicI64,
}

impl Storage {
    pub fn new(root: PathBuf, staging: PathBuf) -> Self {
        Self {
            root,
            staging,
            last_stamp: AtomicI64::new(0),
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(&self.staging).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Resolves a client supplied name to an existing regular file inside the root.
    async fn resolve_existing(&self, raw: &str) -> Result<(String, PathBuf), StorageError> {
        let name = sanitize_name(raw)?;
        let target = self.root.join(&name);
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.file_type().is_symlink() {
            return Err(StorageError::InvalidName);
        }
        if !metadata.is_file() {
            return Err(StorageError::Io(io::Error::from(ErrorKind::NotFound)));
        }
        Ok((name, target))
    }

    /// Lists regular files in the root in directory enumeration order.
    pub async fn list_files(&self) -> Result<Vec<FileEntry>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if !file_type.is_file() {
                continue;
            }
            // A concurrent delete may remove the entry between enumeration and stat.
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
            });
        }

        Ok(entries)
    }

    /// Sum of the sizes of all stored files, scanned live.
    pub async fn total_size(&self) -> Result<u64, StorageError> {
        let entries = self.list_files().await?;
        Ok(entries.iter().map(|entry| entry.size).sum())
    }

    /// Opens a stored file for streaming.
    pub async fn open_file(&self, raw: &str) -> Result<OpenedFile, StorageError> {
        let (name, target) = self.resolve_existing(raw).await?;
        let file = File::open(&target).await?;
        let metadata = file.metadata().await?;
        Ok(OpenedFile {
            name,
            file,
            metadata,
        })
    }

    /// Removes a stored file, returning the sanitized name that was deleted.
    pub async fn delete_file(&self, raw: &str) -> Result<String, StorageError> {
        let (name, target) = self.resolve_existing(raw).await?;
        fs::remove_file(target).await?;
        Ok(name)
    }

    /// Writes an upload into the staging directory, enforcing the MIME allow-list
    /// and the per-file size limit. Nothing is visible in the root until
    /// [`StagedUpload::commit`].
    pub async fn stage<S, B, E>(
        &self,
        original_name: &str,
        declared_mime: Option<&str>,
        content: S,
        size_limit: u64,
    ) -> Result<StagedUpload, StorageError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let original_name = sanitize_name(original_name)?;
        let mime_type = resolve_mime(declared_mime, &original_name);
        if !ALLOWED_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(StorageError::UnsupportedMediaType(mime_type));
        }

        let mut atomic = AtomicFile::create_in(&self.staging).await?;
        let write_result: Result<u64, StorageError> = async {
            let mut content = pin!(content);
            let mut total_written: u64 = 0;
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|err| StorageError::Incomplete(err.to_string()))?;
                let chunk = chunk.as_ref();
                if chunk.is_empty() {
                    continue;
                }
                total_written += chunk.len() as u64;
                if total_written > size_limit {
                    return Err(StorageError::PayloadTooLarge(size_limit));
                }
                atomic.file_mut().write_all(chunk).await?;
            }
            Ok(total_written)
        }
        .await;

        match write_result {
            Ok(size) => Ok(StagedUpload {
                atomic,
                original_name,
                mime_type,
                size,
            }),
            Err(err) => {
                atomic.cleanup().await;
                Err(err)
            }
        }
    }

    /// Stages an upload, checks that its size still fits under the ceiling and
    /// publishes it. A rejected upload leaves nothing in staging or the root.
    pub async fn put<S, B, E>(
        &self,
        original_name: &str,
        declared_mime: Option<&str>,
        content: S,
        size_limit: u64,
        accountant: &StorageAccountant,
    ) -> Result<StoredFile, StorageError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let staged = self
            .stage(original_name, declared_mime, content, size_limit)
            .await?;
        if let Err(err) = accountant.ensure_capacity(Some(staged.size())).await {
            staged.discard().await;
            return Err(err);
        }
        staged.commit(self).await
    }

    /// Millisecond timestamp, strictly increasing for the lifetime of the process.
    fn next_disambiguator(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

/// Reduces a client supplied name to its final path component. Trailing
/// separators are ignored; whitespace is kept as sent.
pub fn sanitize_name(raw: &str) -> Result<String, StorageError> {
    let base = raw
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    if base.trim().is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(StorageError::InvalidName);
    }
    Ok(base.to_string())
}

/// Declared MIME essence, falling back to a guess from the extension when the
/// client sent none or a generic octet-stream.
fn resolve_mime(declared: Option<&str>, file_name: &str) -> String {
    let declared = declared
        .and_then(|value| value.parse::<mime_guess::Mime>().ok())
        .filter(|mime| *mime != mime_guess::mime::APPLICATION_OCTET_STREAM);
    match declared {
        Some(mime) => mime.essence_str().to_ascii_lowercase(),
        None => mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// An upload fully written to staging but not yet visible.
pub struct StagedUpload {
    atomic: AtomicFile,
    original_name: String,
    mime_type: String,
    size: u64,
}

impl StagedUpload {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Publishes under `<disambiguator>-<original name>`, never overwriting.
    pub async fn commit(self, storage: &Storage) -> Result<StoredFile, StorageError> {
        let original_name = self.original_name;
        let published = self
            .atomic
            .publish_new(
                || {
                    let stamp = storage.next_disambiguator();
                    storage.root.join(format!("{stamp}-{original_name}"))
                },
                PUBLISH_ATTEMPTS,
            )
            .await?;
        let name = published
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or(StorageError::InvalidName)?;
        Ok(StoredFile {
            name,
            size: self.size,
            mime_type: self.mime_type,
        })
    }

    pub async fn discard(self) {
        self.atomic.cleanup().await;
    }
}

pub struct OpenedFile {
    pub name: String,
    pub file: File,
    pub metadata: Metadata,
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    UnsupportedMediaType(String),
    PayloadTooLarge(u64),
    CapacityExceeded { max: u64 },
    Incomplete(String),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}
