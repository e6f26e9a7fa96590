//! Whole-file transfer: build the outbound FILE_TRANSFER message, store received files.

use std::path::{Path, PathBuf};

use parley_core::{MessageType, UserId, WireMessage};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::dispatcher::MessageListener;
use crate::transport::TransportError;

/// Largest file sent in one message.
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{path}: {size} bytes exceeds the {max} byte limit")]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("transfer carries no file name")]
    MissingName,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read `path` into a FILE_TRANSFER message. The size cap is checked before reading.
pub async fn file_message(path: &Path, receiver: UserId) -> Result<WireMessage, FileError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FileError::NoFileName(path.to_path_buf()))?
        .to_string();
    let size = tokio::fs::metadata(path).await?.len();
    if size > MAX_FILE_BYTES {
        return Err(FileError::TooLarge {
            path: path.to_path_buf(),
            size,
            max: MAX_FILE_BYTES,
        });
    }
    let bytes = tokio::fs::read(path).await?;
    Ok(WireMessage::new(MessageType::FileTransfer, None, Some(receiver))
        .with_file_name(name.clone())
        .with_content(name)
        .with_payload(bytes))
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`. Names that are empty or only dots
/// become `file` so they cannot address the parent directory.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        cleaned
    }
}

/// `stem_(n).ext` for the n-th collision.
fn numbered(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_({})", name, n),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub from: Option<UserId>,
    pub path: PathBuf,
    pub size: usize,
}

/// Writes received files into the download directory, never overwriting.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    events: mpsc::UnboundedSender<ReceivedFile>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> (Self, mpsc::UnboundedReceiver<ReceivedFile>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                dir: dir.into(),
                events,
            },
            rx,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save under the sanitized name, appending `_(n)` before the extension on collision.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, FileError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let base = sanitize_file_name(name);
        let mut candidate = base.clone();
        let mut n = 0;
        loop {
            let path = self.dir.join(&candidate);
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut f) => {
                    f.write_all(bytes).await?;
                    f.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = numbered(&base, n);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn receive(&self, msg: WireMessage) -> Result<ReceivedFile, FileError> {
        let name = msg
            .file_name
            .as_deref()
            .or(msg.content.as_deref())
            .ok_or(FileError::MissingName)?;
        let path = self.save(name, &msg.payload).await?;
        Ok(ReceivedFile {
            from: msg.sender_id,
            path,
            size: msg.payload.len(),
        })
    }
}

impl MessageListener for FileStore {
    fn on_message(&self, msg: &WireMessage) -> anyhow::Result<()> {
        if msg.kind != MessageType::FileTransfer {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()?;
        let store = self.clone();
        let msg = msg.clone();
        handle.spawn(async move {
            match store.receive(msg).await {
                Ok(file) => {
                    log::info!("received {} ({} bytes)", file.path.display(), file.size);
                    let _ = store.events.send(file);
                }
                Err(e) => log::warn!("dropping file transfer: {}", e),
            }
        });
        Ok(())
    }
}
