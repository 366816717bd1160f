//! Single pending file sent alongside the next question.

use super::{ChatError, ChatResult};
use crate::api::FilePart;
use crate::types::FileInfo;
use async_trait::async_trait;
use std::io;
use std::path::Path;

const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub uri: String,
    pub name: String,
    pub mime_type: String,
    pub size: Option<u64>,
}

impl Attachment {
    pub fn new(uri: impl Into<String>, name: impl Into<String>, mime_type: Option<String>) -> Self {
        let name = name.into();
        let mime_type = mime_type
            .map(|mime| mime.trim().to_ascii_lowercase())
            .filter(|mime| is_mime_like(mime))
            .unwrap_or_else(|| guess_mime(&name).to_string());
        Self {
            uri: uri.into(),
            name,
            mime_type,
            size: None,
        }
    }

    /// Builds an attachment for a local file, reading its size when possible.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mut attachment = Self::new(path.to_string_lossy(), name, None);
        attachment.size = std::fs::metadata(path).ok().map(|meta| meta.len());
        attachment
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            mime_type: Some(self.mime_type.clone()),
            size: self.size,
        }
    }
}

/// `type/subtype` with optional parameters; nothing more is checked.
fn is_mime_like(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((kind, subtype)) => {
            !kind.is_empty() && !subtype.is_empty() && !essence.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Types offered by the document and image pickers.
fn guess_mime(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => DEFAULT_MIME,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentState {
    Idle,
    Staged,
    Uploading,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Delivered,
    Failed,
}

#[derive(Debug)]
pub struct AttachmentSlot {
    state: AttachmentState,
    pending: Option<Attachment>,
}

impl Default for AttachmentSlot {
    fn default() -> Self {
        Self {
            state: AttachmentState::Idle,
            pending: None,
        }
    }
}

impl AttachmentSlot {
    pub fn state(&self) -> AttachmentState {
        self.state
    }

    pub fn pending(&self) -> Option<&Attachment> {
        self.pending.as_ref()
    }

    /// Stages a file, replacing any file already staged.
    pub fn attach(&mut self, attachment: Attachment) -> ChatResult<()> {
        if self.state == AttachmentState::Uploading {
            return Err(ChatError::AttachmentBusy);
        }
        tracing::debug!(name = %attachment.name, mime = %attachment.mime_type, "attachment staged");
        self.pending = Some(attachment);
        self.state = AttachmentState::Staged;
        Ok(())
    }

    /// Drops a staged file. An upload already in progress is left alone.
    pub fn clear(&mut self) -> bool {
        if self.state != AttachmentState::Staged {
            return false;
        }
        self.pending = None;
        self.state = AttachmentState::Idle;
        true
    }

    pub fn take_for_send(&mut self) -> Option<Attachment> {
        if self.state != AttachmentState::Staged {
            return None;
        }
        self.state = AttachmentState::Uploading;
        self.pending.clone()
    }

    pub fn finish(&mut self, outcome: UploadOutcome) {
        if self.state != AttachmentState::Uploading {
            return;
        }
        if let Some(attachment) = self.pending.take() {
            match outcome {
                UploadOutcome::Delivered => {
                    tracing::debug!(name = %attachment.name, "attachment delivered")
                }
                UploadOutcome::Failed => {
                    tracing::warn!(name = %attachment.name, "attachment upload failed")
                }
            }
        }
        self.state = AttachmentState::Idle;
    }
}

/// Turns an attachment handle into the bytes to upload.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn read(&self, attachment: &Attachment) -> io::Result<Vec<u8>>;
}

/// Reads local paths and `file://` URIs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsResolver;

#[async_trait]
impl ContentResolver for FsResolver {
    async fn read(&self, attachment: &Attachment) -> io::Result<Vec<u8>> {
        let path = attachment
            .uri
            .strip_prefix("file://")
            .unwrap_or(&attachment.uri);
        tokio::fs::read(path).await
    }
}

/// Resolves the attachment for upload, degrading to a metadata-only part
/// when the content cannot be read.
pub async fn resolve_payload(resolver: &dyn ContentResolver, attachment: &Attachment) -> FilePart {
    match resolver.read(attachment).await {
        Ok(bytes) => FilePart::Bytes {
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
            bytes,
        },
        Err(err) => {
            tracing::warn!(
                error = %err,
                uri = %attachment.uri,
                "could not read attachment; sending metadata only"
            );
            FilePart::Handle {
                uri: attachment.uri.clone(),
                name: attachment.name.clone(),
                mime_type: attachment.mime_type.clone(),
            }
        }
    }
}
