//! Documents accepted for salary extraction.
//!
//! Only PNG, JPEG and PDF files are accepted, up to the configured size
//! limit. A [`Document`] can only be built through these checks, so the
//! funnel never sees an unsupported upload.

use std::path::Path;

use crate::error::DocumentError;

/// Supported document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Png,
    Jpeg,
    Pdf,
}

impl DocumentKind {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Pdf => "application/pdf",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"%PDF-") {
            Some(Self::Pdf)
        } else {
            None
        }
    }
}

/// A validated upload.
#[derive(Debug, Clone)]
pub struct Document {
    file_name: String,
    kind: DocumentKind,
    bytes: Vec<u8>,
}

impl Document {
    /// Validate in-memory bytes.
    ///
    /// The content signature wins over the file extension when both are
    /// recognisable; a file with neither is rejected.
    pub fn from_bytes(
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        max_bytes: usize,
    ) -> Result<Self, DocumentError> {
        let file_name = file_name.into();
        if bytes.is_empty() {
            return Err(DocumentError::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(DocumentError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }

        let by_extension = Path::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(DocumentKind::from_extension);
        let kind = DocumentKind::sniff(&bytes)
            .or(by_extension)
            .ok_or_else(|| DocumentError::UnsupportedType(file_name.clone()))?;

        Ok(Self {
            file_name,
            kind,
            bytes,
        })
    }

    /// Read and validate a file from disk.
    pub async fn from_path(path: &Path, max_bytes: usize) -> Result<Self, DocumentError> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() as usize > max_bytes {
            return Err(DocumentError::TooLarge {
                size: metadata.len() as usize,
                limit: max_bytes,
            });
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(file_name, bytes, max_bytes)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn mime(&self) -> &'static str {
        self.kind.mime()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
