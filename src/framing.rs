//! File frame wire format
//!
//! `[4 bytes metadata length (little-endian)][UTF-8 JSON metadata][raw content]`
//!
//! A whole file travels as one data channel message; there is no chunking, so
//! frames are bounded by the transport's maximum message size.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Size of the metadata length prefix
pub const LEN_SIZE: usize = 4;

/// Content type assumed when the sender did not provide one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default frame ceiling (SCTP max message size used by the webrtc transport)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// File metadata carried in front of the content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, content_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            size,
            content_type,
        }
    }

    /// Declared content type, or the generic binary type when absent
    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    pub metadata: FileMetadata,
    pub content: Bytes,
}

/// Encodes files into frames and decodes frames back into files
#[derive(Debug, Clone, Copy)]
pub struct FileFramer {
    max_frame_len: usize,
}

impl Default for FileFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FileFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode metadata and content into a single frame.
    pub fn encode(&self, metadata: &FileMetadata, content: &[u8]) -> Result<Vec<u8>, FrameError> {
        let json = serde_json::to_vec(metadata)?;
        let len = LEN_SIZE + json.len() + content.len();
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&(json.len() as u32).to_le_bytes());
        frame.extend_from_slice(&json);
        frame.extend_from_slice(content);
        Ok(frame)
    }

    /// Convenience wrapper building the metadata from its parts.
    pub fn encode_file(
        &self,
        name: &str,
        size: u64,
        content_type: Option<&str>,
        content: &[u8],
    ) -> Result<Vec<u8>, FrameError> {
        let metadata = FileMetadata::new(name, size, content_type.map(str::to_string));
        self.encode(&metadata, content)
    }

    /// Decode a frame. Fails closed on truncation, bad metadata or a content
    /// length that differs from the declared size.
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedFile, FrameError> {
        if frame.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        if frame.len() < LEN_SIZE {
            return Err(FrameError::TooShort(frame.len()));
        }
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let available = frame.len() - LEN_SIZE;
        if declared > available {
            return Err(FrameError::MetadataTruncated {
                declared,
                available,
            });
        }

        let metadata: FileMetadata = serde_json::from_slice(&frame[LEN_SIZE..LEN_SIZE + declared])?;
        let content = Bytes::copy_from_slice(&frame[LEN_SIZE + declared..]);
        if content.len() as u64 != metadata.size {
            return Err(FrameError::SizeMismatch {
                declared: metadata.size,
                actual: content.len() as u64,
            });
        }

        Ok(DecodedFile { metadata, content })
    }
}
