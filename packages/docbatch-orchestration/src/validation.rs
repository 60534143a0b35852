//! Candidate file validation against `MultiFileConfig` limits

use crate::config::MultiFileConfig;
use crate::error::OrchestratorError;
use crate::file::FileInput;
use serde::{Deserialize, Serialize};

/// Why a candidate file was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectionReason {
    FileTooLarge { size_bytes: u64, max_bytes: u64 },
    UnsupportedType { mime_type: String },
    TooManyFiles { max_files: usize },
    BatchSizeExceeded { total_bytes: u64, max_bytes: u64 },
}

impl RejectionReason {
    /// Count/total limits, as opposed to per-file problems
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            RejectionReason::TooManyFiles { .. } | RejectionReason::BatchSizeExceeded { .. }
        )
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::FileTooLarge {
                size_bytes,
                max_bytes,
            } => write!(
                f,
                "file size {} bytes exceeds the {} byte limit",
                size_bytes, max_bytes
            ),
            RejectionReason::UnsupportedType { mime_type } => {
                write!(f, "file type '{}' is not allowed", mime_type)
            }
            RejectionReason::TooManyFiles { max_files } => {
                write!(f, "batch is limited to {} files", max_files)
            }
            RejectionReason::BatchSizeExceeded {
                total_bytes,
                max_bytes,
            } => write!(
                f,
                "batch size would reach {} bytes, limit is {}",
                total_bytes, max_bytes
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidFile {
    pub file: FileInput,
    pub reason: RejectionReason,
}

impl InvalidFile {
    pub fn to_error(&self) -> OrchestratorError {
        OrchestratorError::Validation {
            file: self.file.name.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchValidationResult {
    pub valid_files: Vec<FileInput>,
    pub invalid_files: Vec<InvalidFile>,
    /// Bytes of the accepted files
    pub total_size: u64,
    /// A count or total-size limit cut the submission short
    pub exceeds_limits: bool,
}

/// Match a MIME type against an allow list entry (`type/*` wildcards)
pub fn mime_allowed(mime_type: &str, allowed: &[String]) -> bool {
    let mime = mime_type.trim().to_ascii_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_suffix("/*") {
            Some(prefix) => mime
                .split_once('/')
                .map(|(major, _)| major == prefix)
                .unwrap_or(false),
            None => mime == pattern,
        }
    })
}

/// Validate a fresh submission
pub fn validate_files(files: &[FileInput], config: &MultiFileConfig) -> BatchValidationResult {
    validate_against(files, config, 0, 0)
}

/// Validate candidates on top of files already in the batch
///
/// Per-file checks (size, type) run first; count and total-size limits are
/// then applied in submission order, so earlier files win.
pub fn validate_against(
    files: &[FileInput],
    config: &MultiFileConfig,
    existing_count: usize,
    existing_bytes: u64,
) -> BatchValidationResult {
    let mut result = BatchValidationResult::default();
    let mut count = existing_count;
    let mut bytes = existing_bytes;

    for file in files {
        let reason = if file.size_bytes > config.max_file_size {
            Some(RejectionReason::FileTooLarge {
                size_bytes: file.size_bytes,
                max_bytes: config.max_file_size,
            })
        } else if !mime_allowed(&file.mime_type, &config.allowed_types) {
            Some(RejectionReason::UnsupportedType {
                mime_type: file.mime_type.clone(),
            })
        } else if count >= config.max_files {
            Some(RejectionReason::TooManyFiles {
                max_files: config.max_files,
            })
        } else if bytes + file.size_bytes > config.max_batch_size {
            Some(RejectionReason::BatchSizeExceeded {
                total_bytes: bytes + file.size_bytes,
                max_bytes: config.max_batch_size,
            })
        } else {
            None
        };

        match reason {
            Some(reason) => {
                if reason.is_limit() {
                    result.exceeds_limits = true;
                }
                result.invalid_files.push(InvalidFile {
                    file: file.clone(),
                    reason,
                });
            }
            None => {
                count += 1;
                bytes += file.size_bytes;
                result.total_size += file.size_bytes;
                result.valid_files.push(file.clone());
            }
        }
    }

    result
}
