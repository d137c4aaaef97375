//! Filesystem-backed attachment store.
//!
//! # Invariants
//! - Files are published with a hard link from a private temp file, so a
//!   ref appears complete or not at all and an existing file is never
//!   replaced.
//! - A missing file on delete counts as already deleted.

use crate::attachment::naming::generate_ref;
use crate::model::project::AttachmentRef;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const MAX_NAME_ATTEMPTS: usize = 8;
const DEFAULT_DELETE_ATTEMPTS: u32 = 3;
const DEFAULT_DELETE_BACKOFF: Duration = Duration::from_millis(25);

pub type AttachmentResult<T> = Result<T, AttachmentError>;

#[derive(Debug)]
pub enum AttachmentError {
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    /// Every generated name collided with an existing file.
    NameExhausted,
}

impl Display for AttachmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io {
                action,
                path,
                source,
            } => write!(f, "attachment {action} failed for `{}`: {source}", path.display()),
            Self::NameExhausted => write!(f, "could not generate an unused attachment name"),
        }
    }
}

impl Error for AttachmentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::NameExhausted => None,
        }
    }
}

/// Retry budget for best-effort deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePolicy {
    /// Total attempts including the first one; at least 1.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DELETE_ATTEMPTS,
            backoff: DEFAULT_DELETE_BACKOFF,
        }
    }
}

/// Result of one best-effort delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyMissing,
    /// Retries exhausted; the caller should record the ref for manual cleanup.
    Escalated { attempts: u32, last_error: String },
}

impl DeleteOutcome {
    pub fn is_escalated(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }
}

/// Flat directory of attachment files.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    policy: DeletePolicy,
}

impl AttachmentStore {
    /// Opens (creating if needed) the attachment directory.
    pub fn open(dir: impl Into<PathBuf>, policy: DeletePolicy) -> AttachmentResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| AttachmentError::Io {
            action: "create_dir",
            path: dir.clone(),
            source,
        })?;
        info!(
            "event=attachment_open module=attachment status=ok dir={}",
            dir.display()
        );
        Ok(Self {
            dir,
            policy: DeletePolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> DeletePolicy {
        self.policy
    }

    pub fn path_of(&self, attachment: &AttachmentRef) -> PathBuf {
        self.dir.join(attachment.as_str())
    }

    /// Persists `bytes` under a freshly generated ref.
    ///
    /// # Errors
    /// - Returns `AttachmentError::Io` when the temp file cannot be written
    ///   or published.
    pub fn store(&self, bytes: &[u8], original_name: &str) -> AttachmentResult<AttachmentRef> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let candidate = generate_ref(original_name);
            let target = self.path_of(&candidate);
            let temp = self.dir.join(format!(".{}.partial", candidate.as_str()));

            write_new_file(&temp, bytes)?;
            let published = fs::hard_link(&temp, &target);
            if let Err(err) = fs::remove_file(&temp) {
                warn!(
                    "event=attachment_store module=attachment status=error action=remove_temp path={} error={}",
                    temp.display(),
                    err
                );
            }

            match published {
                Ok(()) => {
                    debug!(
                        "event=attachment_store module=attachment status=ok ref={} size={}",
                        candidate,
                        bytes.len()
                    );
                    return Ok(candidate);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    warn!(
                        "event=attachment_store module=attachment status=retry reason=name_collision ref={}",
                        candidate
                    );
                }
                Err(source) => {
                    error!(
                        "event=attachment_store module=attachment status=error ref={} error={}",
                        candidate, source
                    );
                    return Err(AttachmentError::Io {
                        action: "publish",
                        path: target,
                        source,
                    });
                }
            }
        }
        Err(AttachmentError::NameExhausted)
    }

    /// Best-effort unlink with bounded retry.
    pub fn delete(&self, attachment: &AttachmentRef) -> DeleteOutcome {
        let path = self.path_of(attachment);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(
                        "event=attachment_delete module=attachment status=ok ref={} attempt={}",
                        attachment, attempt
                    );
                    return DeleteOutcome::Deleted;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(
                        "event=attachment_delete module=attachment status=missing ref={}",
                        attachment
                    );
                    return DeleteOutcome::AlreadyMissing;
                }
                Err(err) => {
                    warn!(
                        "event=attachment_delete module=attachment status=error ref={} attempt={} max_attempts={} error={}",
                        attachment, attempt, self.policy.max_attempts, err
                    );
                    last_error = err.to_string();
                    if attempt < self.policy.max_attempts {
                        thread::sleep(self.policy.backoff);
                    }
                }
            }
        }

        error!(
            "event=attachment_delete module=attachment status=escalated ref={} attempts={}",
            attachment, self.policy.max_attempts
        );
        DeleteOutcome::Escalated {
            attempts: self.policy.max_attempts,
            last_error,
        }
    }

    pub fn exists(&self, attachment: &AttachmentRef) -> bool {
        self.path_of(attachment).is_file()
    }

    /// Reads stored bytes, as served back to callers.
    pub fn read(&self, attachment: &AttachmentRef) -> AttachmentResult<Vec<u8>> {
        let path = self.path_of(attachment);
        fs::read(&path).map_err(|source| AttachmentError::Io {
            action: "read",
            path,
            source,
        })
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> AttachmentResult<()> {
    let io_error = |action: &'static str| {
        let path = path.to_path_buf();
        move |source| AttachmentError::Io {
            action,
            path,
            source,
        }
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_error("create"))?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    if let Err(source) = written {
        drop(file);
        if let Err(err) = fs::remove_file(path) {
            warn!(
                "event=attachment_store module=attachment status=error action=remove_partial path={} error={}",
                path.display(),
                err
            );
        }
        return Err(io_error("write")(source));
    }
    Ok(())
}
