use thiserror::Error;

use super::constants::*;

/// Everything that can go wrong while driving an SFTP session.
///
/// Transport failures (`Timeout`, `PipeClosed`, `ConnectionReset`,
/// `BrokenPipe`) latch the session's pipe-broken flag; once one has
/// been returned every later call fails fast. Server-side failures are
/// carried numerically in `Status` so callers can branch on the
/// `SSH_FX_*` code that actually came back.
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("transfer timed out")]
    Timeout,
    #[error("connection closed by server")]
    PipeClosed,
    #[error("connection reset by server")]
    ConnectionReset,
    #[error("broken pipe while talking to ssh")]
    BrokenPipe,
    #[error("server replied {} ({}): {message}", .code, status_name(*.code))]
    Status { code: u32, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("deferred reply buffer full ({0} replies outstanding)")]
    ReplyBufferFull(usize),
    #[error("end of file")]
    Eof,
    #[error("pipelined read aborted, retry the range with single reads")]
    DoSingleReads,
    #[error("usage error: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SftpError {
    /// True for errors that mean the pipe to the ssh child is dead.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            SftpError::Timeout
                | SftpError::PipeClosed
                | SftpError::ConnectionReset
                | SftpError::BrokenPipe
        )
    }

    /// The `SSH_FX_*` code, when this error carries one.
    pub fn status_code(&self) -> Option<u32> {
        match self {
            SftpError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Draft name for a status code, for logs and error messages.
pub fn status_name(code: u32) -> &'static str {
    match code {
        SSH_FX_OK => "SSH_FX_OK",
        SSH_FX_EOF => "SSH_FX_EOF",
        SSH_FX_NO_SUCH_FILE => "SSH_FX_NO_SUCH_FILE",
        SSH_FX_PERMISSION_DENIED => "SSH_FX_PERMISSION_DENIED",
        SSH_FX_FAILURE => "SSH_FX_FAILURE",
        SSH_FX_BAD_MESSAGE => "SSH_FX_BAD_MESSAGE",
        SSH_FX_NO_CONNECTION => "SSH_FX_NO_CONNECTION",
        SSH_FX_CONNECTION_LOST => "SSH_FX_CONNECTION_LOST",
        SSH_FX_OP_UNSUPPORTED => "SSH_FX_OP_UNSUPPORTED",
        SSH_FX_INVALID_HANDLE => "SSH_FX_INVALID_HANDLE",
        SSH_FX_NO_SUCH_PATH => "SSH_FX_NO_SUCH_PATH",
        SSH_FX_FILE_ALREADY_EXISTS => "SSH_FX_FILE_ALREADY_EXISTS",
        SSH_FX_WRITE_PROTECT => "SSH_FX_WRITE_PROTECT",
        SSH_FX_NO_MEDIA => "SSH_FX_NO_MEDIA",
        SSH_FX_NO_SPACE_ON_FILESYSTEM => "SSH_FX_NO_SPACE_ON_FILESYSTEM",
        SSH_FX_QUOTA_EXCEEDED => "SSH_FX_QUOTA_EXCEEDED",
        SSH_FX_UNKNOWN_PRINCIPAL => "SSH_FX_UNKNOWN_PRINCIPAL",
        SSH_FX_LOCK_CONFLICT => "SSH_FX_LOCK_CONFLICT",
        SSH_FX_DIR_NOT_EMPTY => "SSH_FX_DIR_NOT_EMPTY",
        SSH_FX_NOT_A_DIRECTORY => "SSH_FX_NOT_A_DIRECTORY",
        SSH_FX_INVALID_FILENAME => "SSH_FX_INVALID_FILENAME",
        SSH_FX_LINK_LOOP => "SSH_FX_LINK_LOOP",
        SSH_FX_CANNOT_DELETE => "SSH_FX_CANNOT_DELETE",
        SSH_FX_INVALID_PARAMETER => "SSH_FX_INVALID_PARAMETER",
        SSH_FX_FILE_IS_A_DIRECTORY => "SSH_FX_FILE_IS_A_DIRECTORY",
        SSH_FX_BYTE_RANGE_LOCK_CONFLICT => "SSH_FX_BYTE_RANGE_LOCK_CONFLICT",
        SSH_FX_BYTE_RANGE_LOCK_REFUSED => "SSH_FX_BYTE_RANGE_LOCK_REFUSED",
        SSH_FX_DELETE_PENDING => "SSH_FX_DELETE_PENDING",
        SSH_FX_FILE_CORRUPT => "SSH_FX_FILE_CORRUPT",
        SSH_FX_OWNER_INVALID => "SSH_FX_OWNER_INVALID",
        SSH_FX_GROUP_INVALID => "SSH_FX_GROUP_INVALID",
        SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK => "SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK",
        _ => "unknown status",
    }
}
