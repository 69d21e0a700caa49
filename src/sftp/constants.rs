//! Protocol numbers from the IETF secsh-filexfer drafts (03 through 06)
//! plus the tunables for the pipelined transfer engine.

/// Highest protocol version this client will offer in SSH_FXP_INIT.
pub const SFTP_MAX_VERSION: u32 = 6;

// SFTP protocol message types
pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;
pub const SSH_FXP_LINK: u8 = 21;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;
pub const SSH_FXP_EXTENDED: u8 = 200;
pub const SSH_FXP_EXTENDED_REPLY: u8 = 201;

// Status codes carried in SSH_FXP_STATUS; 0-8 are draft 3, the rest
// were added by later drafts.
pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_NO_CONNECTION: u32 = 6;
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;
pub const SSH_FX_INVALID_HANDLE: u32 = 9;
pub const SSH_FX_NO_SUCH_PATH: u32 = 10;
pub const SSH_FX_FILE_ALREADY_EXISTS: u32 = 11;
pub const SSH_FX_WRITE_PROTECT: u32 = 12;
pub const SSH_FX_NO_MEDIA: u32 = 13;
pub const SSH_FX_NO_SPACE_ON_FILESYSTEM: u32 = 14;
pub const SSH_FX_QUOTA_EXCEEDED: u32 = 15;
pub const SSH_FX_UNKNOWN_PRINCIPAL: u32 = 16;
pub const SSH_FX_LOCK_CONFLICT: u32 = 17;
pub const SSH_FX_DIR_NOT_EMPTY: u32 = 18;
pub const SSH_FX_NOT_A_DIRECTORY: u32 = 19;
pub const SSH_FX_INVALID_FILENAME: u32 = 20;
pub const SSH_FX_LINK_LOOP: u32 = 21;
pub const SSH_FX_CANNOT_DELETE: u32 = 22;
pub const SSH_FX_INVALID_PARAMETER: u32 = 23;
pub const SSH_FX_FILE_IS_A_DIRECTORY: u32 = 24;
pub const SSH_FX_BYTE_RANGE_LOCK_CONFLICT: u32 = 25;
pub const SSH_FX_BYTE_RANGE_LOCK_REFUSED: u32 = 26;
pub const SSH_FX_DELETE_PENDING: u32 = 27;
pub const SSH_FX_FILE_CORRUPT: u32 = 28;
pub const SSH_FX_OWNER_INVALID: u32 = 29;
pub const SSH_FX_GROUP_INVALID: u32 = 30;
pub const SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK: u32 = 31;

// File attribute flags. ACMODTIME is the draft 3 name for bit 0x8;
// from draft 4 on the same bit means ACCESSTIME and the remaining
// time fields got bits of their own.
pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x0000_0001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_ACCESSTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_CREATETIME: u32 = 0x0000_0010;
pub const SSH_FILEXFER_ATTR_MODIFYTIME: u32 = 0x0000_0020;
pub const SSH_FILEXFER_ATTR_ACL: u32 = 0x0000_0040;
pub const SSH_FILEXFER_ATTR_OWNERGROUP: u32 = 0x0000_0080;
pub const SSH_FILEXFER_ATTR_SUBSECOND_TIMES: u32 = 0x0000_0100;
pub const SSH_FILEXFER_ATTR_BITS: u32 = 0x0000_0200;
pub const SSH_FILEXFER_ATTR_ALLOCATION_SIZE: u32 = 0x0000_0400;
pub const SSH_FILEXFER_ATTR_TEXT_HINT: u32 = 0x0000_0800;
pub const SSH_FILEXFER_ATTR_MIME_TYPE: u32 = 0x0000_1000;
pub const SSH_FILEXFER_ATTR_LINK_COUNT: u32 = 0x0000_2000;
pub const SSH_FILEXFER_ATTR_UNTRANSLATED_NAME: u32 = 0x0000_4000;
pub const SSH_FILEXFER_ATTR_CTIME: u32 = 0x0000_8000;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x8000_0000;

// File types carried in the v4+ attribute type byte
pub const SSH_FILEXFER_TYPE_REGULAR: u8 = 1;
pub const SSH_FILEXFER_TYPE_DIRECTORY: u8 = 2;
pub const SSH_FILEXFER_TYPE_SYMLINK: u8 = 3;
pub const SSH_FILEXFER_TYPE_SPECIAL: u8 = 4;
pub const SSH_FILEXFER_TYPE_UNKNOWN: u8 = 5;
pub const SSH_FILEXFER_TYPE_SOCKET: u8 = 6;
pub const SSH_FILEXFER_TYPE_CHAR_DEVICE: u8 = 7;
pub const SSH_FILEXFER_TYPE_BLOCK_DEVICE: u8 = 8;
pub const SSH_FILEXFER_TYPE_FIFO: u8 = 9;

// Open pflags (protocol version < 5)
pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;

// Open disposition and flags (protocol version >= 5)
pub const SSH_FXF_CREATE_NEW: u32 = 0x0000_0000;
pub const SSH_FXF_CREATE_TRUNCATE: u32 = 0x0000_0001;
pub const SSH_FXF_OPEN_EXISTING: u32 = 0x0000_0002;
pub const SSH_FXF_OPEN_OR_CREATE: u32 = 0x0000_0003;
pub const SSH_FXF_TRUNCATE_EXISTING: u32 = 0x0000_0004;
pub const SSH_FXF_ACCESS_DISPOSITION: u32 = 0x0000_0007;
pub const SSH_FXF_APPEND_DATA: u32 = 0x0000_0008;

// ACE4 access mask bits used in the v5+ OPEN desired-access word
pub const ACE4_READ_DATA: u32 = 0x0000_0001;
pub const ACE4_WRITE_DATA: u32 = 0x0000_0002;
pub const ACE4_APPEND_DATA: u32 = 0x0000_0004;

// Rename flags (protocol version >= 6)
pub const SSH_FXF_RENAME_OVERWRITE: u32 = 0x0000_0001;
pub const SSH_FXF_RENAME_ATOMIC: u32 = 0x0000_0002;
pub const SSH_FXF_RENAME_NATIVE: u32 = 0x0000_0004;

// Extension names this client recognises
pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
pub const EXT_STATVFS: &str = "statvfs@openssh.com";
pub const EXT_FSTATVFS: &str = "fstatvfs@openssh.com";
pub const EXT_HARDLINK: &str = "hardlink@openssh.com";
pub const EXT_FSYNC: &str = "fsync@openssh.com";
pub const EXT_LSETSTAT: &str = "lsetstat@openssh.com";
pub const EXT_LIMITS: &str = "limits@openssh.com";
pub const EXT_EXPAND_PATH: &str = "expand-path@openssh.com";
pub const EXT_COPY_DATA: &str = "copy-data";
pub const EXT_SUPPORTED2: &str = "supported2";

// Engine tunables

/// Receive buffer ceiling before any limits negotiation.
pub const DEFAULT_MAX_MSG_LENGTH: usize = 262_144;
/// Band into which a server-advertised max packet length is clamped.
pub const MSG_LENGTH_FLOOR: usize = 4_096;
pub const HARD_MAX_MSG_LENGTH: usize = 4 * 1024 * 1024;

/// Transfer block size used when the caller does not negotiate one.
pub const DEFAULT_BLOCKSIZE: u32 = 32_768;
/// Worst-case framing around one block (length, type, id, handle,
/// offset, data length); blocksizes are clamped so a full WRITE frame
/// always fits in the negotiated packet length.
pub const FRAME_OVERHEAD: usize = 1_024;

/// Compile-time ceiling for the deferred reply ring; the effective cap
/// is the smaller of this and the server's max-open-handles limit.
pub const MAX_REPLY_BUFFER: usize = 80;

/// Write-ahead window: at most this many unacknowledged WRITE requests,
/// and at most MAX_PENDING_WRITE_BUFFER bytes of them.
pub const MAX_PENDING_WRITES: usize = 64;
pub const MAX_PENDING_WRITE_BUFFER: usize = 786_432;

/// Adaptive read window: starts at the step, grows by the step.
pub const READ_WINDOW_STEP: usize = 4;
pub const MAX_PIPELINED_READS: usize = 64;

/// Default per-call transfer timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// How long `quit` waits for the ssh child before sending SIGKILL.
pub const QUIT_GRACE_MS: u64 = 2_000;
pub const REAP_POLL_MS: u64 = 50;
