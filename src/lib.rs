//! SFTP client core for high-throughput file distribution, tunnelled
//! through the stdio pipes of a spawned `ssh` subprocess running the
//! server's sftp subsystem. Speaks protocol drafts 3 through 6 plus
//! the common OpenSSH extensions, with pipelined reads and writes,
//! out-of-order reply buffering and bounded create-parent retries for
//! the mutating operations.

pub mod sftp;

pub use sftp::{ConnectOptions, FileAttributes, FileInfo, OpenMode, OpenedFile, SftpClient, SftpError};
