pub mod attrs;
pub mod client;
pub mod codec;
pub mod constants;
pub mod error;
pub mod launcher;
pub mod packet;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use client::{OpenedFile, SftpClient};
pub use error::SftpError;
pub use launcher::ConnectOptions;
pub use types::{FileAttributes, FileInfo, OpenMode};
