use chrono::{DateTime, Utc};

use super::constants::*;

/// File type as reported by the server, either from the v4+ type byte
/// or derived from the v3 permission bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    #[default]
    Unknown,
    RegularFile,
    Directory,
    Symlink,
    Special,
    Socket,
    CharDevice,
    BlockDevice,
    Fifo,
}

impl FileType {
    pub fn from_type_byte(byte: u8) -> Self {
        match byte {
            SSH_FILEXFER_TYPE_REGULAR => FileType::RegularFile,
            SSH_FILEXFER_TYPE_DIRECTORY => FileType::Directory,
            SSH_FILEXFER_TYPE_SYMLINK => FileType::Symlink,
            SSH_FILEXFER_TYPE_SPECIAL => FileType::Special,
            SSH_FILEXFER_TYPE_SOCKET => FileType::Socket,
            SSH_FILEXFER_TYPE_CHAR_DEVICE => FileType::CharDevice,
            SSH_FILEXFER_TYPE_BLOCK_DEVICE => FileType::BlockDevice,
            SSH_FILEXFER_TYPE_FIFO => FileType::Fifo,
            _ => FileType::Unknown,
        }
    }

    /// v3 servers only send permissions; the S_IFMT bits carry the type.
    pub fn from_permissions(permissions: u32) -> Self {
        match permissions & 0o170000 {
            0o100000 => FileType::RegularFile,
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            0o140000 => FileType::Socket,
            0o020000 => FileType::CharDevice,
            0o060000 => FileType::BlockDevice,
            0o010000 => FileType::Fifo,
            _ => FileType::Unknown,
        }
    }
}

/// Decoded ATTRS block. Fields the server did not send stay `None`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileAttributes {
    pub file_type: FileType,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
}

impl FileAttributes {
    pub fn is_directory(&self) -> bool {
        match self.file_type {
            FileType::Directory => true,
            FileType::Unknown => self
                .permissions
                .is_some_and(|p| FileType::from_permissions(p) == FileType::Directory),
            _ => false,
        }
    }

    pub fn is_regular_file(&self) -> bool {
        match self.file_type {
            FileType::RegularFile => true,
            FileType::Unknown => self
                .permissions
                .is_some_and(|p| FileType::from_permissions(p) == FileType::RegularFile),
            _ => false,
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// One directory entry from an SSH_FXP_NAME reply. Servers stopped
/// sending `longname` at protocol version 4.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub longname: Option<String>,
    pub attrs: FileAttributes,
}

impl FileInfo {
    /// `ls -l`-style line for listings: the server's longname when it
    /// sent one, otherwise synthesized from the attributes.
    pub fn display_line(&self) -> String {
        if let Some(longname) = &self.longname {
            return longname.clone();
        }
        let perms = format_permissions(&self.attrs);
        let owner = self
            .attrs
            .owner
            .clone()
            .unwrap_or_else(|| self.attrs.uid.map_or_else(|| "-".to_string(), |u| u.to_string()));
        let group = self
            .attrs
            .group
            .clone()
            .unwrap_or_else(|| self.attrs.gid.map_or_else(|| "-".to_string(), |g| g.to_string()));
        let size = self.attrs.size.unwrap_or(0);
        let when = self
            .attrs
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .map(|t| t.format("%b %e %H:%M").to_string())
            .unwrap_or_else(|| "            ".to_string());
        format!(
            "{} {:>8} {:>8} {:>12} {} {}",
            perms, owner, group, size, when, self.name
        )
    }
}

fn format_permissions(attrs: &FileAttributes) -> String {
    let type_char = match attrs.file_type {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::CharDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Socket => 's',
        FileType::Fifo => 'p',
        _ => '-',
    };
    let mode = attrs.permissions.unwrap_or(0);
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Access requested by `open_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn is_write(&self) -> bool {
        *self == OpenMode::Write
    }
}

/// Extensions the server advertised in its VERSION reply.
#[derive(Debug, Default, Clone)]
pub struct Extensions {
    pub posix_rename: bool,
    pub statvfs: bool,
    pub fstatvfs: bool,
    pub hardlink: bool,
    pub fsync: bool,
    pub lsetstat: bool,
    pub limits: bool,
    pub expand_path: bool,
    pub copy_data: bool,
    pub supported2: Option<Supported2>,
    /// Extensions we did not recognise, counted and skipped.
    pub unknown: u32,
}

/// The v6 `supported2` capability block. The draft was never ratified
/// and real deployments are rare, so every field is optional on decode.
#[derive(Debug, Default, Clone)]
pub struct Supported2 {
    pub attribute_mask: u32,
    pub attribute_bits: u32,
    pub open_flags: u32,
    pub access_mask: u32,
    pub max_read_size: u32,
    pub open_block_vector: u16,
    pub block_vector: u16,
    pub attrib_extension_names: Vec<String>,
    pub extension_names: Vec<String>,
}

/// Effective transfer limits, either from `limits@openssh.com` or the
/// compiled-in defaults. A zero means the server did not constrain it.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_packet_length: u64,
    pub max_read_length: u64,
    pub max_write_length: u64,
    pub max_open_handles: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_packet_length: DEFAULT_MAX_MSG_LENGTH as u64,
            max_read_length: 0,
            max_write_length: 0,
            max_open_handles: 0,
        }
    }
}
