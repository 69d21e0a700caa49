use log::debug;

use super::attrs::{self, AttrPatch};
use super::codec::{BufferReader, PacketBuf};
use super::constants::*;
use super::error::SftpError;
use super::types::{FileAttributes, FileInfo, OpenMode};

pub trait SftpPacketInfo {
    fn packet_type(&self) -> u8;
    fn packet_name(&self) -> &'static str;
}

/// Requests this client sends. READ and WRITE are absent on purpose:
/// the session builds those frames directly into its send path so the
/// data block is copied once.
#[derive(Debug)]
pub enum ClientPacket {
    Init {
        version: u32,
    },
    Open {
        request_id: u32,
        path: String,
        mode: OpenMode,
        append: bool,
        perm: Option<u32>,
    },
    Close {
        request_id: u32,
        handle: Vec<u8>,
    },
    Stat {
        request_id: u32,
        path: String,
    },
    FStat {
        request_id: u32,
        handle: Vec<u8>,
    },
    SetStat {
        request_id: u32,
        path: String,
        patch: AttrPatch,
    },
    FSetStat {
        request_id: u32,
        handle: Vec<u8>,
        patch: AttrPatch,
    },
    OpenDir {
        request_id: u32,
        path: String,
    },
    ReadDir {
        request_id: u32,
        handle: Vec<u8>,
    },
    Remove {
        request_id: u32,
        path: String,
    },
    MkDir {
        request_id: u32,
        path: String,
        perm: Option<u32>,
    },
    RealPath {
        request_id: u32,
        path: String,
    },
    Rename {
        request_id: u32,
        oldpath: String,
        newpath: String,
    },
    Symlink {
        request_id: u32,
        target: String,
        link: String,
    },
    Extended {
        request_id: u32,
        name: String,
        data: Vec<u8>,
    },
}

/// Replies the server sends, dispatched on once at the framer so no
/// downstream code re-reads the type byte.
#[derive(Debug)]
pub enum ServerPacket {
    Version {
        version: u32,
        extensions: Vec<(String, Vec<u8>)>,
    },
    Status {
        request_id: u32,
        code: u32,
        message: String,
    },
    Handle {
        request_id: u32,
        handle: Vec<u8>,
    },
    Data {
        request_id: u32,
        data: Vec<u8>,
    },
    Name {
        request_id: u32,
        entries: Vec<FileInfo>,
    },
    Attrs {
        request_id: u32,
        attrs: FileAttributes,
    },
    ExtendedReply {
        request_id: u32,
        data: Vec<u8>,
    },
}

impl SftpPacketInfo for ClientPacket {
    fn packet_type(&self) -> u8 {
        match self {
            ClientPacket::Init { .. } => SSH_FXP_INIT,
            ClientPacket::Open { .. } => SSH_FXP_OPEN,
            ClientPacket::Close { .. } => SSH_FXP_CLOSE,
            ClientPacket::Stat { .. } => SSH_FXP_STAT,
            ClientPacket::FStat { .. } => SSH_FXP_FSTAT,
            ClientPacket::SetStat { .. } => SSH_FXP_SETSTAT,
            ClientPacket::FSetStat { .. } => SSH_FXP_FSETSTAT,
            ClientPacket::OpenDir { .. } => SSH_FXP_OPENDIR,
            ClientPacket::ReadDir { .. } => SSH_FXP_READDIR,
            ClientPacket::Remove { .. } => SSH_FXP_REMOVE,
            ClientPacket::MkDir { .. } => SSH_FXP_MKDIR,
            ClientPacket::RealPath { .. } => SSH_FXP_REALPATH,
            ClientPacket::Rename { .. } => SSH_FXP_RENAME,
            ClientPacket::Symlink { .. } => SSH_FXP_SYMLINK,
            ClientPacket::Extended { .. } => SSH_FXP_EXTENDED,
        }
    }

    fn packet_name(&self) -> &'static str {
        match self {
            ClientPacket::Init { .. } => "SSH_FXP_INIT",
            ClientPacket::Open { .. } => "SSH_FXP_OPEN",
            ClientPacket::Close { .. } => "SSH_FXP_CLOSE",
            ClientPacket::Stat { .. } => "SSH_FXP_STAT",
            ClientPacket::FStat { .. } => "SSH_FXP_FSTAT",
            ClientPacket::SetStat { .. } => "SSH_FXP_SETSTAT",
            ClientPacket::FSetStat { .. } => "SSH_FXP_FSETSTAT",
            ClientPacket::OpenDir { .. } => "SSH_FXP_OPENDIR",
            ClientPacket::ReadDir { .. } => "SSH_FXP_READDIR",
            ClientPacket::Remove { .. } => "SSH_FXP_REMOVE",
            ClientPacket::MkDir { .. } => "SSH_FXP_MKDIR",
            ClientPacket::RealPath { .. } => "SSH_FXP_REALPATH",
            ClientPacket::Rename { .. } => "SSH_FXP_RENAME",
            ClientPacket::Symlink { .. } => "SSH_FXP_SYMLINK",
            ClientPacket::Extended { .. } => "SSH_FXP_EXTENDED",
        }
    }
}

impl SftpPacketInfo for ServerPacket {
    fn packet_type(&self) -> u8 {
        match self {
            ServerPacket::Version { .. } => SSH_FXP_VERSION,
            ServerPacket::Status { .. } => SSH_FXP_STATUS,
            ServerPacket::Handle { .. } => SSH_FXP_HANDLE,
            ServerPacket::Data { .. } => SSH_FXP_DATA,
            ServerPacket::Name { .. } => SSH_FXP_NAME,
            ServerPacket::Attrs { .. } => SSH_FXP_ATTRS,
            ServerPacket::ExtendedReply { .. } => SSH_FXP_EXTENDED_REPLY,
        }
    }

    fn packet_name(&self) -> &'static str {
        match self {
            ServerPacket::Version { .. } => "SSH_FXP_VERSION",
            ServerPacket::Status { .. } => "SSH_FXP_STATUS",
            ServerPacket::Handle { .. } => "SSH_FXP_HANDLE",
            ServerPacket::Data { .. } => "SSH_FXP_DATA",
            ServerPacket::Name { .. } => "SSH_FXP_NAME",
            ServerPacket::Attrs { .. } => "SSH_FXP_ATTRS",
            ServerPacket::ExtendedReply { .. } => "SSH_FXP_EXTENDED_REPLY",
        }
    }
}

impl ClientPacket {
    /// Encode into a complete frame. The protocol version decides the
    /// OPEN layout, the STAT attribute mask and the RENAME flags.
    pub fn to_bytes(&self, version: u32) -> Vec<u8> {
        match self {
            ClientPacket::Init { version } => PacketBuf::init(SSH_FXP_INIT, *version).finish(),
            ClientPacket::Open {
                request_id,
                path,
                mode,
                append,
                perm,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_OPEN, *request_id);
                buf.add_string(path);
                if version < 5 {
                    let pflags = match (mode, append) {
                        (OpenMode::Read, _) => SSH_FXF_READ,
                        (OpenMode::Write, false) => SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC,
                        (OpenMode::Write, true) => SSH_FXF_WRITE | SSH_FXF_CREAT,
                    };
                    buf.add_u32(pflags);
                } else {
                    let (access, flags) = match (mode, append) {
                        (OpenMode::Read, _) => (ACE4_READ_DATA, SSH_FXF_OPEN_EXISTING),
                        (OpenMode::Write, false) => (ACE4_WRITE_DATA, SSH_FXF_CREATE_TRUNCATE),
                        (OpenMode::Write, true) => (
                            ACE4_WRITE_DATA | ACE4_APPEND_DATA,
                            SSH_FXF_OPEN_OR_CREATE | SSH_FXF_APPEND_DATA,
                        ),
                    };
                    buf.add_u32(access);
                    buf.add_u32(flags);
                }
                let patch = perm.map_or(AttrPatch::Empty, AttrPatch::Permissions);
                patch.encode(&mut buf, version);
                buf.finish()
            }
            ClientPacket::Close { request_id, handle } => {
                let mut buf = PacketBuf::request(SSH_FXP_CLOSE, *request_id);
                buf.add_bytes(handle);
                buf.finish()
            }
            ClientPacket::Stat { request_id, path } => {
                let mut buf = PacketBuf::request(SSH_FXP_STAT, *request_id);
                buf.add_string(path);
                if version >= 6 {
                    buf.add_u32(SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_MODIFYTIME);
                }
                buf.finish()
            }
            ClientPacket::FStat { request_id, handle } => {
                let mut buf = PacketBuf::request(SSH_FXP_FSTAT, *request_id);
                buf.add_bytes(handle);
                if version >= 6 {
                    buf.add_u32(SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_MODIFYTIME);
                }
                buf.finish()
            }
            ClientPacket::SetStat {
                request_id,
                path,
                patch,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_SETSTAT, *request_id);
                buf.add_string(path);
                patch.encode(&mut buf, version);
                buf.finish()
            }
            ClientPacket::FSetStat {
                request_id,
                handle,
                patch,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_FSETSTAT, *request_id);
                buf.add_bytes(handle);
                patch.encode(&mut buf, version);
                buf.finish()
            }
            ClientPacket::OpenDir { request_id, path } => {
                let mut buf = PacketBuf::request(SSH_FXP_OPENDIR, *request_id);
                buf.add_string(path);
                buf.finish()
            }
            ClientPacket::ReadDir { request_id, handle } => {
                let mut buf = PacketBuf::request(SSH_FXP_READDIR, *request_id);
                buf.add_bytes(handle);
                buf.finish()
            }
            ClientPacket::Remove { request_id, path } => {
                let mut buf = PacketBuf::request(SSH_FXP_REMOVE, *request_id);
                buf.add_string(path);
                buf.finish()
            }
            ClientPacket::MkDir {
                request_id,
                path,
                perm,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_MKDIR, *request_id);
                buf.add_string(path);
                let patch = perm.map_or(AttrPatch::Empty, AttrPatch::Permissions);
                patch.encode(&mut buf, version);
                buf.finish()
            }
            ClientPacket::RealPath { request_id, path } => {
                let mut buf = PacketBuf::request(SSH_FXP_REALPATH, *request_id);
                buf.add_string(path);
                buf.finish()
            }
            ClientPacket::Rename {
                request_id,
                oldpath,
                newpath,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_RENAME, *request_id);
                buf.add_string(oldpath);
                buf.add_string(newpath);
                if version >= 6 {
                    buf.add_u32(SSH_FXF_RENAME_OVERWRITE | SSH_FXF_RENAME_ATOMIC);
                }
                buf.finish()
            }
            ClientPacket::Symlink {
                request_id,
                target,
                link,
            } => {
                // OpenSSH sends (targetpath, linkpath), the reverse of
                // the draft field order; interop with OpenSSH wins.
                let mut buf = PacketBuf::request(SSH_FXP_SYMLINK, *request_id);
                buf.add_string(target);
                buf.add_string(link);
                buf.finish()
            }
            ClientPacket::Extended {
                request_id,
                name,
                data,
            } => {
                let mut buf = PacketBuf::request(SSH_FXP_EXTENDED, *request_id);
                buf.add_string(name);
                buf.add_raw(data);
                buf.finish()
            }
        }
    }
}

impl ServerPacket {
    /// Decode a complete frame payload (type byte onward).
    pub fn decode(payload: &[u8], version: u32) -> Result<Self, SftpError> {
        let mut reader = BufferReader::new(payload);
        let packet_type = reader.read_u8()?;
        match packet_type {
            SSH_FXP_VERSION => {
                let version = reader.read_u32()?;
                let mut extensions = Vec::new();
                while !reader.is_empty() {
                    let name = reader.read_utf8()?;
                    let data = reader.read_string()?;
                    extensions.push((name, data));
                }
                Ok(ServerPacket::Version {
                    version,
                    extensions,
                })
            }
            SSH_FXP_STATUS => {
                let request_id = reader.read_u32()?;
                let code = reader.read_u32()?;
                // the message and language tag were added in draft 3;
                // tolerate servers that omit them
                let message = if reader.is_empty() {
                    String::new()
                } else {
                    reader.read_utf8()?
                };
                if !reader.is_empty() {
                    reader.skip_string()?; // language tag
                }
                Ok(ServerPacket::Status {
                    request_id,
                    code,
                    message,
                })
            }
            SSH_FXP_HANDLE => {
                let request_id = reader.read_u32()?;
                let handle = reader.read_string()?;
                Ok(ServerPacket::Handle { request_id, handle })
            }
            SSH_FXP_DATA => {
                let request_id = reader.read_u32()?;
                let data = reader.read_string()?;
                Ok(ServerPacket::Data { request_id, data })
            }
            SSH_FXP_NAME => {
                let request_id = reader.read_u32()?;
                let count = reader.read_u32()?;
                let mut entries = Vec::new();
                for index in 0..count {
                    if reader.is_empty() {
                        debug!(
                            "NAME reply claimed {} entries but ended after {}",
                            count, index
                        );
                        break;
                    }
                    let name = reader.read_utf8()?;
                    let longname = if version < 4 {
                        Some(reader.read_utf8()?)
                    } else {
                        None
                    };
                    let attrs = attrs::decode(&mut reader, version);
                    entries.push(FileInfo {
                        name,
                        longname,
                        attrs,
                    });
                }
                Ok(ServerPacket::Name {
                    request_id,
                    entries,
                })
            }
            SSH_FXP_ATTRS => {
                let request_id = reader.read_u32()?;
                let attrs = attrs::decode(&mut reader, version);
                Ok(ServerPacket::Attrs { request_id, attrs })
            }
            SSH_FXP_EXTENDED_REPLY => {
                let request_id = reader.read_u32()?;
                let mut data = Vec::with_capacity(reader.remaining());
                while !reader.is_empty() {
                    data.push(reader.read_u8()?);
                }
                Ok(ServerPacket::ExtendedReply { request_id, data })
            }
            other => Err(SftpError::Protocol(format!(
                "unknown reply type {}",
                other
            ))),
        }
    }

    /// The request id this reply answers; VERSION has none.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            ServerPacket::Version { .. } => None,
            ServerPacket::Status { request_id, .. }
            | ServerPacket::Handle { request_id, .. }
            | ServerPacket::Data { request_id, .. }
            | ServerPacket::Name { request_id, .. }
            | ServerPacket::Attrs { request_id, .. }
            | ServerPacket::ExtendedReply { request_id, .. } => Some(*request_id),
        }
    }
}
