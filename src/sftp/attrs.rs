//! Decode and encode of the variable ATTRS structure. The field set
//! and order changed between protocol versions 3 and 4; both layouts
//! are handled here so the rest of the client never looks at the flag
//! word.

use std::ffi::CString;

use log::debug;

use super::codec::{BufferReader, PacketBuf};
use super::constants::*;
use super::error::SftpError;
use super::types::{FileAttributes, FileType};

/// Flag bits this decoder understands for a given protocol version.
fn known_flags(version: u32) -> u32 {
    if version < 4 {
        SSH_FILEXFER_ATTR_SIZE
            | SSH_FILEXFER_ATTR_UIDGID
            | SSH_FILEXFER_ATTR_PERMISSIONS
            | SSH_FILEXFER_ATTR_ACMODTIME
            | SSH_FILEXFER_ATTR_EXTENDED
    } else {
        SSH_FILEXFER_ATTR_SIZE
            | SSH_FILEXFER_ATTR_PERMISSIONS
            | SSH_FILEXFER_ATTR_ACCESSTIME
            | SSH_FILEXFER_ATTR_CREATETIME
            | SSH_FILEXFER_ATTR_MODIFYTIME
            | SSH_FILEXFER_ATTR_ACL
            | SSH_FILEXFER_ATTR_OWNERGROUP
            | SSH_FILEXFER_ATTR_SUBSECOND_TIMES
            | SSH_FILEXFER_ATTR_BITS
            | SSH_FILEXFER_ATTR_ALLOCATION_SIZE
            | SSH_FILEXFER_ATTR_TEXT_HINT
            | SSH_FILEXFER_ATTR_MIME_TYPE
            | SSH_FILEXFER_ATTR_LINK_COUNT
            | SSH_FILEXFER_ATTR_UNTRANSLATED_NAME
            | SSH_FILEXFER_ATTR_CTIME
            | SSH_FILEXFER_ATTR_EXTENDED
    }
}

/// Decode an ATTRS block at the reader's position.
///
/// Short payloads are tolerated: decoding stops at the truncation and
/// whatever was parsed so far is returned, with a debug log. Flag bits
/// we do not understand are logged and ignored.
pub fn decode(reader: &mut BufferReader<'_>, version: u32) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    let flags = match reader.read_u32() {
        Ok(flags) => flags,
        Err(e) => {
            debug!("attribute block missing flag word: {}", e);
            return attrs;
        }
    };
    let leftover = flags & !known_flags(version);
    if leftover != 0 {
        debug!("ignoring unknown attribute flag bits 0x{:08x}", leftover);
    }
    let result = if version < 4 {
        decode_v3(reader, flags, &mut attrs)
    } else {
        decode_v4(reader, flags, version, &mut attrs)
    };
    if let Err(e) = result {
        debug!("short attribute block, keeping fields parsed so far: {}", e);
    }
    attrs
}

fn decode_v3(
    reader: &mut BufferReader<'_>,
    flags: u32,
    attrs: &mut FileAttributes,
) -> Result<(), SftpError> {
    if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
        attrs.size = Some(reader.read_u64()?);
    }
    if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
        attrs.uid = Some(reader.read_u32()?);
        attrs.gid = Some(reader.read_u32()?);
    }
    if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
        let permissions = reader.read_u32()?;
        attrs.permissions = Some(permissions);
        attrs.file_type = FileType::from_permissions(permissions);
    }
    if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
        attrs.atime = Some(reader.read_u32()? as u64);
        attrs.mtime = Some(reader.read_u32()? as u64);
    }
    if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
        skip_extended_pairs(reader)?;
    }
    Ok(())
}

fn decode_v4(
    reader: &mut BufferReader<'_>,
    flags: u32,
    version: u32,
    attrs: &mut FileAttributes,
) -> Result<(), SftpError> {
    attrs.file_type = FileType::from_type_byte(reader.read_u8()?);
    if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
        attrs.size = Some(reader.read_u64()?);
    }
    if flags & SSH_FILEXFER_ATTR_ALLOCATION_SIZE != 0 {
        reader.skip(8)?;
    }
    if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
        let owner = reader.read_utf8()?;
        let group = reader.read_utf8()?;
        attrs.uid = lookup_uid(&owner);
        attrs.gid = lookup_gid(&group);
        attrs.owner = Some(owner);
        attrs.group = Some(group);
    }
    if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
        attrs.permissions = Some(reader.read_u32()?);
    }
    let subsecond = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;
    if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
        attrs.atime = Some(reader.read_u64()?);
        if subsecond {
            reader.skip(4)?;
        }
    }
    if flags & SSH_FILEXFER_ATTR_CREATETIME != 0 {
        reader.skip(8)?;
        if subsecond {
            reader.skip(4)?;
        }
    }
    if flags & SSH_FILEXFER_ATTR_MODIFYTIME != 0 {
        attrs.mtime = Some(reader.read_u64()?);
        if subsecond {
            reader.skip(4)?;
        }
    }
    if flags & SSH_FILEXFER_ATTR_CTIME != 0 {
        attrs.ctime = Some(reader.read_u64()?);
        if subsecond {
            reader.skip(4)?;
        }
    }
    if flags & SSH_FILEXFER_ATTR_ACL != 0 {
        reader.skip_string()?;
    }
    if flags & SSH_FILEXFER_ATTR_BITS != 0 {
        // one word in draft 5, attrib-bits plus attrib-bits-valid in 6
        reader.skip(if version >= 6 { 8 } else { 4 })?;
    }
    if flags & SSH_FILEXFER_ATTR_TEXT_HINT != 0 {
        reader.skip(1)?;
    }
    if flags & SSH_FILEXFER_ATTR_MIME_TYPE != 0 {
        reader.skip_string()?;
    }
    if flags & SSH_FILEXFER_ATTR_LINK_COUNT != 0 {
        reader.skip(4)?;
    }
    if flags & SSH_FILEXFER_ATTR_UNTRANSLATED_NAME != 0 {
        reader.skip_string()?;
    }
    if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
        skip_extended_pairs(reader)?;
    }
    Ok(())
}

fn skip_extended_pairs(reader: &mut BufferReader<'_>) -> Result<(), SftpError> {
    let count = reader.read_u32()?;
    for _ in 0..count {
        reader.skip_string()?;
        reader.skip_string()?;
    }
    Ok(())
}

fn lookup_uid(owner: &str) -> Option<u32> {
    let name = CString::new(owner).ok()?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        Some(unsafe { (*pw).pw_uid })
    }
}

fn lookup_gid(group: &str) -> Option<u32> {
    let name = CString::new(group).ok()?;
    let gr = unsafe { libc::getgrnam(name.as_ptr()) };
    if gr.is_null() {
        None
    } else {
        Some(unsafe { (*gr).gr_gid })
    }
}

/// The attribute subsets this client ever sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrPatch {
    Empty,
    Permissions(u32),
    Times { mtime: u64, atime: u64 },
}

impl AttrPatch {
    pub fn encode(&self, buf: &mut PacketBuf, version: u32) {
        match self {
            AttrPatch::Empty => {
                buf.add_u32(0);
                if version >= 4 {
                    buf.add_u8(SSH_FILEXFER_TYPE_UNKNOWN);
                }
            }
            AttrPatch::Permissions(mode) => {
                buf.add_u32(SSH_FILEXFER_ATTR_PERMISSIONS);
                if version >= 4 {
                    buf.add_u8(SSH_FILEXFER_TYPE_UNKNOWN);
                }
                buf.add_u32(*mode);
            }
            AttrPatch::Times { mtime, atime } => {
                if version < 4 {
                    buf.add_u32(SSH_FILEXFER_ATTR_ACMODTIME);
                    buf.add_u32(*atime as u32);
                    buf.add_u32(*mtime as u32);
                } else {
                    buf.add_u32(SSH_FILEXFER_ATTR_ACCESSTIME | SSH_FILEXFER_ATTR_MODIFYTIME);
                    buf.add_u8(SSH_FILEXFER_TYPE_UNKNOWN);
                    buf.add_u64(*atime);
                    buf.add_u64(*mtime);
                }
            }
        }
    }
}
