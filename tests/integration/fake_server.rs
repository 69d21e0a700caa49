//! A scripted protocol-3 SFTP server running on a thread, talking
//! over one end of a socketpair. It keeps an in-memory filesystem so
//! tests can assert on what the client actually did, and it mimics
//! the OpenSSH behaviours the client codes around: REALPATH resolves
//! names that do not exist, RENAME onto an existing target fails,
//! MKDIR needs the parent to be there.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use ferric_sftp::sftp::codec::BufferReader;
use ferric_sftp::sftp::constants::*;

pub const HOME: &str = "/home/test";

#[derive(Default)]
pub struct ServerConfig {
    pub extensions: Vec<(&'static str, &'static str)>,
    /// Files present before the client connects.
    pub files: Vec<(String, Vec<u8>)>,
    /// Directories present beyond /, /home and the home directory.
    pub dirs: Vec<String>,
}

pub struct ServerState {
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: Vec<String>,
    pub write_frames: u32,
    pub removes: Vec<String>,
    pub symlinks: Vec<(String, String)>,
}

enum Handle {
    File(String),
    Dir { path: String, listed: bool },
}

pub fn spawn(stream: UnixStream, config: ServerConfig) -> JoinHandle<ServerState> {
    thread::spawn(move || serve(stream, config))
}

fn serve(mut stream: UnixStream, config: ServerConfig) -> ServerState {
    let mut dirs = vec!["/".to_string(), "/home".to_string(), HOME.to_string()];
    dirs.extend(config.dirs.iter().cloned());
    let mut state = ServerState {
        files: config.files.iter().cloned().collect(),
        dirs,
        write_frames: 0,
        removes: Vec::new(),
        symlinks: Vec::new(),
    };
    let mut handles: HashMap<Vec<u8>, Handle> = HashMap::new();
    let mut next_handle = 0u32;
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            break;
        }
        let length = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; length];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }
        let reply = match dispatch(
            &payload,
            &config,
            &mut state,
            &mut handles,
            &mut next_handle,
        ) {
            Some(reply) => reply,
            None => break,
        };
        let mut frame = (reply.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&reply);
        if stream.write_all(&frame).is_err() {
            break;
        }
    }
    state
}

fn dispatch(
    payload: &[u8],
    config: &ServerConfig,
    state: &mut ServerState,
    handles: &mut HashMap<Vec<u8>, Handle>,
    next_handle: &mut u32,
) -> Option<Vec<u8>> {
    let mut reader = BufferReader::new(payload);
    let packet_type = reader.read_u8().ok()?;
    if packet_type == SSH_FXP_INIT {
        let _client_version = reader.read_u32().ok()?;
        let mut body = vec![SSH_FXP_VERSION];
        body.extend_from_slice(&3u32.to_be_bytes());
        for (name, value) in &config.extensions {
            put_string(&mut body, name.as_bytes());
            put_string(&mut body, value.as_bytes());
        }
        return Some(body);
    }
    let id = reader.read_u32().ok()?;
    match packet_type {
        SSH_FXP_REALPATH => {
            let path = read_path(&mut reader)?;
            // protocol 3: resolve textually whether or not it exists
            let resolved = normalize(&path);
            Some(name_body(id, &[(resolved, 0, 0o040755)]))
        }
        SSH_FXP_STAT | SSH_FXP_LSTAT => {
            let path = normalize(&read_path(&mut reader)?);
            if state.dirs.contains(&path) {
                Some(attrs_body(id, 0, 0o040755))
            } else if let Some(content) = state.files.get(&path) {
                Some(attrs_body(id, content.len() as u64, 0o100644))
            } else {
                Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no such file"))
            }
        }
        SSH_FXP_OPEN => {
            let path = normalize(&read_path(&mut reader)?);
            let pflags = reader.read_u32().ok()?;
            if !state.dirs.contains(&parent_of(&path)) {
                return Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no parent"));
            }
            if pflags & SSH_FXF_WRITE != 0 {
                let entry = state.files.entry(path.clone()).or_default();
                if pflags & SSH_FXF_TRUNC != 0 {
                    entry.clear();
                }
            } else if !state.files.contains_key(&path) {
                return Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no such file"));
            }
            let handle = next_handle.to_be_bytes().to_vec();
            *next_handle += 1;
            handles.insert(handle.clone(), Handle::File(path));
            Some(handle_body(id, &handle))
        }
        SSH_FXP_WRITE => {
            let handle = reader.read_string().ok()?;
            let offset = reader.read_u64().ok()? as usize;
            let data = reader.read_string().ok()?;
            state.write_frames += 1;
            let path = match handles.get(&handle) {
                Some(Handle::File(path)) => path.clone(),
                _ => return Some(status_body(id, SSH_FX_INVALID_HANDLE, "bad handle")),
            };
            let file = state.files.entry(path).or_default();
            if file.len() < offset + data.len() {
                file.resize(offset + data.len(), 0);
            }
            file[offset..offset + data.len()].copy_from_slice(&data);
            Some(status_body(id, SSH_FX_OK, ""))
        }
        SSH_FXP_READ => {
            let handle = reader.read_string().ok()?;
            let offset = reader.read_u64().ok()? as usize;
            let wanted = reader.read_u32().ok()? as usize;
            let path = match handles.get(&handle) {
                Some(Handle::File(path)) => path.clone(),
                _ => return Some(status_body(id, SSH_FX_INVALID_HANDLE, "bad handle")),
            };
            let content = match state.files.get(&path) {
                Some(content) => content,
                None => return Some(status_body(id, SSH_FX_NO_SUCH_FILE, "gone")),
            };
            if offset >= content.len() {
                return Some(status_body(id, SSH_FX_EOF, "eof"));
            }
            let end = (offset + wanted).min(content.len());
            Some(data_body(id, &content[offset..end]))
        }
        SSH_FXP_CLOSE => {
            let handle = reader.read_string().ok()?;
            handles.remove(&handle);
            Some(status_body(id, SSH_FX_OK, ""))
        }
        SSH_FXP_MKDIR => {
            let path = normalize(&read_path(&mut reader)?);
            if state.dirs.contains(&path) {
                Some(status_body(id, SSH_FX_FAILURE, "exists"))
            } else if !state.dirs.contains(&parent_of(&path)) {
                Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no parent"))
            } else {
                state.dirs.push(path);
                Some(status_body(id, SSH_FX_OK, ""))
            }
        }
        SSH_FXP_SETSTAT => Some(status_body(id, SSH_FX_OK, "")),
        SSH_FXP_REMOVE => {
            let path = normalize(&read_path(&mut reader)?);
            if state.files.remove(&path).is_some() {
                state.removes.push(path);
                Some(status_body(id, SSH_FX_OK, ""))
            } else {
                Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no such file"))
            }
        }
        SSH_FXP_RENAME => {
            let old = normalize(&read_path(&mut reader)?);
            let new = normalize(&read_path(&mut reader)?);
            Some(rename(state, id, &old, &new, false))
        }
        SSH_FXP_SYMLINK => {
            let target = read_path(&mut reader)?;
            let link = normalize(&read_path(&mut reader)?);
            state.symlinks.push((target, link));
            Some(status_body(id, SSH_FX_OK, ""))
        }
        SSH_FXP_OPENDIR => {
            let path = normalize(&read_path(&mut reader)?);
            if !state.dirs.contains(&path) {
                return Some(status_body(id, SSH_FX_NO_SUCH_FILE, "no such dir"));
            }
            let handle = next_handle.to_be_bytes().to_vec();
            *next_handle += 1;
            handles.insert(
                handle.clone(),
                Handle::Dir {
                    path,
                    listed: false,
                },
            );
            Some(handle_body(id, &handle))
        }
        SSH_FXP_READDIR => {
            let handle = reader.read_string().ok()?;
            match handles.get_mut(&handle) {
                Some(Handle::Dir { path, listed }) => {
                    if *listed {
                        return Some(status_body(id, SSH_FX_EOF, "done"));
                    }
                    *listed = true;
                    let dir = path.clone();
                    let mut entries = Vec::new();
                    for (file, content) in &state.files {
                        if parent_of(file) == dir {
                            entries.push((
                                last_component(file),
                                content.len() as u64,
                                0o100644,
                            ));
                        }
                    }
                    for sub in &state.dirs {
                        if sub != &dir && parent_of(sub) == dir {
                            entries.push((last_component(sub), 0, 0o040755));
                        }
                    }
                    entries.sort();
                    Some(name_body(id, &entries))
                }
                _ => Some(status_body(id, SSH_FX_INVALID_HANDLE, "bad handle")),
            }
        }
        SSH_FXP_EXTENDED => {
            let name = String::from_utf8(reader.read_string().ok()?).ok()?;
            if name == EXT_POSIX_RENAME {
                let old = normalize(&read_path(&mut reader)?);
                let new = normalize(&read_path(&mut reader)?);
                Some(rename(state, id, &old, &new, true))
            } else {
                Some(status_body(id, SSH_FX_OP_UNSUPPORTED, "unknown extension"))
            }
        }
        _ => Some(status_body(id, SSH_FX_OP_UNSUPPORTED, "not implemented")),
    }
}

fn rename(state: &mut ServerState, id: u32, old: &str, new: &str, overwrite: bool) -> Vec<u8> {
    if !state.files.contains_key(old) {
        return status_body(id, SSH_FX_NO_SUCH_FILE, "source missing");
    }
    if !state.dirs.contains(&parent_of(new)) {
        return status_body(id, SSH_FX_NO_SUCH_FILE, "no destination dir");
    }
    if state.files.contains_key(new) && !overwrite {
        return status_body(id, SSH_FX_FAILURE, "target exists");
    }
    let content = state.files.remove(old).unwrap();
    state.files.insert(new.to_string(), content);
    status_body(id, SSH_FX_OK, "")
}

fn read_path(reader: &mut BufferReader<'_>) -> Option<String> {
    reader.read_utf8().ok()
}

pub fn normalize(path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", HOME, path)
    };
    let mut components: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

fn last_component(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => path.to_string(),
    }
}

fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn status_body(id: u32, code: u32, message: &str) -> Vec<u8> {
    let mut body = vec![SSH_FXP_STATUS];
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&code.to_be_bytes());
    put_string(&mut body, message.as_bytes());
    put_string(&mut body, b"");
    body
}

fn handle_body(id: u32, handle: &[u8]) -> Vec<u8> {
    let mut body = vec![SSH_FXP_HANDLE];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, handle);
    body
}

fn data_body(id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = vec![SSH_FXP_DATA];
    body.extend_from_slice(&id.to_be_bytes());
    put_string(&mut body, data);
    body
}

fn attrs_block(out: &mut Vec<u8>, size: u64, permissions: u32) {
    out.extend_from_slice(
        &(SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_PERMISSIONS).to_be_bytes(),
    );
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&permissions.to_be_bytes());
}

fn attrs_body(id: u32, size: u64, permissions: u32) -> Vec<u8> {
    let mut body = vec![SSH_FXP_ATTRS];
    body.extend_from_slice(&id.to_be_bytes());
    attrs_block(&mut body, size, permissions);
    body
}

fn name_body(id: u32, entries: &[(String, u64, u32)]) -> Vec<u8> {
    let mut body = vec![SSH_FXP_NAME];
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (name, size, permissions) in entries {
        put_string(&mut body, name.as_bytes());
        let longname = format!("?????????? 1 test test {:>10} Jan  1 00:00 {}", size, name);
        put_string(&mut body, longname.as_bytes());
        attrs_block(&mut body, *size, *permissions);
    }
    body
}
