//! The command layer: one method per SFTP operation, path resolution
//! against the session cwd, the create-missing-parents retries, and
//! the pipelined read/write entry points.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::attrs::AttrPatch;
use super::codec::encode_string;
use super::constants::*;
use super::error::SftpError;
use super::launcher::{spawn_ssh, ConnectOptions, SshChild};
use super::packet::{ClientPacket, ServerPacket, SftpPacketInfo};
use super::pipeline::{ReadPipeline, WriteQueue};
use super::session::SftpSession;
use super::transport::PipeTransport;
use super::types::{FileAttributes, FileInfo, FileType, OpenMode};

fn usage(message: &'static str) -> SftpError {
    error!("{}", message);
    SftpError::Usage(message)
}

struct OpenFile {
    handle: Vec<u8>,
    mode: OpenMode,
}

/// Result of `open_file`: the byte length of the WRITE/READ frame
/// prefix (so callers can size data buffers against the negotiated
/// packet length) and the directory suffix created on the retry path,
/// when any.
#[derive(Debug)]
pub struct OpenedFile {
    pub header_len: usize,
    pub created: Option<String>,
}

pub struct SftpClient {
    session: SftpSession,
    child: Option<SshChild>,
    simulation: bool,
    cwd: Option<String>,
    file: Option<OpenFile>,
    dir_handle: Option<Vec<u8>>,
    file_offset: u64,
    writes: WriteQueue,
    reads: Option<ReadPipeline>,
    names: VecDeque<FileInfo>,
    dir_eof: bool,
    dir_packets: u32,
    last_stat: Option<FileAttributes>,
}

impl SftpClient {
    /// Spawn ssh, negotiate, and return a ready session. In simulation
    /// mode the transport is /dev/null and every operation succeeds
    /// synthetically.
    pub fn connect(options: &ConnectOptions) -> Result<Self, SftpError> {
        let timeout_flag = Arc::new(AtomicBool::new(false));
        if options.simulation {
            let transport = devnull_transport(options.timeout, timeout_flag.clone())?;
            info!("simulation mode, not contacting {}", options.host);
            let session = SftpSession::simulated(Box::new(transport), timeout_flag);
            let mut client = Self::with_session(session);
            client.simulation = true;
            return Ok(client);
        }
        let (mut child, transport) = spawn_ssh(options, timeout_flag.clone())?;
        info!(
            "spawned ssh (pid {:?}) for {}:{}",
            child.pid(),
            options.host,
            options.port
        );
        match SftpSession::handshake(Box::new(transport), timeout_flag) {
            Ok(session) => {
                let mut client = Self::with_session(session);
                client.child = Some(child);
                Ok(client)
            }
            Err(err) => {
                child.reap(Duration::ZERO);
                Err(err)
            }
        }
    }

    /// Wrap an already negotiated session; the seam for tests and for
    /// embedding engines that launch and authenticate ssh themselves.
    pub fn with_session(session: SftpSession) -> Self {
        SftpClient {
            session,
            child: None,
            simulation: false,
            cwd: None,
            file: None,
            dir_handle: None,
            file_offset: 0,
            writes: WriteQueue::new(),
            reads: None,
            names: VecDeque::new(),
            dir_eof: false,
            dir_packets: 0,
            last_stat: None,
        }
    }

    pub fn version(&self) -> u32 {
        self.session.version()
    }

    pub fn features(&self) -> &super::types::Extensions {
        self.session.extensions()
    }

    pub fn limits(&self) -> &super::types::Limits {
        self.session.limits()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn last_stat(&self) -> Option<&FileAttributes> {
        self.last_stat.as_ref()
    }

    pub fn set_blocksize(&mut self, desired: u32) -> u32 {
        self.session.set_blocksize(desired)
    }

    /// Join a relative path under the session cwd; absolute paths and
    /// sessions without a cwd pass through unchanged.
    fn resolve(&self, path: &str) -> String {
        if path.is_empty() {
            return self
                .cwd
                .clone()
                .unwrap_or_else(|| ".".to_string());
        }
        match &self.cwd {
            Some(cwd) if !path.starts_with('/') => format!("{}/{}", cwd, path),
            _ => path.to_string(),
        }
    }

    fn realpath(&mut self, path: &str) -> Result<String, SftpError> {
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::RealPath {
            request_id,
            path: path.to_string(),
        };
        self.session.send_packet(&packet)?;
        match self.session.get_reply(request_id)? {
            ServerPacket::Name { mut entries, .. } => {
                if entries.len() == 1 {
                    Ok(entries.remove(0).name)
                } else {
                    Err(SftpError::Protocol(format!(
                        "REALPATH returned {} names",
                        entries.len()
                    )))
                }
            }
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to REALPATH",
                other.packet_name()
            ))),
        }
    }

    fn stat_resolved(&mut self, path: &str) -> Result<FileAttributes, SftpError> {
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::Stat {
            request_id,
            path: path.to_string(),
        };
        self.session.send_packet(&packet)?;
        match self.session.get_reply(request_id)? {
            ServerPacket::Attrs { attrs, .. } => Ok(attrs),
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to STAT",
                other.packet_name()
            ))),
        }
    }

    /// Change the working directory, optionally creating the whole
    /// path. Returns the directory suffix that had to be created.
    /// An empty `dir` resets the cwd to the server default.
    pub fn cd(
        &mut self,
        dir: &str,
        create: bool,
        mode: Option<u32>,
    ) -> Result<Option<String>, SftpError> {
        if dir.is_empty() {
            self.cwd = None;
            return Ok(None);
        }
        if self.simulation {
            self.cwd = Some(dir.to_string());
            return Ok(None);
        }
        let mut created = None;
        let resolved = match self.realpath(dir) {
            Ok(name) => {
                if self.session.version() < 4 {
                    // old servers resolve names for paths that do not
                    // exist; a follow-up STAT tells the truth
                    match self.stat_resolved(&name) {
                        Ok(_) => name,
                        Err(SftpError::Status {
                            code: SSH_FX_NO_SUCH_FILE,
                            ..
                        }) if create => {
                            created = self.create_missing_dirs(dir, mode)?;
                            self.realpath(dir)?
                        }
                        Err(err) => return Err(err),
                    }
                } else {
                    name
                }
            }
            Err(SftpError::Status {
                code: SSH_FX_NO_SUCH_FILE,
                ..
            }) if create => {
                created = self.create_missing_dirs(dir, mode)?;
                self.realpath(dir)?
            }
            Err(err) => return Err(err),
        };
        info!("working directory is now {}", resolved);
        self.cwd = Some(resolved);
        Ok(created)
    }

    /// Canonical form of the current directory, from the server.
    pub fn pwd(&mut self) -> Result<String, SftpError> {
        if self.simulation {
            return Ok(self.cwd.clone().unwrap_or_else(|| "/".to_string()));
        }
        let target = self.resolve(".");
        let name = self.realpath(&target)?;
        self.cwd = Some(name.clone());
        Ok(name)
    }

    /// STAT a path, or FSTAT the open file handle when `name` is None.
    pub fn stat(&mut self, name: Option<&str>) -> Result<FileAttributes, SftpError> {
        if self.simulation {
            let attrs = FileAttributes {
                file_type: FileType::RegularFile,
                size: Some(0),
                ..Default::default()
            };
            self.last_stat = Some(attrs.clone());
            return Ok(attrs);
        }
        let attrs = match name {
            Some(path) => {
                let resolved = self.resolve(path);
                self.stat_resolved(&resolved)?
            }
            None => {
                let handle = match &self.file {
                    Some(file) => file.handle.clone(),
                    None => return Err(usage("stat needs a file name or an open handle")),
                };
                let request_id = self.session.next_request_id();
                let packet = ClientPacket::FStat { request_id, handle };
                self.session.send_packet(&packet)?;
                match self.session.get_reply(request_id)? {
                    ServerPacket::Attrs { attrs, .. } => attrs,
                    ServerPacket::Status { code, message, .. } => {
                        return Err(SftpError::Status { code, message })
                    }
                    other => {
                        return Err(SftpError::Protocol(format!(
                            "unexpected {} reply to FSTAT",
                            other.packet_name()
                        )))
                    }
                }
            }
        };
        self.last_stat = Some(attrs.clone());
        Ok(attrs)
    }

    /// SETSTAT/FSETSTAT the modify and access times.
    pub fn set_file_time(
        &mut self,
        name: Option<&str>,
        mtime: u64,
        atime: u64,
    ) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        let patch = AttrPatch::Times { mtime, atime };
        self.setstat(name, patch)
    }

    /// SETSTAT/FSETSTAT the permission bits.
    pub fn chmod(&mut self, name: Option<&str>, mode: u32) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        match name {
            Some(path) => {
                let resolved = self.resolve(path);
                self.chmod_resolved(&resolved, mode)
            }
            None => self.setstat(None, AttrPatch::Permissions(mode)),
        }
    }

    fn chmod_resolved(&mut self, path: &str, mode: u32) -> Result<(), SftpError> {
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::SetStat {
            request_id,
            path: path.to_string(),
            patch: AttrPatch::Permissions(mode),
        };
        self.session.send_packet(&packet)?;
        self.session.expect_status(request_id)
    }

    fn setstat(&mut self, name: Option<&str>, patch: AttrPatch) -> Result<(), SftpError> {
        let request_id = self.session.next_request_id();
        let packet = match name {
            Some(path) => ClientPacket::SetStat {
                request_id,
                path: self.resolve(path),
                patch,
            },
            None => {
                let handle = match &self.file {
                    Some(file) => file.handle.clone(),
                    None => return Err(usage("setstat needs a file name or an open handle")),
                };
                ClientPacket::FSetStat {
                    request_id,
                    handle,
                    patch,
                }
            }
        };
        self.session.send_packet(&packet)?;
        self.session.expect_status(request_id)
    }

    /// Open a remote file for a sequential transfer. Write mode with
    /// offset zero creates and truncates; a non-zero offset appends.
    /// On NO_SUCH_FILE with `create_dir` the parent directory chain is
    /// created and the open retried once.
    pub fn open_file(
        &mut self,
        mode: OpenMode,
        path: &str,
        offset: u64,
        perm: Option<u32>,
        create_dir: bool,
        dir_mode: Option<u32>,
        blocksize: u32,
    ) -> Result<OpenedFile, SftpError> {
        self.file = None;
        self.reads = None;
        if self.simulation {
            self.file = Some(OpenFile {
                handle: b"simulated".to_vec(),
                mode,
            });
            self.file_offset = offset;
            self.writes = match mode {
                OpenMode::Write => WriteQueue::for_blocksize(blocksize),
                OpenMode::Read => WriteQueue::new(),
            };
            return Ok(OpenedFile {
                header_len: write_header_len(9),
                created: None,
            });
        }
        let resolved = self.resolve(path);
        let append = offset > 0;
        let mut created = None;
        let mut retried = false;
        let handle = loop {
            let request_id = self.session.next_request_id();
            let packet = ClientPacket::Open {
                request_id,
                path: resolved.clone(),
                mode,
                append,
                perm,
            };
            self.session.send_packet(&packet)?;
            match self.session.get_reply(request_id)? {
                ServerPacket::Handle { handle, .. } => break handle,
                ServerPacket::Status {
                    code: SSH_FX_NO_SUCH_FILE,
                    ..
                } if create_dir && !retried && resolved.contains('/') => {
                    retried = true;
                    let parent = match resolved.rsplit_once('/') {
                        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
                        _ => "/".to_string(),
                    };
                    debug!("creating missing parent {} for {}", parent, resolved);
                    created = self.create_missing_dirs(&parent, dir_mode)?;
                }
                ServerPacket::Status { code, message, .. } => {
                    return Err(SftpError::Status { code, message })
                }
                other => {
                    return Err(SftpError::Protocol(format!(
                        "unexpected {} reply to OPEN",
                        other.packet_name()
                    )))
                }
            }
        };
        self.file_offset = offset;
        self.writes = match mode {
            OpenMode::Write => WriteQueue::for_blocksize(blocksize),
            OpenMode::Read => WriteQueue::new(),
        };
        let header_len = write_header_len(handle.len());
        self.file = Some(OpenFile { handle, mode });
        Ok(OpenedFile {
            header_len,
            created,
        })
    }

    /// Pipelined write of one block at the current file offset. Under
    /// the window cap this returns without awaiting the reply.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SftpError> {
        if self.simulation {
            self.file_offset += data.len() as u64;
            return Ok(());
        }
        let handle = match &self.file {
            Some(file) if file.mode.is_write() => file.handle.clone(),
            Some(_) => return Err(usage("write on a file opened for reading")),
            None => return Err(usage("write without an open file")),
        };
        let request_id = self.session.send_write(&handle, self.file_offset, data)?;
        self.file_offset += data.len() as u64;
        if self.writes.has_room() {
            self.writes.push(request_id);
            return Ok(());
        }
        self.session.get_write_reply(request_id, &mut self.writes)
    }

    /// Collect every outstanding write acknowledgement.
    pub fn flush(&mut self) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        self.session.drain_writes(&mut self.writes)
    }

    /// Single-shot read at the current file offset. Returns the byte
    /// count, or `Eof` past the end of the file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        if self.simulation {
            return Err(SftpError::Eof);
        }
        let handle = match &self.file {
            Some(file) if !file.mode.is_write() => file.handle.clone(),
            Some(_) => return Err(usage("read on a file opened for writing")),
            None => return Err(usage("read without an open file")),
        };
        let request_id = self
            .session
            .send_read(&handle, self.file_offset, buf.len() as u32)?;
        match self.session.get_reply(request_id)? {
            ServerPacket::Data { data, .. } => {
                if data.len() > buf.len() {
                    return Err(SftpError::Protocol(format!(
                        "server sent {} bytes for a {} byte read",
                        data.len(),
                        buf.len()
                    )));
                }
                buf[..data.len()].copy_from_slice(&data);
                self.file_offset += data.len() as u64;
                Ok(data.len())
            }
            ServerPacket::Status {
                code: SSH_FX_EOF, ..
            } => Err(SftpError::Eof),
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to READ",
                other.packet_name()
            ))),
        }
    }

    /// Plan a pipelined sequential read; returns how many requests the
    /// caller may dispatch before the first catch.
    pub fn multi_read_init(&mut self, blocksize: u32, expected_size: u64) -> usize {
        let pipeline = ReadPipeline::new(blocksize, expected_size);
        let permits = pipeline.initial_permits();
        self.reads = Some(pipeline);
        permits
    }

    /// Fire READ requests until the window is full, advancing the
    /// logical offset optimistically. Returns how many were sent.
    pub fn multi_read_dispatch(&mut self) -> Result<usize, SftpError> {
        if self.simulation {
            return Ok(0);
        }
        let handle = match &self.file {
            Some(file) => file.handle.clone(),
            None => return Err(usage("multi_read_dispatch without an open file")),
        };
        let mut reads = match self.reads.take() {
            Some(reads) => reads,
            None => return Err(usage("multi_read_dispatch without multi_read_init")),
        };
        let quota = reads.dispatch_quota();
        let blocksize = reads.blocksize();
        let mut fired = 0;
        let mut outcome = Ok(());
        for _ in 0..quota {
            match self.session.send_read(&handle, self.file_offset, blocksize) {
                Ok(request_id) => {
                    reads.on_dispatch(request_id);
                    self.file_offset += blocksize as u64;
                    fired += 1;
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.reads = Some(reads);
        outcome.map(|_| fired)
    }

    /// Await the next in-order reply. A short DATA block before the
    /// last planned one signals server inconsistency: the pipeline is
    /// poisoned and `DoSingleReads` tells the caller to retry the
    /// range without pipelining. `Eof` reports the end of the file.
    pub fn multi_read_catch(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        if self.simulation {
            return Err(SftpError::Eof);
        }
        let mut reads = match self.reads.take() {
            Some(reads) => reads,
            None => return Err(usage("multi_read_catch without multi_read_init")),
        };
        let outcome = self.catch_one(&mut reads, buf);
        self.reads = Some(reads);
        outcome
    }

    fn catch_one(
        &mut self,
        reads: &mut ReadPipeline,
        buf: &mut [u8],
    ) -> Result<usize, SftpError> {
        let request_id = match reads.pop_pending() {
            Some(id) => id,
            None => return Err(usage("multi_read_catch with no outstanding reads")),
        };
        let blocksize = reads.blocksize();
        match self.session.get_reply(request_id)? {
            ServerPacket::Data { data, .. } => {
                if data.len() > buf.len() {
                    return Err(SftpError::Protocol(format!(
                        "server sent {} bytes for a {} byte block",
                        data.len(),
                        buf.len()
                    )));
                }
                if (data.len() as u32) < blocksize {
                    let final_block = reads.on_data();
                    if final_block {
                        // the tail block; pull the optimistic offset
                        // back to what actually arrived
                        self.file_offset -= (blocksize as usize - data.len()) as u64;
                    } else {
                        reads.on_abort();
                        self.file_offset -= blocksize as u64;
                        warn!(
                            "short read of {} bytes mid-file, falling back to single reads",
                            data.len()
                        );
                        return Err(SftpError::DoSingleReads);
                    }
                } else {
                    reads.on_data();
                }
                buf[..data.len()].copy_from_slice(&data);
                reads.maybe_grow();
                Ok(data.len())
            }
            ServerPacket::Status {
                code: SSH_FX_EOF, ..
            } => {
                reads.on_eof();
                self.file_offset -= blocksize as u64;
                Err(SftpError::Eof)
            }
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to a pipelined READ",
                other.packet_name()
            ))),
        }
    }

    /// Has the planned read sequence completed (or been aborted)?
    pub fn multi_read_eof(&self) -> bool {
        self.reads.as_ref().map_or(true, |reads| reads.finished())
    }

    /// Drain and discard every outstanding pipelined reply, rewinding
    /// the logical offset for each prefetch thrown away.
    pub fn multi_read_discard(&mut self, report: bool) -> Result<(), SftpError> {
        let mut reads = match self.reads.take() {
            Some(reads) => reads,
            None => return Ok(()),
        };
        if self.simulation {
            return Ok(());
        }
        let blocksize = reads.blocksize();
        let mut drained = 0u32;
        while let Some(request_id) = reads.pop_pending() {
            if self.session.pipe_broken() {
                break;
            }
            match self.session.get_reply(request_id) {
                Ok(_) => {
                    self.file_offset -= blocksize as u64;
                    drained += 1;
                }
                Err(err) => {
                    debug!("stopped draining prefetched reads: {}", err);
                    break;
                }
            }
        }
        if report && drained > 0 {
            info!("discarded {} prefetched read replies", drained);
        }
        Ok(())
    }

    /// OPENDIR; any previous directory handle and name list are
    /// dropped.
    pub fn open_dir(&mut self, path: &str) -> Result<(), SftpError> {
        self.names.clear();
        self.dir_eof = false;
        self.dir_packets = 0;
        if self.simulation {
            self.dir_handle = Some(b"simulated".to_vec());
            return Ok(());
        }
        let resolved = self.resolve(path);
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::OpenDir {
            request_id,
            path: resolved,
        };
        self.session.send_packet(&packet)?;
        match self.session.get_reply(request_id)? {
            ServerPacket::Handle { handle, .. } => {
                self.dir_handle = Some(handle);
                Ok(())
            }
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to OPENDIR",
                other.packet_name()
            ))),
        }
    }

    /// One directory entry per call, refilling from READDIR batches;
    /// `None` when the listing is exhausted.
    pub fn readdir(&mut self) -> Result<Option<FileInfo>, SftpError> {
        if self.simulation {
            return Ok(None);
        }
        if let Some(entry) = self.names.pop_front() {
            return Ok(Some(entry));
        }
        if self.dir_eof {
            return Ok(None);
        }
        let handle = match &self.dir_handle {
            Some(handle) => handle.clone(),
            None => return Err(usage("readdir without an open directory")),
        };
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::ReadDir { request_id, handle };
        self.session.send_packet(&packet)?;
        match self.session.get_reply(request_id)? {
            ServerPacket::Name { entries, .. } => {
                self.dir_packets += 1;
                if entries.is_empty() {
                    self.dir_eof = true;
                    return Ok(None);
                }
                self.names.extend(entries);
                Ok(self.names.pop_front())
            }
            ServerPacket::Status {
                code: SSH_FX_EOF, ..
            } => {
                self.dir_eof = true;
                Ok(None)
            }
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "unexpected {} reply to READDIR",
                other.packet_name()
            ))),
        }
    }

    /// Flush pending writes, then CLOSE. The handle is released even
    /// when either step fails.
    pub fn close_file(&mut self) -> Result<(), SftpError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        self.reads = None;
        if self.simulation {
            return Ok(());
        }
        let flush_result = self.session.drain_writes(&mut self.writes);
        let close_result = match self.session.ensure_usable() {
            Ok(()) => {
                let request_id = self.session.next_request_id();
                let packet = ClientPacket::Close {
                    request_id,
                    handle: file.handle,
                };
                match self.session.send_packet(&packet) {
                    Ok(()) => self.session.expect_status(request_id),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };
        flush_result.and(close_result)
    }

    /// CLOSE the directory handle and drop the buffered name list. On
    /// a dead transport the handle is released locally and the call
    /// reports success; the server side died with the connection.
    pub fn close_dir(&mut self) -> Result<(), SftpError> {
        self.names.clear();
        self.dir_eof = false;
        let handle = match self.dir_handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if self.simulation {
            return Ok(());
        }
        if self.session.pipe_broken() {
            return Ok(());
        }
        debug!("closing directory after {} READDIR round trips", self.dir_packets);
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::Close { request_id, handle };
        self.session.send_packet(&packet)?;
        self.session.expect_status(request_id)
    }

    /// MKDIR, surviving the race where another actor creates the same
    /// directory first; a supplied mode is also applied with a
    /// best-effort chmod afterwards.
    pub fn mkdir(&mut self, path: &str, mode: Option<u32>) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        let resolved = self.resolve(path);
        self.mkdir_resolved(&resolved, mode)
    }

    fn mkdir_resolved(&mut self, path: &str, mode: Option<u32>) -> Result<(), SftpError> {
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::MkDir {
            request_id,
            path: path.to_string(),
            perm: mode,
        };
        self.session.send_packet(&packet)?;
        match self.session.expect_status(request_id) {
            Ok(()) => {}
            Err(SftpError::Status {
                code: SSH_FX_FAILURE,
                message,
            }) => {
                // a concurrent session may have created it first
                match self.stat_resolved(path) {
                    Ok(attrs) if self.session.version() <= 3 || attrs.is_directory() => {
                        debug!("lost a mkdir race on {}, treating as success", path);
                    }
                    _ => {
                        return Err(SftpError::Status {
                            code: SSH_FX_FAILURE,
                            message,
                        })
                    }
                }
            }
            Err(err) => return Err(err),
        }
        if let Some(mode) = mode {
            if let Err(err) = self.chmod_resolved(path, mode) {
                warn!("could not chmod {} to {:o}: {}", path, mode, err);
            }
        }
        Ok(())
    }

    /// Split the target on `/` and create every missing prefix.
    /// Returns the created suffix, `/`-joined, for the caller's logs.
    fn create_missing_dirs(
        &mut self,
        path: &str,
        mode: Option<u32>,
    ) -> Result<Option<String>, SftpError> {
        let full = self.resolve(path);
        let absolute = full.starts_with('/');
        let components: Vec<String> = full
            .split('/')
            .filter(|component| !component.is_empty() && *component != ".")
            .map(str::to_string)
            .collect();
        let mut prefix = String::new();
        let mut created_from = None;
        for (index, component) in components.iter().enumerate() {
            if prefix.is_empty() {
                if absolute {
                    prefix = format!("/{}", component);
                } else {
                    prefix = component.clone();
                }
            } else {
                prefix = format!("{}/{}", prefix, component);
            }
            match self.stat_resolved(&prefix) {
                Ok(attrs) => {
                    if self.session.version() > 3 && !attrs.is_directory() {
                        return Err(SftpError::Protocol(format!(
                            "{} exists but is not a directory",
                            prefix
                        )));
                    }
                }
                Err(SftpError::Status {
                    code: SSH_FX_NO_SUCH_FILE,
                    ..
                }) => {
                    self.mkdir_resolved(&prefix, mode)?;
                    if created_from.is_none() {
                        created_from = Some(index);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(created_from.map(|index| components[index..].join("/")))
    }

    /// Rename, preferring `posix-rename@openssh.com`. Below protocol 5
    /// an existing target is removed and the rename retried once; a
    /// missing destination directory is created when `create_dir` is
    /// set. Each retry happens at most once.
    pub fn rename(
        &mut self,
        from: &str,
        to: &str,
        create_dir: bool,
        dir_mode: Option<u32>,
    ) -> Result<Option<String>, SftpError> {
        if self.simulation {
            return Ok(None);
        }
        let src = self.resolve(from);
        let dst = self.resolve(to);
        let mut created = None;
        let mut retried_overwrite = false;
        let mut retried_missing = false;
        loop {
            let request_id = self.session.next_request_id();
            let packet = if self.session.extensions().posix_rename {
                let mut data = Vec::new();
                encode_string(&mut data, &src);
                encode_string(&mut data, &dst);
                ClientPacket::Extended {
                    request_id,
                    name: EXT_POSIX_RENAME.to_string(),
                    data,
                }
            } else {
                ClientPacket::Rename {
                    request_id,
                    oldpath: src.clone(),
                    newpath: dst.clone(),
                }
            };
            self.session.send_packet(&packet)?;
            match self.session.expect_status(request_id) {
                Ok(()) => return Ok(created),
                Err(SftpError::Status {
                    code: SSH_FX_FAILURE,
                    ..
                }) if self.session.version() < 5 && !retried_overwrite => {
                    retried_overwrite = true;
                    debug!("rename target {} seems to exist, removing it", dst);
                    self.dele_resolved(&dst)?;
                }
                Err(SftpError::Status {
                    code: SSH_FX_NO_SUCH_FILE,
                    ..
                }) if create_dir && !retried_missing && dst.contains('/') => {
                    retried_missing = true;
                    let parent = match dst.rsplit_once('/') {
                        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
                        _ => "/".to_string(),
                    };
                    created = self.create_missing_dirs(&parent, dir_mode)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// REMOVE a file.
    pub fn dele(&mut self, path: &str) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        let resolved = self.resolve(path);
        self.dele_resolved(&resolved)
    }

    fn dele_resolved(&mut self, path: &str) -> Result<(), SftpError> {
        let request_id = self.session.next_request_id();
        let packet = ClientPacket::Remove {
            request_id,
            path: path.to_string(),
        };
        self.session.send_packet(&packet)?;
        self.session.expect_status(request_id)
    }

    /// Hard link via `hardlink@openssh.com`; requires the extension.
    /// A missing parent for the link is created when `create_dir` is
    /// set, once.
    pub fn hardlink(
        &mut self,
        from: &str,
        to: &str,
        create_dir: bool,
        dir_mode: Option<u32>,
    ) -> Result<Option<String>, SftpError> {
        if self.simulation {
            return Ok(None);
        }
        if !self.session.extensions().hardlink {
            return Err(SftpError::Status {
                code: SSH_FX_OP_UNSUPPORTED,
                message: "server does not advertise hardlink@openssh.com".to_string(),
            });
        }
        let src = self.resolve(from);
        let dst = self.resolve(to);
        let mut created = None;
        let mut retried = false;
        loop {
            let request_id = self.session.next_request_id();
            let mut data = Vec::new();
            encode_string(&mut data, &src);
            encode_string(&mut data, &dst);
            let packet = ClientPacket::Extended {
                request_id,
                name: EXT_HARDLINK.to_string(),
                data,
            };
            self.session.send_packet(&packet)?;
            match self.session.expect_status(request_id) {
                Ok(()) => return Ok(created),
                Err(SftpError::Status {
                    code: SSH_FX_NO_SUCH_FILE,
                    ..
                }) if create_dir && !retried && dst.contains('/') => {
                    retried = true;
                    let parent = match dst.rsplit_once('/') {
                        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
                        _ => "/".to_string(),
                    };
                    created = self.create_missing_dirs(&parent, dir_mode)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Symlink `link` pointing at `target`, with the same missing-
    /// parent retry as rename.
    pub fn symlink(
        &mut self,
        target: &str,
        link: &str,
        create_dir: bool,
        dir_mode: Option<u32>,
    ) -> Result<Option<String>, SftpError> {
        if self.simulation {
            return Ok(None);
        }
        let target_resolved = self.resolve(target);
        let link_resolved = self.resolve(link);
        let mut created = None;
        let mut retried = false;
        loop {
            let request_id = self.session.next_request_id();
            let packet = ClientPacket::Symlink {
                request_id,
                target: target_resolved.clone(),
                link: link_resolved.clone(),
            };
            self.session.send_packet(&packet)?;
            match self.session.expect_status(request_id) {
                Ok(()) => return Ok(created),
                Err(SftpError::Status {
                    code: SSH_FX_NO_SUCH_FILE,
                    ..
                }) if create_dir && !retried && link_resolved.contains('/') => {
                    retried = true;
                    let parent = match link_resolved.rsplit_once('/') {
                        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
                        _ => "/".to_string(),
                    };
                    created = self.create_missing_dirs(&parent, dir_mode)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Keepalive: the cheapest round trip the server understands. When
    /// ssh-level keepalive is configured this can simply never be
    /// called.
    pub fn noop(&mut self) -> Result<(), SftpError> {
        if self.simulation {
            return Ok(());
        }
        if self.session.extensions().limits {
            let request_id = self.session.next_request_id();
            let packet = ClientPacket::Extended {
                request_id,
                name: EXT_LIMITS.to_string(),
                data: Vec::new(),
            };
            self.session.send_packet(&packet)?;
            let _ = self.session.get_reply(request_id)?;
            return Ok(());
        }
        match self.stat_resolved(".") {
            Ok(_) => Ok(()),
            // any answer proves the server is alive
            Err(SftpError::Status { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Tear the session down: close the directory handle (unless the
    /// transport already died or timed out), drop all buffers, close
    /// the pipes and reap the child, escalating to SIGKILL after the
    /// grace period.
    pub fn quit(mut self) {
        let dead = self.session.pipe_broken() || self.session.timed_out();
        if !self.simulation && !dead {
            if self.dir_handle.is_some() {
                if let Err(err) = self.close_dir() {
                    debug!("could not close directory during quit: {}", err);
                }
            }
        }
        let grace = if dead {
            Duration::ZERO
        } else {
            Duration::from_millis(QUIT_GRACE_MS)
        };
        // dropping the session closes both pipe ends; a well-behaved
        // ssh child exits on the EOF
        drop(self.session);
        if let Some(mut child) = self.child.take() {
            child.reap(grace);
        }
        info!("sftp session closed");
    }
}

fn write_header_len(handle_len: usize) -> usize {
    // length + type + request id + handle string + offset + data length
    4 + 1 + 4 + 4 + handle_len + 8 + 4
}

fn devnull_transport(
    timeout: Duration,
    timeout_flag: Arc<AtomicBool>,
) -> Result<PipeTransport, SftpError> {
    let read = File::open("/dev/null")?;
    let write = OpenOptions::new().write(true).open("/dev/null")?;
    Ok(PipeTransport::new(
        read.into(),
        write.into(),
        timeout,
        timeout_flag,
    )?)
}
