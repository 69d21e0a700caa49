//! Session state: framing, request-id correlation, the deferred reply
//! ring, and the INIT/VERSION negotiation with its extension and
//! limits handling. The command layer in `client.rs` sits on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use super::codec::{BufferReader, PacketBuf};
use super::constants::*;
use super::error::SftpError;
use super::packet::{ClientPacket, ServerPacket, SftpPacketInfo};
use super::pipeline::WriteQueue;
use super::transport::Transport;
use super::types::{Extensions, Limits, Supported2};

/// A fully received frame whose request id nobody was waiting for yet.
struct DeferredReply {
    request_id: u32,
    payload: Vec<u8>,
}

/// Bounded store of deferred replies. Capacity is the smaller of the
/// compile-time ceiling and the server's advertised max-open-handles.
struct ReplyRing {
    slots: Vec<DeferredReply>,
    cap: usize,
}

impl ReplyRing {
    fn new(cap: usize) -> Self {
        ReplyRing {
            slots: Vec::new(),
            cap,
        }
    }

    fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn take(&mut self, request_id: u32) -> Option<Vec<u8>> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.request_id == request_id)?;
        Some(self.slots.remove(index).payload)
    }

    fn push(&mut self, request_id: u32, payload: Vec<u8>) -> Result<(), SftpError> {
        if self.slots.len() >= self.cap {
            warn!(
                "deferred reply buffer is full ({} frames), dropping request {}",
                self.slots.len(),
                request_id
            );
            return Err(SftpError::ReplyBufferFull(self.slots.len()));
        }
        self.slots.push(DeferredReply {
            request_id,
            payload,
        });
        Ok(())
    }
}

fn frame_request_id(payload: &[u8]) -> Result<u32, SftpError> {
    if payload.len() < 5 {
        return Err(SftpError::Protocol(format!(
            "runt frame of {} bytes",
            payload.len()
        )));
    }
    if payload[0] == SSH_FXP_VERSION {
        return Err(SftpError::Protocol(
            "unexpected SSH_FXP_VERSION outside negotiation".to_string(),
        ));
    }
    Ok(u32::from_be_bytes([
        payload[1], payload[2], payload[3], payload[4],
    ]))
}

pub struct SftpSession {
    transport: Box<dyn Transport>,
    version: u32,
    extensions: Extensions,
    limits: Limits,
    max_msg_length: usize,
    request_id: u32,
    msg_buf: Vec<u8>,
    ring: ReplyRing,
    pipe_broken: bool,
    timeout_flag: Arc<AtomicBool>,
}

impl SftpSession {
    fn with_transport(transport: Box<dyn Transport>, timeout_flag: Arc<AtomicBool>) -> Self {
        SftpSession {
            transport,
            version: SFTP_MAX_VERSION,
            extensions: Extensions::default(),
            limits: Limits::default(),
            max_msg_length: DEFAULT_MAX_MSG_LENGTH,
            request_id: 0,
            msg_buf: vec![0; MSG_LENGTH_FLOOR],
            ring: ReplyRing::new(MAX_REPLY_BUFFER),
            pipe_broken: false,
            timeout_flag,
        }
    }

    /// Send INIT, adopt `min(server, ours)`, parse the extension list
    /// and, when advertised, probe `limits@openssh.com`.
    pub fn handshake(
        transport: Box<dyn Transport>,
        timeout_flag: Arc<AtomicBool>,
    ) -> Result<Self, SftpError> {
        let mut session = Self::with_transport(transport, timeout_flag);
        let init = ClientPacket::Init {
            version: SFTP_MAX_VERSION,
        };
        session.write_frame(&init.to_bytes(SFTP_MAX_VERSION))?;
        let length = session.read_frame()?;
        match ServerPacket::decode(&session.msg_buf[..length], SFTP_MAX_VERSION)? {
            ServerPacket::Version {
                version,
                extensions,
            } => {
                if version < 3 {
                    warn!("server offered sftp version {}, below draft 3", version);
                }
                session.version = version.min(SFTP_MAX_VERSION);
                session.apply_extensions(extensions);
                info!(
                    "negotiated sftp version {} ({} unknown extensions skipped)",
                    session.version, session.extensions.unknown
                );
                if session.extensions.limits {
                    session.query_limits()?;
                }
                Ok(session)
            }
            other => Err(SftpError::Protocol(format!(
                "expected SSH_FXP_VERSION, got {}",
                other.packet_name()
            ))),
        }
    }

    /// An offline session with plausible capabilities; nothing is ever
    /// exchanged on the wire.
    pub fn simulated(transport: Box<dyn Transport>, timeout_flag: Arc<AtomicBool>) -> Self {
        let mut session = Self::with_transport(transport, timeout_flag);
        session.version = 3;
        session.extensions.posix_rename = true;
        session.extensions.hardlink = true;
        session
    }

    fn apply_extensions(&mut self, pairs: Vec<(String, Vec<u8>)>) {
        for (name, data) in pairs {
            match name.as_str() {
                EXT_POSIX_RENAME => self.extensions.posix_rename = true,
                EXT_STATVFS => self.extensions.statvfs = true,
                EXT_FSTATVFS => self.extensions.fstatvfs = true,
                EXT_HARDLINK => self.extensions.hardlink = true,
                EXT_FSYNC => self.extensions.fsync = true,
                EXT_LSETSTAT => self.extensions.lsetstat = true,
                EXT_LIMITS => self.extensions.limits = true,
                EXT_EXPAND_PATH => self.extensions.expand_path = true,
                EXT_COPY_DATA => self.extensions.copy_data = true,
                EXT_SUPPORTED2 => {
                    self.extensions.supported2 = Some(decode_supported2(&data));
                }
                other => {
                    debug!("skipping unknown extension {}", other);
                    self.extensions.unknown += 1;
                }
            }
        }
    }

    fn query_limits(&mut self) -> Result<(), SftpError> {
        let request_id = self.next_request_id();
        let probe = ClientPacket::Extended {
            request_id,
            name: EXT_LIMITS.to_string(),
            data: Vec::new(),
        };
        self.send_packet(&probe)?;
        match self.get_reply(request_id)? {
            ServerPacket::ExtendedReply { data, .. } => {
                let mut reader = BufferReader::new(&data);
                let max_packet_length = reader.read_u64()?;
                let max_read_length = reader.read_u64()?;
                let max_write_length = reader.read_u64()?;
                let max_open_handles = reader.read_u64()?;
                self.limits = Limits {
                    max_packet_length,
                    max_read_length,
                    max_write_length,
                    max_open_handles,
                };
                let clamped = (max_packet_length as usize)
                    .clamp(MSG_LENGTH_FLOOR, HARD_MAX_MSG_LENGTH);
                self.max_msg_length = clamped;
                if self.msg_buf.len() < clamped {
                    self.msg_buf.resize(clamped, 0);
                }
                if max_open_handles > 0 && (max_open_handles as usize) < MAX_REPLY_BUFFER {
                    self.ring.set_cap(max_open_handles as usize);
                }
                info!(
                    "server limits: packet {} read {} write {} handles {}",
                    max_packet_length, max_read_length, max_write_length, max_open_handles
                );
            }
            ServerPacket::Status { code, message, .. } => {
                warn!(
                    "limits probe refused with {}: {}, keeping defaults",
                    code, message
                );
            }
            other => {
                return Err(SftpError::Protocol(format!(
                    "unexpected {} reply to the limits probe",
                    other.packet_name()
                )))
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    pub fn pipe_broken(&self) -> bool {
        self.pipe_broken
    }

    pub fn timed_out(&self) -> bool {
        self.timeout_flag.load(Ordering::SeqCst)
    }

    pub fn next_request_id(&mut self) -> u32 {
        let id = self.request_id;
        self.request_id = self.request_id.wrapping_add(1);
        id
    }

    /// Clamp the caller's preferred blocksize against the negotiated
    /// limits, growing the working buffer when needed. The caller
    /// compares the return value against its request to notice a
    /// change.
    pub fn set_blocksize(&mut self, desired: u32) -> u32 {
        let mut effective = desired.max(1) as u64;
        let max_packet = self.max_msg_length.saturating_sub(FRAME_OVERHEAD) as u64;
        effective = effective.min(max_packet);
        if self.limits.max_write_length > 0 {
            effective = effective.min(self.limits.max_write_length);
        }
        if self.limits.max_read_length > 0 {
            effective = effective.min(self.limits.max_read_length);
        }
        let effective = effective.max(1) as u32;
        let needed = effective as usize + FRAME_OVERHEAD;
        if self.msg_buf.len() < needed {
            self.msg_buf.resize(needed, 0);
        }
        if effective != desired {
            debug!("blocksize adjusted from {} to {}", desired, effective);
        }
        effective
    }

    /// Fail fast once the transport has died.
    pub fn ensure_usable(&self) -> Result<(), SftpError> {
        if self.pipe_broken {
            return Err(SftpError::Protocol(
                "session unusable after transport failure".to_string(),
            ));
        }
        Ok(())
    }

    fn latch_err(&mut self, err: SftpError) -> SftpError {
        if err.is_transport_fatal() {
            self.pipe_broken = true;
        }
        err
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), SftpError> {
        match self.transport.write_all(frame) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch_err(err)),
        }
    }

    /// Read one frame into the working buffer, growing it on demand up
    /// to the negotiated ceiling. Returns the payload length.
    fn read_frame(&mut self) -> Result<usize, SftpError> {
        let mut len_buf = [0u8; 4];
        match self.transport.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) => return Err(self.latch_err(err)),
        }
        let length = u32::from_be_bytes(len_buf) as usize;
        if length < 5 {
            return Err(SftpError::Protocol(format!(
                "runt frame of {} bytes",
                length
            )));
        }
        if length > self.max_msg_length {
            return Err(SftpError::Protocol(format!(
                "frame length {} exceeds the {} byte ceiling",
                length, self.max_msg_length
            )));
        }
        if self.msg_buf.len() < length {
            self.msg_buf.resize(length, 0);
        }
        match self.transport.read_exact(&mut self.msg_buf[..length]) {
            Ok(()) => Ok(length),
            Err(err) => Err(self.latch_err(err)),
        }
    }

    pub fn send_packet(&mut self, packet: &ClientPacket) -> Result<(), SftpError> {
        self.ensure_usable()?;
        debug!("-> {}", packet.packet_name());
        let frame = packet.to_bytes(self.version);
        self.write_frame(&frame)
    }

    /// Hot-path WRITE encoder: the data block is copied exactly once,
    /// into the outbound frame.
    pub fn send_write(
        &mut self,
        handle: &[u8],
        offset: u64,
        data: &[u8],
    ) -> Result<u32, SftpError> {
        self.ensure_usable()?;
        let request_id = self.next_request_id();
        let mut buf = PacketBuf::request(SSH_FXP_WRITE, request_id);
        buf.add_bytes(handle);
        buf.add_u64(offset);
        buf.add_bytes(data);
        let frame = buf.finish();
        self.write_frame(&frame)?;
        Ok(request_id)
    }

    pub fn send_read(
        &mut self,
        handle: &[u8],
        offset: u64,
        length: u32,
    ) -> Result<u32, SftpError> {
        self.ensure_usable()?;
        let request_id = self.next_request_id();
        let mut buf = PacketBuf::request(SSH_FXP_READ, request_id);
        buf.add_bytes(handle);
        buf.add_u64(offset);
        buf.add_u32(length);
        let frame = buf.finish();
        self.write_frame(&frame)?;
        Ok(request_id)
    }

    /// Deliver the reply for `request_id`, buffering any other frame
    /// that arrives first.
    pub fn get_reply(&mut self, request_id: u32) -> Result<ServerPacket, SftpError> {
        self.ensure_usable()?;
        if let Some(payload) = self.ring.take(request_id) {
            debug!("request {} answered from the deferred reply buffer", request_id);
            return ServerPacket::decode(&payload, self.version);
        }
        loop {
            let length = self.read_frame()?;
            let got = frame_request_id(&self.msg_buf[..length])?;
            if got == request_id {
                return ServerPacket::decode(&self.msg_buf[..length], self.version);
            }
            debug!("buffering out-of-order reply for request {}", got);
            let payload = self.msg_buf[..length].to_vec();
            self.ring.push(got, payload)?;
        }
    }

    /// Await a STATUS reply and turn anything but SSH_FX_OK into an
    /// error carrying the server's code.
    pub fn expect_status(&mut self, request_id: u32) -> Result<(), SftpError> {
        match self.get_reply(request_id)? {
            ServerPacket::Status {
                code: SSH_FX_OK, ..
            } => Ok(()),
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "expected SSH_FXP_STATUS, got {}",
                other.packet_name()
            ))),
        }
    }

    fn check_write_ack(payload: &[u8], version: u32) -> Result<(), SftpError> {
        match ServerPacket::decode(payload, version)? {
            ServerPacket::Status {
                code: SSH_FX_OK, ..
            } => Ok(()),
            ServerPacket::Status { code, message, .. } => {
                Err(SftpError::Status { code, message })
            }
            other => Err(SftpError::Protocol(format!(
                "expected a write STATUS, got {}",
                other.packet_name()
            ))),
        }
    }

    fn probe_readable(&mut self) -> Result<bool, SftpError> {
        match self.transport.readable_now() {
            Ok(readable) => Ok(readable),
            Err(err) => Err(self.latch_err(err)),
        }
    }

    /// Drain write acknowledgements so the send window stays
    /// non-empty. Blocks while the queue is at its cap and `current`
    /// is unaccounted; beyond that it keeps consuming only as long as
    /// a frame is already readable. Afterwards `current` is either
    /// acknowledged or queued.
    pub fn get_write_reply(
        &mut self,
        current: u32,
        queue: &mut WriteQueue,
    ) -> Result<(), SftpError> {
        self.ensure_usable()?;
        let mut current_seen = false;

        // acks may have been parked in the ring by earlier reads
        let mut claimed = true;
        while claimed {
            claimed = false;
            for id in queue.ids().to_vec() {
                if let Some(payload) = self.ring.take(id) {
                    queue.remove(id);
                    Self::check_write_ack(&payload, self.version)?;
                    claimed = true;
                }
            }
            if !current_seen {
                if let Some(payload) = self.ring.take(current) {
                    Self::check_write_ack(&payload, self.version)?;
                    current_seen = true;
                    claimed = true;
                }
            }
        }

        loop {
            if !(queue.is_full() && !current_seen) && !self.probe_readable()? {
                break;
            }
            let length = self.read_frame()?;
            let got = frame_request_id(&self.msg_buf[..length])?;
            if got == current && !current_seen {
                let payload = self.msg_buf[..length].to_vec();
                Self::check_write_ack(&payload, self.version)?;
                current_seen = true;
            } else if queue.remove(got) {
                let payload = self.msg_buf[..length].to_vec();
                Self::check_write_ack(&payload, self.version)?;
            } else {
                let payload = self.msg_buf[..length].to_vec();
                self.ring.push(got, payload)?;
            }
        }

        if !current_seen {
            queue.push(current);
        }
        Ok(())
    }

    /// Collect every outstanding write acknowledgement, ring first.
    pub fn drain_writes(&mut self, queue: &mut WriteQueue) -> Result<(), SftpError> {
        if queue.is_empty() {
            return Ok(());
        }
        self.ensure_usable()?;
        for id in queue.ids().to_vec() {
            if let Some(payload) = self.ring.take(id) {
                queue.remove(id);
                Self::check_write_ack(&payload, self.version)?;
            }
        }
        while !queue.is_empty() {
            let length = self.read_frame()?;
            let got = frame_request_id(&self.msg_buf[..length])?;
            if queue.remove(got) {
                let payload = self.msg_buf[..length].to_vec();
                Self::check_write_ack(&payload, self.version)?;
            } else {
                let payload = self.msg_buf[..length].to_vec();
                self.ring.push(got, payload)?;
            }
        }
        Ok(())
    }
}

/// Field-by-field defensive decode: v6 deployments are uncommon and
/// the draft was never ratified, so a short or odd block degrades to
/// whatever prefix parsed.
fn decode_supported2(data: &[u8]) -> Supported2 {
    let mut supported = Supported2::default();
    let mut reader = BufferReader::new(data);
    macro_rules! field {
        ($field:ident, $read:ident) => {
            match reader.$read() {
                Ok(value) => supported.$field = value,
                Err(_) => return supported,
            }
        };
    }
    field!(attribute_mask, read_u32);
    field!(attribute_bits, read_u32);
    field!(open_flags, read_u32);
    field!(access_mask, read_u32);
    field!(max_read_size, read_u32);
    field!(open_block_vector, read_u16);
    field!(block_vector, read_u16);
    let count = match reader.read_u32() {
        Ok(count) => count,
        Err(_) => return supported,
    };
    for _ in 0..count {
        match reader.read_utf8() {
            Ok(name) => supported.attrib_extension_names.push(name),
            Err(_) => return supported,
        }
    }
    let count = match reader.read_u32() {
        Ok(count) => count,
        Err(_) => return supported,
    };
    for _ in 0..count {
        match reader.read_utf8() {
            Ok(name) => supported.extension_names.push(name),
            Err(_) => return supported,
        }
    }
    supported
}
