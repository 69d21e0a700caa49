//! Scripted transport for unit tests: reply frames are queued up
//! front, written frames are captured for inspection. The handle is
//! cheaply cloneable so a test keeps access after the session takes
//! ownership.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::constants::*;
use super::error::SftpError;
use super::transport::Transport;

#[derive(Default)]
struct MockState {
    read_data: VecDeque<u8>,
    written: Vec<u8>,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read_data(&self, data: &[u8]) {
        self.state
            .borrow_mut()
            .read_data
            .extend(data.iter().copied());
    }

    pub fn push_u32(&self, value: u32) {
        self.push_read_data(&value.to_be_bytes());
    }

    /// Make every subsequent write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.state.borrow_mut().fail_writes = true;
    }

    pub fn pending_read_bytes(&self) -> usize {
        self.state.borrow().read_data.len()
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// Queue one complete frame: length prefix plus body.
    pub fn push_frame(&self, body: &[u8]) {
        self.push_u32(body.len() as u32);
        self.push_read_data(body);
    }

    pub fn push_version(&self, version: u32, extensions: &[(&str, &[u8])]) {
        let mut body = vec![SSH_FXP_VERSION];
        body.extend_from_slice(&version.to_be_bytes());
        for (name, data) in extensions {
            body.extend_from_slice(&(name.len() as u32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(&(data.len() as u32).to_be_bytes());
            body.extend_from_slice(data);
        }
        self.push_frame(&body);
    }

    pub fn push_status(&self, request_id: u32, code: u32, message: &str) {
        let mut body = vec![SSH_FXP_STATUS];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(&code.to_be_bytes());
        body.extend_from_slice(&(message.len() as u32).to_be_bytes());
        body.extend_from_slice(message.as_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // language tag
        self.push_frame(&body);
    }

    pub fn push_handle(&self, request_id: u32, handle: &[u8]) {
        let mut body = vec![SSH_FXP_HANDLE];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(&(handle.len() as u32).to_be_bytes());
        body.extend_from_slice(handle);
        self.push_frame(&body);
    }

    pub fn push_data(&self, request_id: u32, data: &[u8]) {
        let mut body = vec![SSH_FXP_DATA];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(&(data.len() as u32).to_be_bytes());
        body.extend_from_slice(data);
        self.push_frame(&body);
    }

    /// ATTRS reply with v3 size and permission fields.
    pub fn push_attrs_v3(&self, request_id: u32, size: u64, permissions: u32) {
        let mut body = vec![SSH_FXP_ATTRS];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(
            &(SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_PERMISSIONS).to_be_bytes(),
        );
        body.extend_from_slice(&size.to_be_bytes());
        body.extend_from_slice(&permissions.to_be_bytes());
        self.push_frame(&body);
    }

    /// NAME reply with v3 (name, longname) entries and empty attrs.
    pub fn push_name_v3(&self, request_id: u32, entries: &[(&str, &str)]) {
        let mut body = vec![SSH_FXP_NAME];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (name, longname) in entries {
            body.extend_from_slice(&(name.len() as u32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(&(longname.len() as u32).to_be_bytes());
            body.extend_from_slice(longname.as_bytes());
            body.extend_from_slice(&0u32.to_be_bytes()); // attr flags
        }
        self.push_frame(&body);
    }

    pub fn push_extended_reply(&self, request_id: u32, data: &[u8]) {
        let mut body = vec![SSH_FXP_EXTENDED_REPLY];
        body.extend_from_slice(&request_id.to_be_bytes());
        body.extend_from_slice(data);
        self.push_frame(&body);
    }

    pub fn push_limits_reply(
        &self,
        request_id: u32,
        max_packet: u64,
        max_read: u64,
        max_write: u64,
        max_handles: u64,
    ) {
        let mut data = Vec::new();
        data.extend_from_slice(&max_packet.to_be_bytes());
        data.extend_from_slice(&max_read.to_be_bytes());
        data.extend_from_slice(&max_write.to_be_bytes());
        data.extend_from_slice(&max_handles.to_be_bytes());
        self.push_extended_reply(request_id, &data);
    }

    /// Split the captured write stream into (type, whole frame) pairs.
    pub fn written_frames(&self) -> Vec<(u8, Vec<u8>)> {
        let written = self.written();
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos + 5 <= written.len() {
            let len = u32::from_be_bytes(written[pos..pos + 4].try_into().unwrap()) as usize;
            let end = pos + 4 + len;
            if end > written.len() {
                break;
            }
            frames.push((written[pos + 4], written[pos..end].to_vec()));
            pos = end;
        }
        frames
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SftpError> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(SftpError::BrokenPipe);
        }
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SftpError> {
        let mut state = self.state.borrow_mut();
        if state.read_data.len() < buf.len() {
            return Err(SftpError::PipeClosed);
        }
        for byte in buf.iter_mut() {
            *byte = state.read_data.pop_front().unwrap();
        }
        Ok(())
    }

    fn readable_now(&mut self) -> Result<bool, SftpError> {
        Ok(!self.state.borrow().read_data.is_empty())
    }
}
