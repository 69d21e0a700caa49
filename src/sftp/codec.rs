//! Big-endian wire codec. Every integer on the wire is unsigned
//! big-endian; strings are `u32 length || bytes` with no terminator.

use super::error::SftpError;

/// Bounds-checked reader over a received frame.
pub struct BufferReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, bytes: usize, what: &str) -> Result<(), SftpError> {
        if self.remaining() < bytes {
            return Err(SftpError::Protocol(format!(
                "truncated message: need {} bytes for {}, {} left",
                bytes,
                what,
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, SftpError> {
        self.need(1, "u8")?;
        let byte = self.data[self.position];
        self.position += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, SftpError> {
        self.need(2, "u16")?;
        let bytes: [u8; 2] = self.data[self.position..self.position + 2]
            .try_into()
            .map_err(|_| SftpError::Protocol("u16 out of bounds".to_string()))?;
        self.position += 2;
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32, SftpError> {
        self.need(4, "u32")?;
        let bytes: [u8; 4] = self.data[self.position..self.position + 4]
            .try_into()
            .map_err(|_| SftpError::Protocol("u32 out of bounds".to_string()))?;
        self.position += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64, SftpError> {
        self.need(8, "u64")?;
        let bytes: [u8; 8] = self.data[self.position..self.position + 8]
            .try_into()
            .map_err(|_| SftpError::Protocol("u64 out of bounds".to_string()))?;
        self.position += 8;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Length-prefixed byte string.
    pub fn read_string(&mut self) -> Result<Vec<u8>, SftpError> {
        let len = self.read_u32()? as usize;
        self.need(len, "string body")?;
        let result = self.data[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(result)
    }

    /// Length-prefixed string decoded as UTF-8, lossily.
    pub fn read_utf8(&mut self) -> Result<String, SftpError> {
        Ok(String::from_utf8_lossy(&self.read_string()?).into_owned())
    }

    pub fn skip(&mut self, bytes: usize) -> Result<(), SftpError> {
        self.need(bytes, "skipped field")?;
        self.position += bytes;
        Ok(())
    }

    /// Skip one length-prefixed string.
    pub fn skip_string(&mut self) -> Result<(), SftpError> {
        let len = self.read_u32()? as usize;
        self.skip(len)
    }
}

/// Builder for an outbound frame. The u32 total-length prefix is
/// reserved up front and back-patched by `finish`.
pub struct PacketBuf {
    buf: Vec<u8>,
}

impl PacketBuf {
    /// A request frame: `length || type || request_id || ...`.
    pub fn request(packet_type: u8, request_id: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(packet_type);
        buf.extend_from_slice(&request_id.to_be_bytes());
        Self { buf }
    }

    /// The INIT frame, which carries a version where every other
    /// frame carries a request id.
    pub fn init(packet_type: u8, version: u32) -> Self {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(packet_type);
        buf.extend_from_slice(&version.to_be_bytes());
        Self { buf }
    }

    pub fn add_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn add_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn add_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn add_string(&mut self, string: &str) {
        self.add_bytes(string.as_bytes());
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    /// Append pre-encoded payload without a length prefix.
    pub fn add_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let length = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&length.to_be_bytes());
        self.buf
    }
}

/// Encode one length-prefixed string into a plain byte vector; used
/// for EXTENDED request payloads that are built outside a frame.
pub fn encode_string(out: &mut Vec<u8>, string: &str) {
    out.extend_from_slice(&(string.len() as u32).to_be_bytes());
    out.extend_from_slice(string.as_bytes());
}
