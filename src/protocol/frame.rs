//! Length-prefixed frame codec.
//!
//! Wire format:
//!
//! ```text
//! ┌────────────┬──────────┬──────────────────┬────────────┬─────────┬──────────┐
//! │ Length (4) │ Type (1) │ SerialNumber (8) │ UriLen (1) │ Uri (N) │ Data (M) │
//! └────────────┴──────────┴──────────────────┴────────────┴─────────┴──────────┘
//! ```
//!
//! `Length` counts every byte after itself. All integers are big-endian;
//! `UriLen` is unsigned, so URIs of 128–255 bytes decode correctly. The
//! decoder consumes input only once a complete frame is buffered — partial
//! input is retained untouched until more bytes arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Fixed part of the body: type + serial number + uri length.
pub const FIXED_BODY_LEN: usize = 1 + 8 + 1;

/// The URI length field is a single unsigned byte.
pub const MAX_URI_LEN: usize = 255;

/// Frame types carried between server and client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Client announces its key on a fresh control channel.
    /// Uri: `clientKey`
    Auth = 0x01,
    /// Flow setup. Server→client uri: `userId:host:port`;
    /// client→server ack uri: `userId@clientKey`
    Connect = 0x03,
    /// Flow teardown. Uri: `userId`
    Disconnect = 0x04,
    /// Opaque payload for one flow. Uri: `userId`
    Transfer = 0x05,
    /// Keepalive; the receiver echoes the serial number back.
    Heartbeat = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Auth),
            0x03 => Ok(FrameType::Connect),
            0x04 => Ok(FrameType::Disconnect),
            0x05 => Ok(FrameType::Transfer),
            0x07 => Ok(FrameType::Heartbeat),
            _ => Err(Error::invalid_frame(format!(
                "unknown frame type: 0x{value:02x}"
            ))),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Opaque correlator; echoed in heartbeat replies
    pub serial: u64,
    /// Command string; meaning depends on the type
    pub uri: String,
    /// Opaque payload; may be empty
    pub data: Bytes,
}

impl Frame {
    /// Create a heartbeat frame carrying `serial`.
    pub fn heartbeat(serial: u64) -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            serial,
            uri: String::new(),
            data: Bytes::new(),
        }
    }

    /// Create an AUTH frame for `client_key`.
    pub fn auth(client_key: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Auth,
            serial: 0,
            uri: client_key.into(),
            data: Bytes::new(),
        }
    }

    /// Create a CONNECT frame with the given uri.
    pub fn connect(uri: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Connect,
            serial: 0,
            uri: uri.into(),
            data: Bytes::new(),
        }
    }

    /// Create a DISCONNECT frame for one user flow.
    pub fn disconnect(user_id: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Disconnect,
            serial: 0,
            uri: user_id.into(),
            data: Bytes::new(),
        }
    }

    /// Create a TRANSFER frame carrying payload for one user flow.
    pub fn transfer(user_id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Transfer,
            serial: 0,
            uri: user_id.into(),
            data: data.into(),
        }
    }

    /// Encode the frame into `buf`. Fails if the URI exceeds 255 bytes.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let uri = self.uri.as_bytes();
        if uri.len() > MAX_URI_LEN {
            return Err(Error::UriTooLong(uri.len()));
        }

        let body_len = FIXED_BODY_LEN + uri.len() + self.data.len();
        buf.reserve(LENGTH_FIELD_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u8(self.frame_type as u8);
        buf.put_u64(self.serial);
        buf.put_u8(uri.len() as u8);
        buf.put_slice(uri);
        buf.put_slice(&self.data);
        Ok(())
    }
}

/// Incremental decoder with a per-channel frame size limit.
///
/// The server decodes with [`crate::MAX_CONTROL_FRAME`], the client with
/// [`crate::MAX_DATA_FRAME`]; a declared length above the limit is a fatal
/// error and the channel is torn down.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body: usize,
}

impl FrameCodec {
    /// Create a codec with the given body size limit.
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }

    /// Try to decode one frame from `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; in that case nothing is consumed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len < FIXED_BODY_LEN {
            return Err(Error::invalid_frame(format!(
                "declared body length {body_len} below fixed header size"
            )));
        }
        if body_len > self.max_body {
            return Err(Error::FrameTooLarge {
                len: body_len,
                max: self.max_body,
            });
        }
        if buf.len() < LENGTH_FIELD_LEN + body_len {
            return Ok(None);
        }

        buf.advance(LENGTH_FIELD_LEN);
        let mut body = buf.split_to(body_len);

        let frame_type = FrameType::try_from(body.get_u8())?;
        let serial = body.get_u64();
        let uri_len = body.get_u8() as usize;
        if body.len() < uri_len {
            return Err(Error::invalid_frame(format!(
                "uri length {uri_len} exceeds body ({} bytes left)",
                body.len()
            )));
        }
        let uri = String::from_utf8(body.split_to(uri_len).to_vec())
            .map_err(|e| Error::invalid_frame(format!("uri is not utf-8: {e}")))?;

        Ok(Some(Frame {
            frame_type,
            serial,
            uri,
            data: body.freeze(),
        }))
    }
}

/// Reads frames off an async byte stream, retaining partial input.
#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `io` with the given frame size limit.
    pub fn new(io: R, max_body: usize) -> Self {
        Self {
            io,
            codec: FrameCodec::new(max_body),
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read the next frame. `Ok(None)` signals a clean EOF on a frame
    /// boundary; EOF mid-frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::invalid_frame("connection closed mid-frame"));
            }
        }
    }
}

impl FrameReader<tokio::net::tcp::OwnedReadHalf> {
    /// Non-blocking sweep used on pooled idle channels: pull whatever the
    /// kernel has buffered, decode and discard it (heartbeat replies from
    /// the server, stray frames for flows already gone), and report whether
    /// the connection is still usable.
    pub fn drain_idle(&mut self) -> bool {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(_) => return false,
            }
            match self.io.try_read_buf(&mut self.buf) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Writes frames onto an async byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap `io`.
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Encode and write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        frame.encode_into(&mut self.buf)?;
        self.io.write_all(&self.buf).await?;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_CONTROL_FRAME;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();
        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_roundtrip_all_types() {
        let frames = [
            Frame::heartbeat(0xDEAD_BEEF_CAFE_F00D),
            Frame::auth("ZC-ABC"),
            Frame::connect("u1:127.0.0.1:80"),
            Frame::disconnect("u1"),
            Frame::transfer("u1", &b"GET / HTTP/1.0\r\n\r\n"[..]),
        ];
        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
    }

    #[test]
    fn test_empty_uri_and_data() {
        let frame = Frame::heartbeat(0);
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();
        // length(4) + type(1) + serial(8) + urilen(1)
        assert_eq!(buf.len(), 14);
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn test_concatenated_frames_decode_in_order() {
        let m1 = Frame::auth("ZC-ONE");
        let m2 = Frame::transfer("u1", &b"abc"[..]);
        let m3 = Frame::disconnect("u1");

        let mut buf = BytesMut::new();
        m1.encode_into(&mut buf).unwrap();
        m2.encode_into(&mut buf).unwrap();
        m3.encode_into(&mut buf).unwrap();

        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), m1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), m2);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), m3);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_short_buffer_consumes_nothing() {
        let frame = Frame::transfer("u1", &b"payload"[..]);
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf).unwrap();

        let mut short = buf.clone();
        short.truncate(buf.len() - 1);
        let before = short.len();

        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        assert!(codec.decode(&mut short).unwrap().is_none());
        assert_eq!(short.len(), before);

        // Completing the frame decodes it.
        short.put_u8(buf[buf.len() - 1]);
        assert_eq!(codec.decode(&mut short).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_uri_length_limit() {
        let ok = Frame::connect("d".repeat(MAX_URI_LEN));
        assert_eq!(roundtrip(&ok), ok);

        let long = Frame::connect("d".repeat(MAX_URI_LEN + 1));
        let mut buf = BytesMut::new();
        assert!(matches!(
            long.encode_into(&mut buf),
            Err(Error::UriTooLong(256))
        ));
    }

    #[test]
    fn test_long_uri_is_not_sign_extended() {
        // 200 > 127: a signed read of UriLen would go negative here.
        let frame = Frame::connect("x".repeat(200));
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn test_max_frame_boundary() {
        let codec = FrameCodec::new(MAX_CONTROL_FRAME);

        let at_limit = Frame::transfer(
            "",
            vec![0u8; MAX_CONTROL_FRAME - FIXED_BODY_LEN],
        );
        let mut buf = BytesMut::new();
        at_limit.encode_into(&mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), at_limit);

        let over = Frame::transfer(
            "",
            vec![0u8; MAX_CONTROL_FRAME - FIXED_BODY_LEN + 1],
        );
        let mut buf = BytesMut::new();
        over.encode_into(&mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_undersized_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(5); // below the 10-byte fixed body
        buf.put_slice(&[0u8; 5]);
        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(FIXED_BODY_LEN as u32);
        buf.put_u8(0x42);
        buf.put_u64(0);
        buf.put_u8(0);
        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_uri_len_exceeding_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(FIXED_BODY_LEN as u32);
        buf.put_u8(FrameType::Connect as u8);
        buf.put_u64(0);
        buf.put_u8(10); // claims 10 uri bytes, none present
        let codec = FrameCodec::new(MAX_CONTROL_FRAME);
        assert!(codec.decode(&mut buf).is_err());
    }
}
