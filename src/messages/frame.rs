//! `Framer`: read and write Postgres v3 frames, tracking encoding and an
//! asynchronous cancel signal (spec §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::Error;
use crate::messages::constants::{MAX_MESSAGE_SIZE, MAX_STARTUP_SIZE};

/// What the client's first packet turned out to be.
pub enum StartupFrame {
    /// A regular startup message: protocol version already consumed, the
    /// remaining bytes are the key/value parameter list plus trailing NUL.
    Startup(BytesMut),
    /// `CancelRequest`: `(process_id, secret_key)`.
    Cancel { process_id: i32, secret_key: i32 },
    /// `SSLRequest`: the client would like to renegotiate over TLS.
    Ssl,
    /// `GSSENCRequest`: the client would like GSSAPI encryption.
    GssEncMode,
}

/// A fully-buffered inbound frame body, consumed through typed readers that
/// fail rather than read past the frame boundary (spec §4.1).
pub struct FrameReader {
    pub msg_type: u8,
    body: Bytes,
}

impl FrameReader {
    fn new(msg_type: u8, body: BytesMut) -> Self {
        FrameReader {
            msg_type,
            body: body.freeze(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.body.remaining()
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        if self.body.remaining() < 2 {
            return Err(Error::FrameSizeError("expected i16, frame truncated".into()));
        }
        Ok(self.body.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        if self.body.remaining() < 4 {
            return Err(Error::FrameSizeError("expected i32, frame truncated".into()));
        }
        Ok(self.body.get_i32())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        if self.body.remaining() < 1 {
            return Err(Error::FrameSizeError("expected byte, frame truncated".into()));
        }
        Ok(self.body.get_u8())
    }

    /// Read exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, Error> {
        if self.body.remaining() < len {
            return Err(Error::FrameSizeError(format!(
                "expected {len} bytes, only {} remained",
                self.body.remaining()
            )));
        }
        Ok(self.body.copy_to_bytes(len))
    }

    /// Read a NUL-terminated string in the given encoding.
    pub fn read_cstr(&mut self) -> Result<String, Error> {
        let bytes = self.body.as_ref();
        let end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::FrameSizeError("unterminated string in frame".into()))?;
        let s = String::from_utf8_lossy(&bytes[..end]).into_owned();
        self.body.advance(end + 1);
        Ok(s)
    }

    /// Read a length-prefixed bind/parameter value: `int32 len` followed by
    /// `len` bytes, or `-1` meaning SQL NULL.
    pub fn read_value(&mut self) -> Result<Option<Bytes>, Error> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.read_bytes(len as usize)?))
    }
}

/// Reads and writes Postgres v3 frames over an async duplex stream.
pub struct Framer<R, W> {
    read: BufReader<R>,
    write: W,
    /// Outbound staging buffer; `begin_message`/`write_*`/`send_message`
    /// append to it and back-patch the length before it is flushed.
    out: BytesMut,
    encoding: String,
    /// Checked before each `read_frame`. Set cross-thread by a different
    /// connection handling a `CancelRequest` (spec §5).
    cancel: Arc<AtomicBool>,
    msg_start: Option<usize>,
}

impl<R, W> Framer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(read: R, write: W) -> Self {
        Framer {
            read: BufReader::new(read),
            write,
            out: BytesMut::new(),
            encoding: "UTF8".to_string(),
            cancel: Arc::new(AtomicBool::new(false)),
            msg_start: None,
        }
    }

    /// A cloneable handle to this connection's cancel flag, to be handed to
    /// the server's registry so a different connection can set it.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn set_cancel(&self, value: bool) {
        self.cancel.store(value, Ordering::SeqCst);
    }

    pub fn set_encoding(&mut self, name: &str) {
        self.encoding = canonicalize_encoding(name);
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Read the client's very first packet: untyped, length-prefixed, whose
    /// leading `int32` is either a protocol version or one of the special
    /// negotiation codes (spec §4.3, §6).
    pub async fn read_startup(&mut self) -> Result<StartupFrame, Error> {
        let len = self.read.read_i32().await.map_err(|e| {
            Error::ClientBadStartup(format!("failed to read startup length: {e}"))
        })?;

        if !(8..=MAX_STARTUP_SIZE).contains(&len) {
            return Err(Error::ClientBadStartup(format!(
                "invalid startup length {len}"
            )));
        }

        let mut rest = vec![0u8; (len - 4) as usize];
        self.read
            .read_exact(&mut rest)
            .await
            .map_err(|e| Error::ClientBadStartup(format!("failed to read startup body: {e}")))?;

        let mut bytes = BytesMut::from(&rest[..]);
        let code = bytes.get_i32();

        use crate::messages::constants::*;
        match code {
            CANCEL_REQUEST_CODE => {
                if bytes.remaining() < 8 {
                    return Err(Error::ClientBadStartup(
                        "cancel request too short".to_string(),
                    ));
                }
                let process_id = bytes.get_i32();
                let secret_key = bytes.get_i32();
                Ok(StartupFrame::Cancel {
                    process_id,
                    secret_key,
                })
            }
            SSL_REQUEST_CODE => Ok(StartupFrame::Ssl),
            REQUEST_GSSENCMODE_CODE => Ok(StartupFrame::GssEncMode),
            PROTOCOL_VERSION_NUMBER => Ok(StartupFrame::Startup(bytes)),
            other => Err(Error::ClientBadStartup(format!(
                "unexpected startup code {other}"
            ))),
        }
    }

    /// Respond to an `SSLRequest`/`GSSENCRequest` with the single-byte
    /// refusal the protocol defines, then let the caller decide whether to
    /// keep reading plaintext startup or close.
    pub async fn refuse_negotiation(&mut self, byte: u8) -> Result<(), Error> {
        self.write
            .write_all(&[byte])
            .await
            .map_err(|e| Error::SocketError(format!("failed to write {byte} refusal: {e}")))?;
        self.write
            .flush()
            .await
            .map_err(|e| Error::SocketError(format!("failed to flush socket: {e}")))
    }

    /// Read one typed frame: `byte type | int32 length | payload`.
    /// Returns `Ok(None)` on a clean EOF (spec's `-1` type sentinel).
    pub async fn read_frame(&mut self) -> Result<Option<FrameReader>, Error> {
        if self.cancel.swap(false, Ordering::SeqCst) {
            return Err(Error::QueryCanceled);
        }

        let msg_type = match self.read.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::SocketError(format!("failed to read frame type: {e}"))),
        };

        let len = self
            .read
            .read_i32()
            .await
            .map_err(|e| Error::SocketError(format!("failed to read frame length: {e}")))?;

        if len < 4 || len > MAX_MESSAGE_SIZE {
            return Err(Error::FrameSizeError(format!(
                "frame length {len} out of bounds"
            )));
        }

        let body_len = (len - 4) as usize;
        let mut body = BytesMut::zeroed(body_len);
        self.read
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::SocketError(format!("failed to read frame body: {e}")))?;

        Ok(Some(FrameReader::new(msg_type, body)))
    }

    /// Begin building an outbound frame: writes the type byte and a
    /// placeholder length, to be back-patched by `send_message`/`flush`.
    pub fn begin_message(&mut self, msg_type: u8) -> &mut Self {
        self.msg_start = Some(self.out.len());
        self.out.put_u8(msg_type);
        self.out.put_i32(0);
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.out.put_i16(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.out.put_i32(v);
        self
    }

    pub fn write_cstr(&mut self, s: &str) -> &mut Self {
        self.out.put_slice(s.as_bytes());
        self.out.put_u8(0);
        self
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.out.put_slice(b);
        self
    }

    /// Close the current message by back-patching its length, without
    /// writing it to the socket yet — lets a handler build up a whole
    /// response set (e.g. `RowDescription` + several `DataRow`s +
    /// `CommandComplete`) before one flush.
    pub fn end_message(&mut self) {
        let start = self
            .msg_start
            .take()
            .expect("end_message called without begin_message");
        let len = (self.out.len() - start - 1) as i32;
        let len_bytes = len.to_be_bytes();
        self.out[start + 1..start + 5].copy_from_slice(&len_bytes);
    }

    /// Flush whatever has been staged via `begin_message`/`write_*`/
    /// `end_message` to the socket.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.out);
        self.write
            .write_all(&buf)
            .await
            .map_err(|e| Error::SocketError(format!("failed to write to socket: {e}")))?;
        self.write
            .flush()
            .await
            .map_err(|e| Error::SocketError(format!("failed to flush socket: {e}")))
    }

    /// Stage a complete, pre-built message (as produced by the `builder`
    /// helpers) for the next flush.
    pub fn stage(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.put_slice(bytes);
        self
    }
}

/// `client_encoding=UNICODE` is libpq's historical spelling of UTF-8;
/// canonicalize the handful of aliases clients actually send.
fn canonicalize_encoding(name: &str) -> String {
    match name.to_ascii_uppercase().as_str() {
        "UNICODE" | "UTF8" | "UTF-8" => "UTF8".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_startup_rejects_oversized_length() {
        let (client, server) = tokio::io::duplex(64);
        let mut framer = Framer::new(server, tokio::io::sink());
        drop(client);
        let result = framer.read_startup().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn round_trips_a_simple_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // type 'Q' + len(4+6) + "BEGIN\0"
            let mut buf = BytesMut::new();
            buf.put_u8(b'Q');
            buf.put_i32(4 + 6);
            buf.put_slice(b"BEGIN\0");
            client.write_all(&buf).await.unwrap();
        });
        let (r, w) = tokio::io::split(server);
        let mut framer = Framer::new(r, w);
        let mut frame = framer.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, b'Q');
        assert_eq!(frame.read_cstr().unwrap(), "BEGIN");
    }

    #[test]
    fn canonicalizes_unicode_alias() {
        assert_eq!(canonicalize_encoding("UNICODE"), "UTF8");
        assert_eq!(canonicalize_encoding("utf-8"), "UTF8");
        assert_eq!(canonicalize_encoding("LATIN1"), "LATIN1");
    }
}
