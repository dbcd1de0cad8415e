use std::io;
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use shared::protocol::{
    FRAME_HELLO, FRAME_MESSAGE, FRAME_SUBSCRIBE, FRAME_UNSUBSCRIBE, MAX_FRAME_LEN,
    PUBSUB_PROTOCOL_VERSION,
};

/// One unit on the pub/sub wire. Each frame body sits behind a 4-byte
/// big-endian length prefix and starts with a kind byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame in each direction
    Hello { version: u8 },
    Subscribe(String),
    Unsubscribe(String),
    Message { topic: String, payload: Bytes },
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Frame {
    /// Body length of a MESSAGE frame carrying `topic` and `payload_len` bytes
    pub fn message_len(topic: &str, payload_len: usize) -> usize {
        3 + topic.len() + payload_len
    }

    /// Body length of a SUBSCRIBE or UNSUBSCRIBE frame for `topic`
    pub fn control_len(topic: &str) -> usize {
        1 + topic.len()
    }

    fn encode_body(&self) -> io::Result<Bytes> {
        let mut body = BytesMut::new();
        match self {
            Frame::Hello { version } => {
                body.put_u8(FRAME_HELLO);
                body.put_u8(*version);
            }
            Frame::Subscribe(topic) => {
                body.put_u8(FRAME_SUBSCRIBE);
                body.put_slice(topic.as_bytes());
            }
            Frame::Unsubscribe(topic) => {
                body.put_u8(FRAME_UNSUBSCRIBE);
                body.put_slice(topic.as_bytes());
            }
            Frame::Message { topic, payload } => {
                let topic_len = u16::try_from(topic.len())
                    .map_err(|_| invalid(format!("topic of {} bytes is too long", topic.len())))?;
                body.reserve(3 + topic.len() + payload.len());
                body.put_u8(FRAME_MESSAGE);
                body.put_u16(topic_len);
                body.put_slice(topic.as_bytes());
                body.put_slice(payload);
            }
        }
        Ok(body.freeze())
    }

    fn decode_body(mut body: Bytes) -> io::Result<Frame> {
        if body.is_empty() {
            return Err(invalid("empty frame"));
        }

        match body.get_u8() {
            FRAME_HELLO => {
                if body.len() != 1 {
                    return Err(invalid("malformed HELLO frame"));
                }
                Ok(Frame::Hello { version: body.get_u8() })
            }
            FRAME_SUBSCRIBE => Ok(Frame::Subscribe(utf8(body)?)),
            FRAME_UNSUBSCRIBE => Ok(Frame::Unsubscribe(utf8(body)?)),
            FRAME_MESSAGE => {
                if body.len() < 2 {
                    return Err(invalid("truncated MESSAGE frame"));
                }
                let topic_len = usize::from(body.get_u16());
                if body.len() < topic_len {
                    return Err(invalid("MESSAGE topic runs past the frame"));
                }
                let topic = utf8(body.split_to(topic_len))?;
                Ok(Frame::Message { topic, payload: body })
            }
            kind => Err(invalid(format!("unknown frame kind {:#04x}", kind))),
        }
    }
}

fn utf8(bytes: Bytes) -> io::Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid("topic is not valid UTF-8"))
}

/// [`Frame`] codec layered over a length-delimited codec
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        match self.inner.decode(src)? {
            Some(body) => Frame::decode_body(body.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let body = frame.encode_body()?;
        self.inner.encode(body, dst)
    }
}

/// Both sides send HELLO first, then expect the peer's HELLO with the same
/// protocol version within `timeout`.
pub async fn handshake<T>(framed: &mut Framed<T, FrameCodec>, timeout: Duration) -> Result<(), String>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Frame::Hello { version: PUBSUB_PROTOCOL_VERSION })
        .await
        .map_err(|e| format!("failed to send HELLO: {}", e))?;

    match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(Ok(Frame::Hello { version }))) if version == PUBSUB_PROTOCOL_VERSION => Ok(()),
        Ok(Some(Ok(Frame::Hello { version }))) => {
            Err(format!("peer speaks protocol version {}, expected {}", version, PUBSUB_PROTOCOL_VERSION))
        }
        Ok(Some(Ok(other))) => Err(format!("expected HELLO, got {:?}", other)),
        Ok(Some(Err(e))) => Err(format!("handshake failed: {}", e)),
        Ok(None) => Err("connection closed during handshake".to_string()),
        Err(_) => Err(format!("no HELLO within {:?}", timeout)),
    }
}
