//! Wire encoding of [`Message`] payloads.
//!
//! Transports do not discover payload types on their own. Instead a
//! [`PayloadRegistry`] is built up front, populated with one [`PayloadCodec`]
//! per [`PayloadKind`], and handed to the transport that needs it. Encoded
//! payloads start with the kind's tag byte so the receiver never has to guess
//! whether it is looking at a batch.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use hashbrown::HashMap;

use crate::{Error, Message, PayloadKind, RecordBatch, Result};
use batchflow_types::Record;

/// Encodes and decodes the body of one [`PayloadKind`].
pub trait PayloadCodec: Debug + Send + Sync {
    /// The payload kind handled by this codec.
    fn kind(&self) -> PayloadKind;

    /// Append the encoded body of `msg` to `buf`.
    fn encode(&self, msg: &Message, buf: &mut BytesMut) -> Result<()>;

    /// Decode a body previously produced by [`PayloadCodec::encode`].
    fn decode(&self, body: &[u8]) -> Result<Message>;
}

/// [`bitcode`] encoding of a single [`Record`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordCodec;

impl PayloadCodec for RecordCodec {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Record
    }

    fn encode(&self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Record(r) => {
                buf.put_slice(&bitcode::serialize(r)?);
                Ok(())
            }
            other => Err(Error::WrongPayloadKind {
                expected: self.kind(),
                actual: other.kind(),
            }),
        }
    }

    fn decode(&self, body: &[u8]) -> Result<Message> {
        Ok(Message::Record(bitcode::deserialize::<Record>(body)?))
    }
}

/// [`bitcode`] encoding of a columnar [`RecordBatch`].
///
/// Decoded batches are validated, so a body whose columns disagree in
/// length is rejected whole.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchCodec;

impl PayloadCodec for BatchCodec {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Batch
    }

    fn encode(&self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Batch(b) => {
                buf.put_slice(&bitcode::serialize(b.as_ref())?);
                Ok(())
            }
            other => Err(Error::WrongPayloadKind {
                expected: self.kind(),
                actual: other.kind(),
            }),
        }
    }

    fn decode(&self, body: &[u8]) -> Result<Message> {
        let batch = bitcode::deserialize::<RecordBatch>(body)?;
        batch.validate()?;
        Ok(Message::Batch(Arc::new(batch)))
    }
}

/// The set of codecs a transport may use, keyed by payload tag.
#[derive(Debug, Default)]
pub struct PayloadRegistry {
    codecs: HashMap<u8, Arc<dyn PayloadCodec>>,
}

impl PayloadRegistry {
    /// An empty registry. Every payload kind that will be sent must be
    /// registered before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding [`RecordCodec`] and [`BatchCodec`].
    pub fn with_default_codecs() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(RecordCodec))
            .expect("empty registry");
        registry
            .register(Arc::new(BatchCodec))
            .expect("record and batch tags differ");
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn PayloadCodec>) -> Result<()> {
        let kind = codec.kind();
        if self.codecs.contains_key(&kind.tag()) {
            return Err(Error::DuplicateCodec { kind });
        }
        self.codecs.insert(kind.tag(), codec);
        Ok(())
    }

    pub fn is_registered(&self, kind: PayloadKind) -> bool {
        self.codecs.contains_key(&kind.tag())
    }

    /// Encode `msg` as its tag byte followed by the codec's body.
    pub fn encode(&self, msg: &Message) -> Result<Bytes> {
        let tag = msg.kind().tag();
        let codec = self.codecs.get(&tag).ok_or(Error::UnknownPayloadTag { tag })?;

        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        codec.encode(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let (&tag, body) = bytes.split_first().ok_or(Error::EmptyPayload)?;
        let codec = self.codecs.get(&tag).ok_or(Error::UnknownPayloadTag { tag })?;
        codec.decode(body)
    }

    /// Read the payload kind of an encoded message without decoding it.
    pub fn peek_kind(bytes: &[u8]) -> Option<PayloadKind> {
        bytes.first().copied().and_then(PayloadKind::from_tag)
    }
}
