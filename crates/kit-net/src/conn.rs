//! Authenticated message connections.

use crate::framing::{FrameError, MessageCodec};
use crate::handshake::{self, HandshakeError, Session, SyncFlags, SyncParams};
use futures::{SinkExt, StreamExt};
use kit_core::{KeyPair, Message, MsgId, NetworkId, UserId};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Receiving half of a connection.
pub struct MessageReader<R> {
    inner: FramedRead<R, MessageCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, MessageCodec::new()),
        }
    }

    /// Next verified message, or `None` once the peer half-closed.
    ///
    /// A message that fails verification yields [`FrameError::Invalid`];
    /// the stream stays usable after it. Any other error ends the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>, FrameError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(msg)) => {
                msg.verify()?;
                Ok(Some(msg))
            }
        }
    }
}

/// Sending half of a connection.
pub struct MessageWriter<W> {
    inner: FramedWrite<W, MessageCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            inner: FramedWrite::new(io, MessageCodec::new()),
        }
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), FrameError> {
        self.inner.send(msg).await
    }

    /// Write a batch with a single flush.
    pub async fn send_many<I>(&mut self, msgs: I) -> Result<(), FrameError>
    where
        I: IntoIterator<Item = Message>,
    {
        for msg in msgs {
            self.inner.feed(msg).await?;
        }
        self.inner.flush().await
    }

    /// Flush and half-close, signalling end of stream to the peer.
    pub async fn close_write(&mut self) -> Result<(), FrameError> {
        self.inner.close().await
    }
}

/// A handshaked connection.
pub struct Connection<S> {
    session: Session,
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Dial side: authenticate against the pinned `responder`.
    pub async fn connect(
        mut stream: S,
        key: &KeyPair,
        network: NetworkId,
        responder: UserId,
        sync: SyncParams,
    ) -> Result<Self, HandshakeError> {
        let session = handshake::initiate(&mut stream, key, network, responder, sync).await?;
        Ok(Self::established(stream, session))
    }

    /// Listen side: authenticate the initiator and advertise `flags`.
    pub async fn accept<F, Fut>(
        mut stream: S,
        key: &KeyPair,
        network: NetworkId,
        flags: SyncFlags,
        cursor_for: F,
    ) -> Result<Self, HandshakeError>
    where
        F: FnOnce(UserId) -> Fut,
        Fut: Future<Output = Option<MsgId>>,
    {
        let session = handshake::accept(&mut stream, key, network, flags, cursor_for).await?;
        Ok(Self::established(stream, session))
    }

    fn established(stream: S, session: Session) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            session,
            reader: MessageReader::new(r),
            writer: MessageWriter::new(w),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn remote(&self) -> UserId {
        self.session.remote
    }

    pub async fn recv(&mut self) -> Result<Option<Message>, FrameError> {
        self.reader.recv().await
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), FrameError> {
        self.writer.send(msg).await
    }

    pub async fn send_many<I>(&mut self, msgs: I) -> Result<(), FrameError>
    where
        I: IntoIterator<Item = Message>,
    {
        self.writer.send_many(msgs).await
    }

    pub async fn close_write(&mut self) -> Result<(), FrameError> {
        self.writer.close_write().await
    }

    /// Separate the halves so they can be driven concurrently.
    pub fn into_split(
        self,
    ) -> (
        Session,
        MessageReader<ReadHalf<S>>,
        MessageWriter<WriteHalf<S>>,
    ) {
        (self.session, self.reader, self.writer)
    }
}
