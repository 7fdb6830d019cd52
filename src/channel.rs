use std::collections::VecDeque;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::metrics;
use crate::resp::RespValue;

/// The completion handle for one in-flight command.
pub(crate) type ReplySender = oneshot::Sender<Result<RespValue>>;

/// FIFO request/response pipeline over the outbound half of a transport.
///
/// Redis guarantees replies in write order, so the Nth write's response is
/// the Nth inbound frame. The channel is owned by a single driver task,
/// which makes the enqueue-then-write pair atomic with respect to inbound
/// dispatch: a reply can never observe a missing promise.
pub(crate) struct CommandChannel<W> {
    write: W,
    queue: VecDeque<ReplySender>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> CommandChannel<W> {
    pub fn new(write: W) -> Self {
        Self {
            write,
            queue: VecDeque::new(),
            closed: false,
        }
    }

    /// Queue `reply` and hand `bytes` to the transport.
    ///
    /// On a write failure the promise is handed the error instead of
    /// staying queued, and the error is returned — a failed transport
    /// write is fatal to the whole connection, so the caller is expected
    /// to follow up with [`fail_all`](Self::fail_all).
    pub async fn write_command(&mut self, bytes: &[u8], reply: ReplySender, flush: bool) -> Result<()> {
        if self.closed {
            let _ = reply.send(Err(Error::ConnectionClosed));
            return Err(Error::ConnectionClosed);
        }

        // enqueue happens-before the bytes enter the transport
        self.queue.push_back(reply);
        match self.write_bytes(bytes, flush).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(reply) = self.queue.pop_back() {
                    let _ = reply.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Write bytes that expect no reply through the response queue
    /// (subscription changes do not follow the request/response shape).
    pub async fn write_raw(&mut self, bytes: &[u8], flush: bool) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.write_bytes(bytes, flush).await
    }

    async fn write_bytes(&mut self, bytes: &[u8], flush: bool) -> Result<()> {
        self.write.write_all(bytes).await?;
        if flush {
            self.write.flush().await?;
        }
        Ok(())
    }

    /// Resolve the head-of-queue promise with a decoded reply.
    ///
    /// An `Error` frame fails only that one promise; the connection stays
    /// healthy. A reply with nothing queued is a protocol invariant
    /// violation — the frame is logged and discarded.
    pub fn dispatch_reply(&mut self, value: RespValue) {
        metrics::global().record_reply();
        let Some(reply) = self.queue.pop_front() else {
            tracing::error!(
                frame = ?value,
                "reply arrived with an empty response queue; discarding"
            );
            return;
        };

        let result = match value {
            RespValue::Error(message) => Err(Error::Redis(message)),
            value => Ok(value),
        };
        // the caller may have stopped waiting; that is their business
        let _ = reply.send(result);
    }

    /// Fail every queued promise with `error` and reject all future
    /// writes.
    pub fn fail_all(&mut self, error: &Error) {
        self.closed = true;
        if !self.queue.is_empty() {
            tracing::debug!(pending = self.queue.len(), error = %error, "draining response queue");
        }
        for reply in self.queue.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        self.write.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.write.shutdown().await;
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp;

    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;

    fn channel() -> (CommandChannel<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (CommandChannel::new(ours), theirs)
    }

    #[tokio::test]
    async fn replies_resolve_in_write_order() {
        let (mut ch, _peer) = channel();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            let bytes = resp::encode_command(&[bytes::Bytes::from(format!("CMD{i}").into_bytes())]);
            ch.write_command(&bytes, tx, true).await.unwrap();
            receivers.push(rx);
        }
        assert_eq!(ch.pending(), 3);

        for i in 0..3 {
            ch.dispatch_reply(RespValue::Integer(i));
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap(), RespValue::Integer(i as i64));
        }
    }

    #[tokio::test]
    async fn error_frame_fails_only_its_own_promise() {
        let (mut ch, _peer) = channel();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            ch.write_command(b"*1\r\n$4\r\nPING\r\n", tx, true).await.unwrap();
            receivers.push(rx);
        }

        ch.dispatch_reply(RespValue::simple_string("PONG"));
        ch.dispatch_reply(RespValue::Error("ERR boom".into()));
        ch.dispatch_reply(RespValue::simple_string("PONG"));

        let mut results = Vec::new();
        for rx in receivers {
            results.push(rx.await.unwrap());
        }
        assert!(results[0].is_ok());
        assert!(matches!(&results[1], Err(Error::Redis(m)) if m == "ERR boom"));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn fail_all_drains_every_promise_and_poisons_the_channel() {
        let (mut ch, _peer) = channel();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel();
            ch.write_command(b"x", tx, false).await.unwrap();
            receivers.push(rx);
        }

        let error: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        ch.fail_all(&error);

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(Error::Io(_))));
        }

        let (tx, rx) = oneshot::channel();
        assert!(matches!(
            ch.write_command(b"y", tx, false).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn reply_with_empty_queue_is_discarded() {
        let (mut ch, _peer) = channel();
        ch.dispatch_reply(RespValue::simple_string("stray"));
        assert_eq!(ch.pending(), 0);
    }

    #[tokio::test]
    async fn bytes_reach_the_transport() {
        let (mut ch, mut peer) = channel();
        let (tx, _rx) = oneshot::channel();
        ch.write_command(b"*1\r\n$4\r\nPING\r\n", tx, true).await.unwrap();

        let mut buf = BytesMut::new();
        peer.read_buf(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[tokio::test]
    async fn write_failure_hands_the_error_to_the_promise() {
        let (ours, peer) = tokio::io::duplex(16);
        drop(peer);
        let mut ch = CommandChannel::new(ours);

        let (tx, rx) = oneshot::channel();
        let result = ch.write_command(b"*1\r\n$4\r\nPING\r\n", tx, true).await;
        assert!(result.is_err());
        assert_eq!(ch.pending(), 0);
        assert!(rx.await.unwrap().is_err());
    }
}
