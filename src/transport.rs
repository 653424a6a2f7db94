//! Packet framing over a byte-stream transport
//!
//! Any `AsyncRead + AsyncWrite` stream works: plain TCP, a TLS stream supplied
//! by the host program, or an in-memory duplex in tests.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::Timings;
use crate::error::{Error, Result};
use crate::protocol::{decode, encode_into, Packet};

/// Duplex byte stream a session runs over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

const READ_CHUNK: usize = 4096;

/// Buffers a transport and converts between bytes and packets
pub struct PacketStream<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
    io_retries: u32,
    io_retry_backoff: Duration,
}

impl<S: Transport> PacketStream<S> {
    pub fn new(stream: S, max_packet_size: usize, timings: &Timings) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            max_packet_size,
            io_retries: timings.io_retries,
            io_retry_backoff: timings.io_retry_backoff,
        }
    }

    /// Decode the next complete packet already in the read buffer
    pub fn next_buffered(&mut self) -> Result<Option<Packet>> {
        match decode(&self.read_buf, self.max_packet_size)? {
            Some((packet, used)) => {
                self.read_buf.advance(used);
                trace!("received {:?}", packet.packet_type());
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Read more bytes from the transport.
    ///
    /// Cancel safe: bytes are only appended to the buffer once read.
    pub async fn fill(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            self.read_buf.reserve(READ_CHUNK);
            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    debug!("transport closed by peer");
                    return Err(Error::ConnectionLost);
                }
                Ok(_) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < self.io_retries => {
                    attempt += 1;
                    debug!("transient read error (attempt {}): {}", attempt, e);
                    sleep(self.io_retry_backoff).await;
                }
                Err(e) => {
                    debug!("read failed: {}", e);
                    return Err(Error::ConnectionLost);
                }
            }
        }
    }

    /// Read until a complete packet is available
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }

    /// Encode and write packets, then flush
    pub async fn send<I>(&mut self, packets: I) -> Result<()>
    where
        I: IntoIterator<Item = Packet>,
    {
        self.queue(packets)?;
        self.write_queued().await
    }

    /// Encode packets into the write buffer without touching the transport
    pub fn queue<I>(&mut self, packets: I) -> Result<()>
    where
        I: IntoIterator<Item = Packet>,
    {
        for packet in packets {
            trace!("sending {:?}", packet.packet_type());
            encode_into(&packet, &mut self.write_buf)?;
        }
        Ok(())
    }

    /// Write the buffered bytes, then flush.
    ///
    /// Cancel safe: the buffer only shrinks by what the transport accepted,
    /// so a later call resumes where this one stopped.
    pub async fn write_queued(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        while !self.write_buf.is_empty() {
            match self.stream.write_buf(&mut self.write_buf).await {
                Ok(0) => return Err(Error::ConnectionLost),
                Ok(_) => {}
                Err(e) if is_transient(&e) && attempt < self.io_retries => {
                    attempt += 1;
                    debug!("transient write error (attempt {}): {}", attempt, e);
                    sleep(self.io_retry_backoff).await;
                }
                Err(e) => {
                    debug!("write failed: {}", e);
                    return Err(Error::ConnectionLost);
                }
            }
        }
        self.stream.flush().await.map_err(|e| {
            debug!("flush failed: {}", e);
            Error::ConnectionLost
        })
    }

    /// Close the write half; errors are irrelevant at this point
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Publish, QoS};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_packets_cross_a_duplex_stream() {
        let (a, b) = duplex(64);
        let timings = Timings::default();
        let mut left = PacketStream::new(a, 0, &timings);
        let mut right = PacketStream::new(b, 0, &timings);

        let publish = Packet::Publish(Publish::new("a/b", &b"hello"[..], QoS::AtMostOnce));
        left.send(vec![publish.clone(), Packet::PingReq]).await.unwrap();

        assert_eq!(right.read_packet().await.unwrap(), publish);
        assert_eq!(right.read_packet().await.unwrap(), Packet::PingReq);
    }

    #[tokio::test]
    async fn test_interrupted_write_resumes() {
        let (a, b) = duplex(16);
        let timings = Timings::default();
        let mut left = PacketStream::new(a, 0, &timings);
        let mut right = PacketStream::new(b, 0, &timings);

        let publish = Packet::Publish(Publish::new("a/b", vec![7u8; 64], QoS::AtMostOnce));
        left.queue(vec![publish.clone()]).unwrap();
        // only 16 bytes fit until the peer reads
        let stalled = tokio::time::timeout(Duration::from_millis(20), left.write_queued()).await;
        assert!(stalled.is_err());

        let (sent, received) = tokio::join!(left.write_queued(), right.read_packet());
        sent.unwrap();
        assert_eq!(received.unwrap(), publish);
    }

    #[tokio::test]
    async fn test_split_frame_is_reassembled() {
        let (mut raw, b) = duplex(64);
        let mut stream = PacketStream::new(b, 0, &Timings::default());
        let bytes = encode(&Packet::PubAck(77)).unwrap();

        raw.write_all(&bytes[..2]).await.unwrap();
        stream.fill().await.unwrap();
        assert_eq!(stream.next_buffered().unwrap(), None);

        raw.write_all(&bytes[2..]).await.unwrap();
        assert_eq!(stream.read_packet().await.unwrap(), Packet::PubAck(77));
    }

    #[tokio::test]
    async fn test_eof_is_connection_lost() {
        let (a, b) = duplex(64);
        drop(a);
        let mut stream = PacketStream::new(b, 0, &Timings::default());
        assert!(matches!(
            stream.read_packet().await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_a_protocol_error() {
        let (mut raw, b) = duplex(64);
        let mut stream = PacketStream::new(b, 0, &Timings::default());
        raw.write_all(&[0xF0, 0x00]).await.unwrap();
        let err = stream.read_packet().await.unwrap_err();
        assert!(matches!(err, Error::Codec(e) if e.is_protocol_error()));
    }
}
