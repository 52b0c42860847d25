//! Stream transport: socket, framing, shaping and the stanza size cap.
//!
//! A [`Transport`] owns the socket (plain TCP, TLS, or an in-process
//! duplex pipe used by tests and embedded setups), feeds raw bytes into
//! the incremental stream parser, and yields complete [`StreamEvent`]s.
//! The read path debits the stream's shaper bucket, so a saturated bucket
//! suspends reads and backpressures the peer's socket.

use crate::shaper::StreamShaper;
use bytes::BytesMut;
use rxmpp_proto::{Element, ParseError, StreamEvent, StreamParser};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

const READ_CHUNK: usize = 4096;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A stanza exceeded the listener's size cap.
    #[error("stanza exceeds {limit} bytes")]
    StanzaTooLarge { limit: usize },
}

enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Duplex(DuplexStream),
}

impl Socket {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf).await,
            Self::Tls(s) => s.read(buf).await,
            Self::Duplex(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.write_all(data).await,
            Self::Tls(s) => s.write_all(data).await,
            Self::Duplex(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush().await,
            Self::Tls(s) => s.flush().await,
            Self::Duplex(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.shutdown().await,
            Self::Tls(s) => s.shutdown().await,
            Self::Duplex(s) => s.shutdown().await,
        }
    }
}

/// One stream's transport.
pub struct Transport {
    socket: Socket,
    parser: StreamParser,
    shaper: Arc<StreamShaper>,
    max_stanza_size: usize,
    buf: BytesMut,
    secured: bool,
}

impl Transport {
    /// Plain TCP transport.
    pub fn plain(stream: TcpStream, max_stanza_size: usize) -> Self {
        Self::build(Socket::Plain(stream), max_stanza_size, false)
    }

    /// Direct-TLS transport.
    pub fn tls(stream: TlsStream<TcpStream>, max_stanza_size: usize) -> Self {
        Self::build(Socket::Tls(Box::new(stream)), max_stanza_size, true)
    }

    /// In-process transport over a duplex pipe.
    pub fn duplex(stream: DuplexStream, max_stanza_size: usize) -> Self {
        Self::build(Socket::Duplex(stream), max_stanza_size, false)
    }

    fn build(socket: Socket, max_stanza_size: usize, secured: bool) -> Self {
        Self {
            socket,
            parser: StreamParser::new(),
            shaper: Arc::new(StreamShaper::unshaped()),
            max_stanza_size,
            buf: BytesMut::with_capacity(READ_CHUNK),
            secured,
        }
    }

    /// Whether the socket is TLS-wrapped.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Attach the shaper selected at bind time.
    pub fn set_shaper(&mut self, shaper: StreamShaper) {
        self.shaper = Arc::new(shaper);
    }

    /// Forget parser state across a stream restart (STARTTLS, SASL).
    pub fn reset_parser(&mut self) {
        self.parser.reset();
    }

    /// Next complete stream event. `Ok(None)` means EOF.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, TransportError> {
        loop {
            if let Some(event) = self.parser.next_event()? {
                return Ok(Some(event));
            }
            if self.parser.pending_bytes() > self.max_stanza_size {
                return Err(TransportError::StanzaTooLarge {
                    limit: self.max_stanza_size,
                });
            }

            self.buf.resize(READ_CHUNK, 0);
            let n = self.socket.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            // Feed before any suspension so a cancelled poll never loses
            // bytes already taken off the socket.
            self.parser.feed(&self.buf[..n]);
            if self.parser.pending_bytes() > self.max_stanza_size {
                return Err(TransportError::StanzaTooLarge {
                    limit: self.max_stanza_size,
                });
            }
            self.shaper.throttle(n).await;
        }
    }

    /// Write raw stream text (headers, closing tags).
    pub async fn write_raw(&mut self, data: &str) -> std::io::Result<()> {
        self.socket.write_all(data.as_bytes()).await?;
        self.socket.flush().await
    }

    /// Write one element.
    pub async fn write_element(&mut self, element: &Element) -> std::io::Result<()> {
        let xml = element.to_xml();
        self.socket.write_all(xml.as_bytes()).await?;
        self.socket.flush().await
    }

    /// Half-close the socket after the stream is done.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.socket.shutdown().await
    }

    /// Upgrade a plain socket to TLS (STARTTLS accept side). The parser
    /// is reset; the next bytes start a new stream.
    pub async fn starttls(&mut self, acceptor: &TlsAcceptor) -> std::io::Result<()> {
        let plain = std::mem::replace(&mut self.socket, Socket::Duplex(tokio::io::duplex(1).0));
        match plain {
            Socket::Plain(stream) => {
                let tls = acceptor.accept(stream).await?;
                self.socket = Socket::Tls(Box::new(tls));
                self.secured = true;
                self.parser.reset();
                Ok(())
            }
            other => {
                self.socket = other;
                Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "starttls on a non-plain socket",
                ))
            }
        }
    }
}
