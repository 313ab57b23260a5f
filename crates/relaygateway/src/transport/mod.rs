pub mod conn;
pub mod dialer;
pub mod tls;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A connected byte stream: plain TCP, TLS-wrapped, or tunneled through an
/// upstream proxy. Everything above the dialers works in terms of this.
pub type Stream = Box<dyn AsyncStream>;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("dial {addr}: {source}")]
	Connect {
		addr: String,
		#[source]
		source: io::Error,
	},
	#[error("dial {addr}: connect timed out")]
	Timeout { addr: String },
	#[error("tls handshake with {addr}: {source}")]
	Handshake {
		addr: String,
		#[source]
		source: io::Error,
	},
	#[error("proxy refused CONNECT to {target}: status {status}")]
	ConnectRefused { target: String, status: u16 },
	#[error("destination {target} blocked by upstream")]
	UpstreamBlocked { target: String },
	#[error("malformed proxy response: {0}")]
	BadResponse(String),
	#[error("io on proxy connection: {0}")]
	Io(#[from] io::Error),
}

/// The dial seam. Base dialers reach the network directly or through the
/// operator's outbound proxy; the relay dialers stack on top of one.
#[async_trait]
pub trait Dialer: Send + Sync {
	/// Establish a stream to `addr` ("host:port").
	async fn dial(&self, addr: &str) -> Result<Stream, DialError>;
}

/// Plain TCP with a connect timeout.
pub struct DirectDialer {
	pub timeout: Duration,
}

#[async_trait]
impl Dialer for DirectDialer {
	async fn dial(&self, addr: &str) -> Result<Stream, DialError> {
		let conn = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| DialError::Timeout {
				addr: addr.to_string(),
			})?
			.map_err(|e| DialError::Connect {
				addr: addr.to_string(),
				source: e,
			})?;
		let _ = conn.set_nodelay(true);
		Ok(Box::new(conn))
	}
}

/// Stream with bytes that were already read off the wire (trailing data after
/// a parsed proxy response). Those bytes surface before the inner stream.
pub struct PrefixedStream {
	prefix: Bytes,
	inner: Stream,
}

impl PrefixedStream {
	pub fn new(prefix: Bytes, inner: Stream) -> Self {
		Self { prefix, inner }
	}
}

impl AsyncRead for PrefixedStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		if !self.prefix.is_empty() {
			let n = std::cmp::min(self.prefix.len(), buf.remaining());
			buf.put_slice(&self.prefix.split_to(n));
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for PrefixedStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn prefixed_stream_surfaces_buffered_bytes_first() {
		let (client, mut server) = tokio::io::duplex(64);
		server.write_all(b" world").await.unwrap();

		let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), Box::new(client));
		let mut out = vec![0u8; 11];
		stream.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"hello world");
	}
}
