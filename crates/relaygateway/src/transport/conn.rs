use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;

use crate::transport::Stream;

/// Adapter handing an established [`Stream`] to hyper's legacy client.
///
/// `proxied` marks the connection as pointing at an HTTP proxy, which makes
/// hyper emit absolute-form request targets on it.
pub struct Tunneled {
	io: TokioIo<Stream>,
	proxied: bool,
}

impl Tunneled {
	pub fn new(stream: Stream, proxied: bool) -> Self {
		Self {
			io: TokioIo::new(stream),
			proxied,
		}
	}
}

impl Connection for Tunneled {
	fn connected(&self) -> Connected {
		let c = Connected::new();
		if self.proxied { c.proxy(true) } else { c }
	}
}

impl Read for Tunneled {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: ReadBufCursor<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_read(cx, buf)
	}
}

impl Write for Tunneled {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.io).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_shutdown(cx)
	}
}
