use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::http::{FORBIDDEN_HOST_VALUE, HeaderMap, StatusCode, header};
use crate::transport::tls::TlsClient;
use crate::transport::{DialError, Dialer, PrefixedStream, Stream};

/// Reads the live Proxy-Authorization header. The credential service swaps
/// the value under its mutex; dialers never cache it across connections.
pub type AuthProvider = Arc<dyn Fn() -> String + Send + Sync>;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Parsed head of a proxy's reply to CONNECT. `trailer` holds any bytes the
/// peer sent past the header terminator; they belong to the tunnel.
pub struct ConnectResponse {
	pub status: u16,
	pub forbidden_host: bool,
	pub trailer: Bytes,
}

impl ConnectResponse {
	/// Maps a non-200 reply onto the dialer error vocabulary, recognizing
	/// the relay's hostname-blocklist refusal.
	pub fn ensure_established(&self, target: &str) -> Result<(), DialError> {
		match StatusCode::from_u16(self.status) {
			Ok(StatusCode::OK) => Ok(()),
			_ if self.forbidden_host => Err(DialError::UpstreamBlocked {
				target: target.to_string(),
			}),
			_ => Err(DialError::ConnectRefused {
				target: target.to_string(),
				status: self.status,
			}),
		}
	}

	/// The established tunnel, with any buffered trailer bytes put back in
	/// front of the stream.
	pub fn into_stream(self, stream: Stream) -> Stream {
		if self.trailer.is_empty() {
			stream
		} else {
			Box::new(PrefixedStream::new(self.trailer, stream))
		}
	}
}

/// Writes an HTTP/1.1 CONNECT for `target` and parses the single response.
/// `extra` carries a downstream client's own request headers along; the
/// request line, Host and Proxy-Authorization are always ours.
pub async fn establish_connect(
	stream: &mut Stream,
	target: &str,
	auth: Option<&str>,
	extra: Option<&HeaderMap>,
) -> Result<ConnectResponse, DialError> {
	let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
	if let Some(auth) = auth {
		req.push_str("Proxy-Authorization: ");
		req.push_str(auth);
		req.push_str("\r\n");
	}
	if let Some(extra) = extra {
		for (name, value) in extra {
			if name == header::HOST || name == header::PROXY_AUTHORIZATION {
				continue;
			}
			if let Ok(value) = value.to_str() {
				req.push_str(name.as_str());
				req.push_str(": ");
				req.push_str(value);
				req.push_str("\r\n");
			}
		}
	}
	req.push_str("\r\n");
	stream.write_all(req.as_bytes()).await?;
	stream.flush().await?;

	let mut buf = BytesMut::with_capacity(1024);
	loop {
		let mut headers = [httparse::EMPTY_HEADER; 32];
		let mut resp = httparse::Response::new(&mut headers);
		match resp.parse(&buf) {
			Ok(httparse::Status::Complete(head_len)) => {
				let status = resp.code.unwrap_or(0);
				let forbidden_host = resp.headers.iter().any(|h| {
					h.name.eq_ignore_ascii_case("x-hola-error")
						&& h.value == FORBIDDEN_HOST_VALUE.as_bytes()
				});
				let trailer = buf.split_off(head_len).freeze();
				return Ok(ConnectResponse {
					status,
					forbidden_host,
					trailer,
				});
			},
			Ok(httparse::Status::Partial) => {},
			Err(e) => return Err(DialError::BadResponse(e.to_string())),
		}
		if buf.len() >= MAX_RESPONSE_HEAD {
			return Err(DialError::BadResponse("response head too large".to_string()));
		}
		let n = stream.read_buf(&mut buf).await?;
		if n == 0 {
			return Err(DialError::BadResponse(
				"connection closed before response".to_string(),
			));
		}
	}
}

/// CONNECT-tunneling dialer: reaches the configured proxy over the next
/// dialer, optionally wraps it in (fronted) TLS, then asks it to open a
/// tunnel to the requested target.
pub struct ProxyDialer {
	addr: String,
	tls: Option<TlsClient>,
	auth: Option<AuthProvider>,
	next: Arc<dyn Dialer>,
}

impl ProxyDialer {
	pub fn new(
		addr: String,
		tls: Option<TlsClient>,
		auth: Option<AuthProvider>,
		next: Arc<dyn Dialer>,
	) -> Self {
		Self {
			addr,
			tls,
			auth,
			next,
		}
	}
}

#[async_trait::async_trait]
impl Dialer for ProxyDialer {
	async fn dial(&self, target: &str) -> Result<Stream, DialError> {
		let mut stream = self.next.dial(&self.addr).await?;
		if let Some(tls) = &self.tls {
			stream = tls.handshake(stream, &self.addr).await?;
		}
		let auth = self.auth.as_ref().map(|a| a());
		let resp = establish_connect(&mut stream, target, auth.as_deref(), None).await?;
		resp.ensure_established(target)?;
		debug!(proxy = %self.addr, %target, "tunnel established");
		Ok(resp.into_stream(stream))
	}
}

/// Fixed-address dialer without an inner CONNECT: reaches the relay and, when
/// it is TLS-fronted, performs the same servername-pinned handshake. Carries
/// whole proxied HTTP requests and the tunnel-and-rewrite rescue.
pub struct PlaintextDialer {
	addr: String,
	tls: Option<TlsClient>,
	next: Arc<dyn Dialer>,
}

impl PlaintextDialer {
	pub fn new(addr: String, tls: Option<TlsClient>, next: Arc<dyn Dialer>) -> Self {
		Self { addr, tls, next }
	}

	pub async fn connect(&self) -> Result<Stream, DialError> {
		let stream = self.next.dial(&self.addr).await?;
		match &self.tls {
			Some(tls) => tls.handshake(stream, &self.addr).await,
			None => Ok(stream),
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncWriteExt;

	use super::*;
	use crate::transport::DirectDialer;

	async fn serve_once(response: &'static [u8]) -> std::net::SocketAddr {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 1024];
			// Read the CONNECT head before answering.
			let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
			sock.write_all(response).await.unwrap();
			sock.flush().await.unwrap();
			tokio::time::sleep(std::time::Duration::from_millis(200)).await;
		});
		addr
	}

	fn direct() -> Arc<dyn Dialer> {
		Arc::new(DirectDialer {
			timeout: std::time::Duration::from_secs(5),
		})
	}

	#[tokio::test]
	async fn connect_tunnel_succeeds_on_200() {
		let addr = serve_once(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
		let dialer = ProxyDialer::new(addr.to_string(), None, None, direct());
		assert!(dialer.dial("example.com:443").await.is_ok());
	}

	#[tokio::test]
	async fn forbidden_host_maps_to_upstream_blocked() {
		let addr =
			serve_once(b"HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\n\r\n").await;
		let dialer = ProxyDialer::new(addr.to_string(), None, None, direct());
		match dialer.dial("blocked.test:443").await {
			Err(DialError::UpstreamBlocked { target }) => assert_eq!(target, "blocked.test:443"),
			other => panic!("expected UpstreamBlocked, got {:?}", other.map(|_| ())),
		}
	}

	#[tokio::test]
	async fn plain_403_maps_to_refused() {
		let addr = serve_once(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
		let dialer = ProxyDialer::new(addr.to_string(), None, None, direct());
		match dialer.dial("example.com:443").await {
			Err(DialError::ConnectRefused { status, .. }) => assert_eq!(status, 403),
			other => panic!("expected ConnectRefused, got {:?}", other.map(|_| ())),
		}
	}

	#[tokio::test]
	async fn tunnel_trailer_bytes_are_preserved() {
		let addr = serve_once(b"HTTP/1.1 200 OK\r\n\r\nearly-bytes").await;
		let dialer = ProxyDialer::new(addr.to_string(), None, None, direct());
		let mut stream = dialer.dial("example.com:443").await.unwrap();
		let mut out = vec![0u8; 11];
		tokio::io::AsyncReadExt::read_exact(&mut stream, &mut out)
			.await
			.unwrap();
		assert_eq!(&out, b"early-bytes");
	}
}
