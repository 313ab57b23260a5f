use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::endpoint::Endpoint;
use crate::resolver::FanResolver;
use crate::transport::DirectDialer;

fn test_auth() -> AuthProvider {
	Arc::new(|| "basic dXNlcjprZXk=".to_string())
}

async fn read_head(stream: &mut TcpStream) -> String {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await.unwrap();
		assert!(n > 0, "peer closed before end of head: {:?}", String::from_utf8_lossy(&buf));
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			return String::from_utf8(buf).unwrap();
		}
	}
}

async fn spawn_handler(relay: SocketAddr, resolver: FanResolver) -> SocketAddr {
	let endpoint = Endpoint {
		host: "relay.internal".to_string(),
		ip: relay.ip(),
		port: relay.port(),
		tls_name: None,
	};
	let handler = ProxyHandler::new(
		&endpoint,
		test_auth(),
		Arc::new(resolver),
		Arc::new(DirectDialer {
			timeout: Duration::from_secs(5),
		}),
		Arc::new(rustls::RootCertStore::empty()),
		true,
	)
	.unwrap();
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(handler.serve(listener));
	addr
}

#[tokio::test]
async fn connect_happy_path_splices_both_ways() {
	let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let relay_addr = relay.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = relay.accept().await.unwrap();
		let head = read_head(&mut sock).await;
		assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{head}");
		let lower = head.to_ascii_lowercase();
		assert!(lower.contains("proxy-authorization: basic"), "{head}");
		// End-to-end client headers travel along, hop-by-hop ones do not.
		assert!(lower.contains("user-agent: curl/8.0"), "{head}");
		assert!(!lower.contains("proxy-connection"), "{head}");
		sock
			.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
			.await
			.unwrap();

		let mut buf = [0u8; 5];
		sock.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
		sock.write_all(b"world").await.unwrap();
		sock.flush().await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
	});

	let proxy = spawn_handler(relay_addr, FanResolver::mock(&[])).await;
	let mut client = TcpStream::connect(proxy).await.unwrap();
	client
		.write_all(
			b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: curl/8.0\r\nProxy-Connection: keep-alive\r\n\r\n",
		)
		.await
		.unwrap();
	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 200"), "{head}");

	client.write_all(b"hello").await.unwrap();
	let mut buf = [0u8; 5];
	client.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"world");
}

#[tokio::test]
async fn connect_rescue_redials_with_resolved_address() {
	let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let relay_addr = relay.local_addr().unwrap();
	tokio::spawn(async move {
		// First attempt: refuse by hostname.
		let (mut sock, _) = relay.accept().await.unwrap();
		let head = read_head(&mut sock).await;
		assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{head}");
		sock
			.write_all(b"HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\n\r\n")
			.await
			.unwrap();
		drop(sock);

		// Second attempt must carry the resolved IP literal.
		let (mut sock, _) = relay.accept().await.unwrap();
		let head = read_head(&mut sock).await;
		assert!(head.starts_with("CONNECT 203.0.113.9:443 HTTP/1.1\r\n"), "{head}");
		sock
			.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
			.await
			.unwrap();
		let mut buf = [0u8; 4];
		sock.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");
		sock.write_all(b"pong").await.unwrap();
		sock.flush().await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
	});

	let resolver = FanResolver::mock(&[("example.com", "203.0.113.9".parse().unwrap())]);
	let proxy = spawn_handler(relay_addr, resolver).await;
	let mut client = TcpStream::connect(proxy).await.unwrap();
	client
		.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
		.await
		.unwrap();
	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 200"), "{head}");

	client.write_all(b"ping").await.unwrap();
	let mut buf = [0u8; 4];
	client.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn absolute_form_get_rescued_through_tunnel() {
	let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let relay_addr = relay.local_addr().unwrap();
	tokio::spawn(async move {
		// Plain proxied request, refused by hostname.
		let (mut sock, _) = relay.accept().await.unwrap();
		let head = read_head(&mut sock).await;
		assert!(head.starts_with("GET http://blocked.test/ HTTP/1.1\r\n"), "{head}");
		let lower = head.to_ascii_lowercase();
		assert!(lower.contains("proxy-authorization: basic"), "{head}");
		// Hop-by-hop headers from the client must not reach the relay.
		assert!(!lower.contains("proxy-connection"), "{head}");
		sock
			.write_all(
				b"HTTP/1.1 403 Forbidden\r\nX-Hola-Error: Forbidden Host\r\nContent-Length: 0\r\n\r\n",
			)
			.await
			.unwrap();

		// Rescue: CONNECT to the resolved address, then the original request.
		let (mut sock, _) = relay.accept().await.unwrap();
		let head = read_head(&mut sock).await;
		assert!(head.starts_with("CONNECT 198.51.100.7:80 HTTP/1.1\r\n"), "{head}");
		sock
			.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
			.await
			.unwrap();

		let inner = read_head(&mut sock).await;
		assert!(inner.starts_with("GET / HTTP/1.1\r\n"), "{inner}");
		let inner_lower = inner.to_ascii_lowercase();
		assert!(inner_lower.contains("host: blocked.test"), "{inner}");
		assert!(inner_lower.contains("connection: close"), "{inner}");
		assert!(!inner_lower.contains("proxy-authorization"), "{inner}");
		sock
			.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nrescued")
			.await
			.unwrap();
		sock.flush().await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
	});

	let resolver = FanResolver::mock(&[("blocked.test", "198.51.100.7".parse().unwrap())]);
	let proxy = spawn_handler(relay_addr, resolver).await;
	let mut client = TcpStream::connect(proxy).await.unwrap();
	client
		.write_all(
			b"GET http://blocked.test/ HTTP/1.1\r\nHost: blocked.test\r\nProxy-Connection: keep-alive\r\n\r\n",
		)
		.await
		.unwrap();
	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 200"), "{head}");
	let mut body = [0u8; 7];
	client.read_exact(&mut body).await.unwrap();
	assert_eq!(&body, b"rescued");
}

#[tokio::test]
async fn relay_failure_yields_bad_gateway() {
	// Nothing is listening on the relay address.
	let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let relay_addr = unused.local_addr().unwrap();
	drop(unused);

	let proxy = spawn_handler(relay_addr, FanResolver::mock(&[])).await;
	let mut client = TcpStream::connect(proxy).await.unwrap();
	client
		.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
		.await
		.unwrap();
	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 502"), "{head}");
}
