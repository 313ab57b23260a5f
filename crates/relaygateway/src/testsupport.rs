use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::registrar::RegistrarConfig;
use crate::transport::DirectDialer;

/// Produces the wire form of a fallback blob for the given JSON document:
/// base64 without padding, then the first 3 bytes moved to the back (the
/// decoder's rotation undoes this).
pub fn encode_blob(json: &str) -> Vec<u8> {
	let encoded = STANDARD_NO_PAD.encode(json.as_bytes());
	let bytes = encoded.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	out.extend_from_slice(&bytes[3..]);
	out.extend_from_slice(&bytes[..3]);
	out
}

pub fn fresh_blob_json(agents: &str) -> String {
	let now_ms = SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.unwrap()
		.as_millis() as i64;
	format!(r#"{{"agents":[{agents}],"updated_ts":{now_ms},"ttl_ms":3600000}}"#)
}

/// Minimal HTTP server handing the same response body to every GET. Returns
/// the URL to fetch and a counter of served requests.
pub async fn serve_blob(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let hits = Arc::new(AtomicUsize::new(0));
	let counter = hits.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else {
				return;
			};
			counter.fetch_add(1, Ordering::SeqCst);
			let body = body.clone();
			tokio::spawn(async move {
				let mut buf = [0u8; 2048];
				let _ = sock.read(&mut buf).await;
				let head = format!(
					"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
					body.len()
				);
				let _ = sock.write_all(head.as_bytes()).await;
				let _ = sock.write_all(&body).await;
				let _ = sock.flush().await;
			});
		}
	});
	(format!("http://{addr}/cloud_failover.conf"), hits)
}

/// Registrar context for tests: direct dialing, a throwaway self-signed CA in
/// the root store (verifier construction requires at least one anchor).
pub fn registrar_cfg(fallback_url: String) -> Arc<RegistrarConfig> {
	let ca = rcgen::generate_simple_self_signed(vec!["test.hola.org".to_string()]).unwrap();
	let mut roots = rustls::RootCertStore::empty();
	roots.add(ca.cert.der().clone()).unwrap();
	Arc::new(RegistrarConfig {
		user_agent: "test-agent/1.0".to_string(),
		ext_ver: "1.0.0".to_string(),
		roots: Arc::new(roots),
		hide_sni: true,
		base: Arc::new(DirectDialer {
			timeout: Duration::from_secs(5),
		}),
		fallback_url,
	})
}
