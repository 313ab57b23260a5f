use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::transport::{DialError, Stream};

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("failed to read CA file {path}: {source}")]
	CaRead {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("no usable certificates in CA file {path}")]
	CaEmpty { path: PathBuf },
	#[error("tls configuration: {0}")]
	Config(#[from] rustls::Error),
	#[error("verifier construction: {0}")]
	Verifier(#[from] rustls::client::VerifierBuilderError),
	#[error("invalid tls server name {0:?}")]
	ServerName(String),
}

/// Build the root store used for every relay and fallback-agent handshake:
/// the operator-supplied CA bundle when given, the platform store otherwise.
pub fn load_roots(cafile: Option<&Path>) -> Result<Arc<RootCertStore>, TlsError> {
	let mut roots = RootCertStore::empty();
	match cafile {
		Some(path) => {
			let pem = std::fs::read(path).map_err(|source| TlsError::CaRead {
				path: path.to_path_buf(),
				source,
			})?;
			let certs = rustls_pemfile::certs(&mut io::BufReader::new(io::Cursor::new(pem)))
				.collect::<Result<Vec<_>, _>>()
				.map_err(|source| TlsError::CaRead {
					path: path.to_path_buf(),
					source,
				})?;
			let (added, _) = roots.add_parsable_certificates(certs);
			if added == 0 {
				return Err(TlsError::CaEmpty {
					path: path.to_path_buf(),
				});
			}
		},
		None => {
			for cert in rustls_native_certs::load_native_certs().certs {
				let _ = roots.add(cert);
			}
		},
	}
	Ok(Arc::new(roots))
}

/// Server certificate verification pinned to an expected hostname.
///
/// Relay handshakes may omit SNI entirely, so the library's name check (keyed
/// off the connection's server name) cannot be trusted to see the right name.
/// This verifier substitutes the expected name before delegating the full
/// webpki chain verification against the configured roots.
#[derive(Debug)]
struct ForcedNameVerification {
	inner: Arc<WebPkiServerVerifier>,
	expected: ServerName<'static>,
}

impl ServerCertVerifier for ForcedNameVerification {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		ocsp: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		self
			.inner
			.verify_server_cert(end_entity, intermediates, &self.expected, ocsp, now)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// A ready-to-use TLS client for one expected peer.
#[derive(Clone)]
pub struct TlsClient {
	connector: TlsConnector,
	server_name: ServerName<'static>,
}

impl TlsClient {
	/// Fronted handshake towards a relay or fallback agent: optionally hide
	/// the server name from the ClientHello while always verifying the peer
	/// chain against `expected` and the supplied roots.
	pub fn fronted(
		expected: &str,
		roots: Arc<RootCertStore>,
		hide_sni: bool,
	) -> Result<TlsClient, TlsError> {
		let server_name = ServerName::try_from(expected.to_string())
			.map_err(|_| TlsError::ServerName(expected.to_string()))?;
		let verifier = Arc::new(ForcedNameVerification {
			inner: WebPkiServerVerifier::builder_with_provider(roots, provider()).build()?,
			expected: server_name.clone(),
		});
		let mut cfg = ClientConfig::builder_with_provider(provider())
			.with_protocol_versions(ALL_TLS_VERSIONS)?
			.dangerous()
			.with_custom_certificate_verifier(verifier)
			.with_no_client_auth();
		cfg.enable_sni = !hide_sni;
		cfg.alpn_protocols = vec![b"http/1.1".into()];
		Ok(TlsClient {
			connector: TlsConnector::from(Arc::new(cfg)),
			server_name,
		})
	}

	/// Ordinary webpki handshake, name taken from the dialed host. Used for
	/// the Registrar itself (directly or inside a fallback-agent tunnel).
	pub fn standard(host: &str, roots: Arc<RootCertStore>) -> Result<TlsClient, TlsError> {
		let server_name = ServerName::try_from(host.to_string())
			.map_err(|_| TlsError::ServerName(host.to_string()))?;
		let mut cfg = ClientConfig::builder_with_provider(provider())
			.with_protocol_versions(ALL_TLS_VERSIONS)?
			.with_root_certificates(roots)
			.with_no_client_auth();
		cfg.alpn_protocols = vec![b"http/1.1".into()];
		Ok(TlsClient {
			connector: TlsConnector::from(Arc::new(cfg)),
			server_name,
		})
	}

	pub async fn handshake(&self, stream: Stream, addr: &str) -> Result<Stream, DialError> {
		debug!(%addr, name=?self.server_name, "tls handshake");
		let tls = self
			.connector
			.connect(self.server_name.clone(), stream)
			.await
			.map_err(|source| DialError::Handshake {
				addr: addr.to_string(),
				source,
			})?;
		Ok(Box::new(tls))
	}
}
