use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::debug;
use url::Url;

use crate::http::{Body, BoxError, full};
use crate::registrar::fallback::FallbackAgent;
use crate::registrar::{RegistrarConfig, RegistrarError};
use crate::transport::conn::Tunneled;
use crate::transport::dialer::ProxyDialer;
use crate::transport::tls::TlsClient;
use crate::transport::{Dialer, Stream};

/// HTTP client for Registrar RPCs. The transaction runner swaps the whole
/// client between attempts (direct vs. tunneled through a fallback agent); a
/// single client never retries at the transport level by itself.
#[derive(Clone)]
pub struct ApiClient {
	client: Client<ApiConnector, Body>,
	user_agent: Arc<str>,
}

enum Route {
	Direct,
	ViaAgent { dialer: Arc<ProxyDialer> },
}

struct ConnectorState {
	route: Route,
	roots: Arc<rustls::RootCertStore>,
	base: Arc<dyn Dialer>,
}

#[derive(Clone)]
struct ApiConnector {
	state: Arc<ConnectorState>,
}

impl Service<::http::Uri> for ApiConnector {
	type Response = Tunneled;
	type Error = BoxError;
	type Future = Pin<Box<dyn Future<Output = Result<Tunneled, BoxError>> + Send>>;

	fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, uri: ::http::Uri) -> Self::Future {
		let state = self.state.clone();
		Box::pin(async move {
			let host = uri
				.host()
				.ok_or_else(|| format!("request uri {uri} has no host"))?
				.to_string();
			let tls = uri.scheme_str() != Some("http");
			let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
			let addr = format!("{host}:{port}");
			let stream: Stream = match &state.route {
				Route::Direct => state.base.dial(&addr).await?,
				Route::ViaAgent { dialer } => dialer.dial(&addr).await?,
			};
			let stream = if tls {
				TlsClient::standard(&host, state.roots.clone())?
					.handshake(stream, &addr)
					.await?
			} else {
				stream
			};
			Ok(Tunneled::new(stream, false))
		})
	}
}

impl ApiClient {
	/// Client dialing the Registrar directly over the base dialer.
	pub fn direct(cfg: &RegistrarConfig) -> ApiClient {
		Self::build(cfg, Route::Direct)
	}

	/// Client routing every request through a fallback agent's TLS-fronted
	/// CONNECT proxy.
	pub fn via_agent(cfg: &RegistrarConfig, agent: &FallbackAgent) -> Result<ApiClient, RegistrarError> {
		let fronted = TlsClient::fronted(&agent.hostname(), cfg.roots.clone(), cfg.hide_sni)?;
		let dialer = Arc::new(ProxyDialer::new(
			agent.addr(),
			Some(fronted),
			None,
			cfg.base.clone(),
		));
		Ok(Self::build(cfg, Route::ViaAgent { dialer }))
	}

	fn build(cfg: &RegistrarConfig, route: Route) -> ApiClient {
		let connector = ApiConnector {
			state: Arc::new(ConnectorState {
				route,
				roots: cfg.roots.clone(),
				base: cfg.base.clone(),
			}),
		};
		let client = Client::builder(TokioExecutor::new())
			.timer(hyper_util::rt::TokioTimer::new())
			.pool_timer(hyper_util::rt::TokioTimer::new())
			.build(connector);
		ApiClient {
			client,
			user_agent: cfg.user_agent.as_str().into(),
		}
	}

	pub async fn get(&self, url: &Url) -> Result<Bytes, RegistrarError> {
		self.run(::http::Method::GET, url, None).await
	}

	pub async fn post_form(
		&self,
		url: &Url,
		form: &[(&str, &str)],
	) -> Result<Bytes, RegistrarError> {
		let body = {
			let mut body = url::form_urlencoded::Serializer::new(String::new());
			for (k, v) in form {
				body.append_pair(k, v);
			}
			body.finish()
		};
		self.run(::http::Method::POST, url, Some(body)).await
	}

	async fn run(
		&self,
		method: ::http::Method,
		url: &Url,
		form_body: Option<String>,
	) -> Result<Bytes, RegistrarError> {
		let uri: ::http::Uri = url
			.as_str()
			.parse()
			.map_err(|_| RegistrarError::BadUrl(url.to_string()))?;
		let mut builder = ::http::Request::builder()
			.method(method)
			.uri(uri)
			.header(::http::header::USER_AGENT, self.user_agent.as_ref());
		if form_body.is_some() {
			builder = builder.header(
				::http::header::CONTENT_TYPE,
				"application/x-www-form-urlencoded",
			);
		}
		let req = builder
			.body(match form_body {
				Some(b) => full(b),
				None => crate::http::empty(),
			})
			.map_err(|_| RegistrarError::BadUrl(url.to_string()))?;

		debug!(url = %url, "registrar request");
		let resp = self
			.client
			.request(req)
			.await
			.map_err(|e| RegistrarError::Transport {
				url: url.to_string(),
				source: Box::new(e),
			})?;
		let status = resp.status();
		let body = resp
			.into_body()
			.collect()
			.await
			.map_err(|e| RegistrarError::Transport {
				url: url.to_string(),
				source: Box::new(e),
			})?
			.to_bytes();
		if !status.is_success() {
			return Err(RegistrarError::BadStatus {
				url: url.to_string(),
				status: status.as_u16(),
			});
		}
		Ok(body)
	}
}
