use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::http::{
	Body, BoxError, HeaderValue, Response, Scheme, StatusCode, empty, full, is_forbidden_host,
	strip_hop_by_hop,
};
use crate::proxy::ProxyError;
use crate::proxy::splice::splice;
use crate::resolver::{FanResolver, Family};
use crate::transport::conn::Tunneled;
use crate::transport::dialer::{AuthProvider, PlaintextDialer, establish_connect};
use crate::transport::tls::{TlsClient, TlsError};
use crate::transport::{DialError, Dialer, Stream};

/// Serves downstream clients and forwards their traffic through the chosen
/// relay, rescuing destinations the relay refuses to name.
#[derive(Clone)]
pub struct ProxyHandler {
	inner: Arc<Inner>,
}

struct Inner {
	plain_dialer: Arc<PlaintextDialer>,
	auth: AuthProvider,
	resolver: Arc<FanResolver>,
	client: Client<RelayConnector, Body>,
}

/// Connector putting every proxied request on a fresh-or-pooled connection to
/// the relay; marking it proxied makes hyper emit absolute-form targets.
#[derive(Clone)]
struct RelayConnector {
	dialer: Arc<PlaintextDialer>,
}

impl tower::Service<::http::Uri> for RelayConnector {
	type Response = Tunneled;
	type Error = BoxError;
	type Future = Pin<Box<dyn Future<Output = Result<Tunneled, BoxError>> + Send>>;

	fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, _uri: ::http::Uri) -> Self::Future {
		let dialer = self.dialer.clone();
		Box::pin(async move {
			let stream = dialer.connect().await?;
			Ok(Tunneled::new(stream, true))
		})
	}
}

impl ProxyHandler {
	pub fn new(
		endpoint: &Endpoint,
		auth: AuthProvider,
		resolver: Arc<FanResolver>,
		base: Arc<dyn Dialer>,
		roots: Arc<rustls::RootCertStore>,
		hide_sni: bool,
	) -> Result<ProxyHandler, TlsError> {
		let tls = endpoint
			.tls_name
			.as_deref()
			.map(|name| TlsClient::fronted(name, roots, hide_sni))
			.transpose()?;
		let addr = endpoint.addr();
		let plain_dialer = Arc::new(PlaintextDialer::new(addr, tls, base));
		let client = Client::builder(TokioExecutor::new())
			.timer(hyper_util::rt::TokioTimer::new())
			.pool_timer(hyper_util::rt::TokioTimer::new())
			.build(RelayConnector {
				dialer: plain_dialer.clone(),
			});
		Ok(ProxyHandler {
			inner: Arc::new(Inner {
				plain_dialer,
				auth,
				resolver,
				client,
			}),
		})
	}

	/// Accept loop: one task per client connection, for the server's lifetime.
	pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
		loop {
			let (stream, peer) = listener.accept().await?;
			let handler = self.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| {
					let handler = handler.clone();
					async move { Ok::<_, std::convert::Infallible>(handler.dispatch(req).await) }
				});
				if let Err(e) = auto::Builder::new(TokioExecutor::new())
					.serve_connection_with_upgrades(TokioIo::new(stream), service)
					.await
				{
					debug!(%peer, error = %e, "client connection closed with error");
				}
			});
		}
	}

	async fn dispatch(self, req: ::http::Request<Incoming>) -> Response<Body> {
		let method = req.method().clone();
		let uri = req.uri().clone();
		debug!(%method, %uri, "request");
		let res = if method == ::http::Method::CONNECT {
			self.handle_connect(req).await
		} else {
			self.handle_http(req).await
		};
		res.unwrap_or_else(|e| {
			warn!(%method, %uri, error = %e, "request failed");
			e.into_response()
		})
	}

	/// CONNECT: open a tunnel through the relay and splice the two sockets.
	/// A "Forbidden Host" refusal is retried once with the target rewritten
	/// to a client-side-resolved IP literal, which the relay's hostname
	/// blocklist cannot match.
	async fn handle_connect(
		&self,
		req: ::http::Request<Incoming>,
	) -> Result<Response<Body>, ProxyError> {
		let authority = req
			.uri()
			.authority()
			.cloned()
			.ok_or(ProxyError::InvalidRequest)?;
		let port = authority.port_u16().unwrap_or(443);
		let target = format!("{}:{}", authority.host(), port);

		let mut fwd_headers = req.headers().clone();
		strip_hop_by_hop(&mut fwd_headers);

		let tunnel = match self.connect_tunnel(&target, &fwd_headers).await {
			Ok(tunnel) => tunnel,
			Err(DialError::UpstreamBlocked { .. }) => {
				let host = authority.host();
				info!(%host, "destination blocked by relay, rescuing via resolved address");
				let ips = self
					.inner
					.resolver
					.lookup(Family::Ip, host)
					.await
					.map_err(|_| ProxyError::Resolve(host.to_string()))?;
				let rewritten = join_host_port(ips[0], port);
				// secondary failures are final: no re-rescue
				self.connect_tunnel(&rewritten, &fwd_headers).await?
			},
			Err(e) => return Err(e.into()),
		};

		let on_upgrade = hyper::upgrade::on(req);
		tokio::spawn(async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					let client: Stream = Box::new(TokioIo::new(upgraded));
					if let Err(e) = splice(client, tunnel).await {
						debug!(error = %e, "tunnel closed with error");
					}
				},
				Err(e) => warn!(error = %e, "client connection upgrade failed"),
			}
		});
		Ok(
			::http::Response::builder()
				.status(StatusCode::OK)
				.body(empty())
				.expect("static response must build"),
		)
	}

	/// Absolute-form requests: round-trip through the relay acting as a plain
	/// HTTP proxy; on "Forbidden Host", replay the request through a CONNECT
	/// tunnel opened to the resolved address instead.
	async fn handle_http(
		&self,
		req: ::http::Request<Incoming>,
	) -> Result<Response<Body>, ProxyError> {
		if req.uri().scheme().is_none() {
			// A proxy only accepts absolute-form targets.
			return Err(ProxyError::InvalidRequest);
		}
		let (mut parts, body) = req.into_parts();
		let body = body
			.collect()
			.await
			.map_err(|_| ProxyError::InvalidRequest)?
			.to_bytes();

		strip_hop_by_hop(&mut parts.headers);
		// Snapshot for the rescue path, before the proxy credential is attached.
		let rescue_parts = parts.clone();

		let auth = HeaderValue::try_from((self.inner.auth)())
			.map_err(|_| ProxyError::Processing("credential is not a valid header".to_string()))?;
		parts
			.headers
			.insert(::http::header::PROXY_AUTHORIZATION, auth);
		let up_req = ::http::Request::from_parts(parts, full(body.clone()));

		let resp = self.inner.client.request(up_req).await?;
		if is_forbidden_host(resp.status(), resp.headers()) {
			// Drain so the pooled relay connection is reusable.
			let _ = resp.into_body().collect().await;
			return self.rescue_http(rescue_parts, body).await;
		}

		let (mut rparts, rbody) = resp.into_parts();
		strip_hop_by_hop(&mut rparts.headers);
		Ok(Response::from_parts(
			rparts,
			rbody.map_err(BoxError::from).boxed(),
		))
	}

	/// Opens a CONNECT tunnel through the relay, forwarding the downstream
	/// client's end-to-end headers (hop-by-hop ones already removed) with
	/// our credential attached.
	async fn connect_tunnel(
		&self,
		target: &str,
		client_headers: &::http::HeaderMap,
	) -> Result<Stream, DialError> {
		let mut stream = self.inner.plain_dialer.connect().await?;
		let auth = (self.inner.auth)();
		let resp = establish_connect(&mut stream, target, Some(&auth), Some(client_headers)).await?;
		resp.ensure_established(target)?;
		Ok(resp.into_stream(stream))
	}

	async fn rescue_http(
		&self,
		parts: ::http::request::Parts,
		body: Bytes,
	) -> Result<Response<Body>, ProxyError> {
		let uri = parts.uri.clone();
		let host = uri.host().ok_or(ProxyError::InvalidRequest)?;
		let https = uri.scheme() == Some(&Scheme::HTTPS);
		let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
		let ips = self
			.inner
			.resolver
			.lookup(Family::Ip, host)
			.await
			.map_err(|_| ProxyError::Resolve(host.to_string()))?;
		let target = join_host_port(ips[0], port);
		info!(%host, %target, "destination blocked by relay, rescuing with tunnel and rewrite");

		let mut stream = self.inner.plain_dialer.connect().await?;
		let auth = (self.inner.auth)();
		let connect = establish_connect(&mut stream, &target, Some(&auth), None).await?;
		if connect.status != 200 {
			return Err(ProxyError::Dial(DialError::ConnectRefused {
				target,
				status: connect.status,
			}));
		}
		let stream = connect.into_stream(stream);

		let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
			.await
			.map_err(ProxyError::UpstreamResponse)?;
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!(error = %e, "rescue connection ended with error");
			}
		});

		// Replay the original request in origin-form on the tunnel, one-shot.
		let path: ::http::Uri = uri
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/")
			.parse()
			.map_err(|_| ProxyError::InvalidRequest)?;
		let mut req = ::http::Request::new(full(body));
		*req.method_mut() = parts.method.clone();
		*req.uri_mut() = path;
		*req.headers_mut() = parts.headers.clone();
		if !req.headers().contains_key(::http::header::HOST) {
			let authority = uri.authority().ok_or(ProxyError::InvalidRequest)?;
			req.headers_mut().insert(
				::http::header::HOST,
				HeaderValue::try_from(authority.as_str()).map_err(|_| ProxyError::InvalidRequest)?,
			);
		}
		req
			.headers_mut()
			.insert(::http::header::CONNECTION, HeaderValue::from_static("close"));

		let resp = sender
			.send_request(req)
			.await
			.map_err(ProxyError::UpstreamResponse)?;
		let (mut rparts, rbody) = resp.into_parts();
		strip_hop_by_hop(&mut rparts.headers);
		Ok(Response::from_parts(
			rparts,
			rbody.map_err(BoxError::from).boxed(),
		))
	}
}

fn join_host_port(ip: IpAddr, port: u16) -> String {
	match ip {
		IpAddr::V4(ip) => format!("{ip}:{port}"),
		IpAddr::V6(ip) => format!("[{ip}]:{port}"),
	}
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
