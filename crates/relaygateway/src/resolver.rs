use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{
	LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::system_conf::read_system_conf;
use tracing::debug;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ResolverError {
	#[error("invalid resolver url {url:?}: {reason}")]
	BadUrl { url: String, reason: String },
	#[error("unsupported resolver scheme {0:?}")]
	Scheme(String),
	#[error("cannot resolve upstream resolver address {0:?}")]
	UpstreamAddr(String),
	#[error("system resolver configuration: {0}")]
	System(#[from] hickory_resolver::error::ResolveError),
	#[error("no addresses for {host}: {errors}")]
	Miss { host: String, errors: String },
}

/// Address family requested from a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
	#[default]
	Ip,
	Ip4,
	Ip6,
}

impl Family {
	fn admits(&self, addr: &IpAddr) -> bool {
		match self {
			Family::Ip => true,
			Family::Ip4 => addr.is_ipv4(),
			Family::Ip6 => addr.is_ipv6(),
		}
	}
}

impl FromStr for Family {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ip" => Ok(Family::Ip),
			"ip4" => Ok(Family::Ip4),
			"ip6" => Ok(Family::Ip6),
			other => Err(format!("unknown address family {other:?}")),
		}
	}
}

/// DNS facade fanning every lookup out to all configured upstreams at once.
/// The first successful answer wins and the remaining queries are dropped.
pub struct FanResolver {
	backend: Backend,
}

enum Backend {
	Hickory(Vec<(String, TokioAsyncResolver)>),
	#[cfg(test)]
	Mock(std::collections::HashMap<String, Vec<IpAddr>>),
}

impl FanResolver {
	/// Resolver built from the platform's stub configuration. Used when the
	/// operator supplies no explicit upstream URLs.
	pub fn system() -> Result<FanResolver, ResolverError> {
		let (cfg, mut opts) = read_system_conf()?;
		opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
		Ok(FanResolver {
			backend: Backend::Hickory(vec![(
				"system".to_string(),
				TokioAsyncResolver::tokio(cfg, opts),
			)]),
		})
	}

	/// One upstream per URL. Schemes: `dns`/`udp` (plain, port 53), `tcp`
	/// (53), `http`/`https`/`doh` (DNS-over-HTTPS, ports 80/443), `tls`/`dot`
	/// (DNS-over-TLS, port 853). A bare host is read as `dns://host:53`.
	pub async fn from_urls(urls: &[String]) -> Result<FanResolver, ResolverError> {
		if urls.is_empty() {
			return Self::system();
		}
		let mut upstreams = Vec::with_capacity(urls.len());
		for u in urls {
			upstreams.push((u.clone(), upstream_from_url(u).await?));
		}
		Ok(FanResolver {
			backend: Backend::Hickory(upstreams),
		})
	}

	#[cfg(test)]
	pub(crate) fn mock(entries: &[(&str, IpAddr)]) -> FanResolver {
		let mut map: std::collections::HashMap<String, Vec<IpAddr>> = Default::default();
		for (host, ip) in entries {
			map.entry(host.to_string()).or_default().push(*ip);
		}
		FanResolver {
			backend: Backend::Mock(map),
		}
	}

	pub async fn lookup(&self, family: Family, host: &str) -> Result<Vec<IpAddr>, ResolverError> {
		let upstreams = match &self.backend {
			Backend::Hickory(upstreams) => upstreams,
			#[cfg(test)]
			Backend::Mock(map) => {
				let addrs: Vec<IpAddr> = map
					.get(host)
					.map(|v| v.iter().filter(|a| family.admits(a)).copied().collect())
					.unwrap_or_default();
				return if addrs.is_empty() {
					Err(ResolverError::Miss {
						host: host.to_string(),
						errors: "mock: no record".to_string(),
					})
				} else {
					Ok(addrs)
				};
			},
		};
		let mut pending: FuturesUnordered<_> = upstreams
			.iter()
			.map(|(name, resolver)| {
				let resolver = resolver.clone();
				async move { (name.as_str(), resolver.lookup_ip(host).await) }
			})
			.collect();

		let mut errors = Vec::new();
		while let Some((name, res)) = pending.next().await {
			match res {
				Ok(lookup) => {
					let addrs: Vec<IpAddr> = lookup.iter().filter(|a| family.admits(a)).collect();
					if !addrs.is_empty() {
						debug!(upstream = name, %host, count = addrs.len(), "resolved");
						return Ok(addrs);
					}
					errors.push(format!("{name}: no matching records"));
				},
				Err(e) => errors.push(format!("{name}: {e}")),
			}
		}
		Err(ResolverError::Miss {
			host: host.to_string(),
			errors: errors.join("; "),
		})
	}
}

async fn upstream_from_url(u: &str) -> Result<TokioAsyncResolver, ResolverError> {
	let parsed = parse_resolver_url(u)?;
	let scheme = parsed.scheme().to_ascii_lowercase();
	let host = parsed
		.host_str()
		.ok_or_else(|| ResolverError::BadUrl {
			url: u.to_string(),
			reason: "missing host".to_string(),
		})?
		.to_string();

	let (protocol, default_port, needs_tls_name) = match scheme.as_str() {
		"dns" | "udp" => (Protocol::Udp, 53, false),
		"tcp" => (Protocol::Tcp, 53, false),
		"https" | "doh" => (Protocol::Https, 443, true),
		"http" => (Protocol::Https, 80, true),
		"tls" | "dot" => (Protocol::Tls, 853, true),
		other => return Err(ResolverError::Scheme(other.to_string())),
	};
	let port = parsed.port().unwrap_or(default_port);
	let socket_addr = resolve_upstream_addr(&host, port).await?;

	let mut ns = NameServerConfig::new(socket_addr, protocol);
	if needs_tls_name {
		ns.tls_dns_name = Some(host.clone());
	}
	let mut cfg = ResolverConfig::new();
	cfg.add_name_server(ns);
	let mut opts = ResolverOpts::default();
	opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
	Ok(TokioAsyncResolver::tokio(cfg, opts))
}

fn parse_resolver_url(u: &str) -> Result<Url, ResolverError> {
	match Url::parse(u) {
		Ok(parsed)
			if matches!(
				parsed.scheme(),
				"dns" | "udp" | "tcp" | "http" | "https" | "doh" | "tls" | "dot"
			) =>
		{
			Ok(parsed)
		},
		Ok(parsed) if u.contains("://") => Err(ResolverError::Scheme(parsed.scheme().to_string())),
		// A bare "host" or "host:port" either fails to parse or swallows the
		// host into the scheme slot. Both read as plain DNS.
		_ => Url::parse(&format!("dns://{u}")).map_err(|e| ResolverError::BadUrl {
			url: u.to_string(),
			reason: e.to_string(),
		}),
	}
}

async fn resolve_upstream_addr(host: &str, port: u16) -> Result<SocketAddr, ResolverError> {
	if let Ok(ip) = host.parse::<IpAddr>() {
		return Ok(SocketAddr::new(ip, port));
	}
	tokio::net::lookup_host((host, port))
		.await
		.ok()
		.and_then(|mut addrs| addrs.next())
		.ok_or_else(|| ResolverError::UpstreamAddr(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bare_host_defaults_to_plain_dns() {
		let parsed = parse_resolver_url("9.9.9.9").unwrap();
		assert_eq!(parsed.scheme(), "dns");
		assert_eq!(parsed.host_str(), Some("9.9.9.9"));
		assert_eq!(parsed.port(), None);
	}

	#[test]
	fn bare_host_with_port_keeps_port() {
		let parsed = parse_resolver_url("9.9.9.9:5353").unwrap();
		assert_eq!(parsed.scheme(), "dns");
		assert_eq!(parsed.port(), Some(5353));
	}

	#[test]
	fn doh_and_dot_schemes_are_recognized() {
		for u in ["https://dns.example/dns-query", "doh://dns.example", "tls://9.9.9.9", "dot://9.9.9.9"] {
			assert!(parse_resolver_url(u).is_ok(), "{u}");
		}
	}

	#[tokio::test]
	async fn unsupported_scheme_is_rejected() {
		assert!(matches!(
			upstream_from_url("ftp://example.com").await,
			Err(ResolverError::Scheme(_)) | Err(ResolverError::BadUrl { .. })
		));
	}

	#[test]
	fn family_filters() {
		let v4: IpAddr = "192.0.2.1".parse().unwrap();
		let v6: IpAddr = "2001:db8::1".parse().unwrap();
		assert!(Family::Ip.admits(&v4) && Family::Ip.admits(&v6));
		assert!(Family::Ip4.admits(&v4) && !Family::Ip4.admits(&v6));
		assert!(Family::Ip6.admits(&v6) && !Family::Ip6.admits(&v4));
	}
}
