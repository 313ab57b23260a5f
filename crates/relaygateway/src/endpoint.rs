use std::net::IpAddr;

use crate::config::ProxyType;
use crate::registrar::TunnelsResponse;

#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
	#[error("no tunnels in registrar response")]
	NoTunnels,
	#[error("tunnel {host} has unparseable address {addr:?}")]
	BadAddress { host: String, addr: String },
	#[error("registrar response carries no port for proxy type {0}")]
	NoPort(ProxyType),
}

/// Relay access descriptor chosen for the session. Dialing goes to `ip:port`;
/// `tls_name`, when set, is the hostname the relay's certificate must match
/// (and the transport is fronted TLS). Immutable once chosen.
#[derive(Debug, Clone)]
pub struct Endpoint {
	pub host: String,
	pub ip: IpAddr,
	pub port: u16,
	pub tls_name: Option<String>,
}

impl Endpoint {
	pub fn addr(&self) -> String {
		match self.ip {
			IpAddr::V4(ip) => format!("{}:{}", ip, self.port),
			IpAddr::V6(ip) => format!("[{}]:{}", ip, self.port),
		}
	}
}

/// Picks the relay to use from a tunnels response: the first host of the
/// ip-list, with the port matching the requested proxy type.
pub fn get_endpoint(
	tunnels: &TunnelsResponse,
	proxy_type: ProxyType,
) -> Result<Endpoint, EndpointError> {
	let (host, addr) = tunnels
		.ip_list
		.iter()
		.next()
		.ok_or(EndpointError::NoTunnels)?;
	let ip: IpAddr = addr.parse().map_err(|_| EndpointError::BadAddress {
		host: host.clone(),
		addr: addr.clone(),
	})?;
	let port = match proxy_type {
		ProxyType::Peer => tunnels.port.peer,
		ProxyType::Direct | ProxyType::Lum | ProxyType::Pool | ProxyType::Virt => tunnels.port.direct,
	};
	if port == 0 {
		return Err(EndpointError::NoPort(proxy_type));
	}
	Ok(Endpoint {
		host: host.clone(),
		ip,
		port,
		tls_name: Some(host.clone()),
	})
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::registrar::PortMap;

	fn tunnels(hosts: &[(&str, &str)], port: PortMap) -> TunnelsResponse {
		TunnelsResponse {
			agent_key: "key".to_string(),
			ip_list: hosts
				.iter()
				.map(|(h, ip)| (h.to_string(), ip.to_string()))
				.collect(),
			port,
			..Default::default()
		}
	}

	#[test]
	fn picks_first_host_with_direct_port() {
		let t = tunnels(
			&[("zagent1.hola.org", "198.51.100.1")],
			PortMap {
				direct: 22222,
				peer: 22223,
				..Default::default()
			},
		);
		let ep = get_endpoint(&t, ProxyType::Direct).unwrap();
		assert_eq!(ep.host, "zagent1.hola.org");
		assert_eq!(ep.addr(), "198.51.100.1:22222");
		assert_eq!(ep.tls_name.as_deref(), Some("zagent1.hola.org"));
	}

	#[test]
	fn peer_type_selects_peer_port() {
		let t = tunnels(
			&[("zagent1.hola.org", "198.51.100.1")],
			PortMap {
				direct: 22222,
				peer: 22223,
				..Default::default()
			},
		);
		let ep = get_endpoint(&t, ProxyType::Peer).unwrap();
		assert_eq!(ep.port, 22223);
	}

	#[test]
	fn empty_ip_list_is_rejected() {
		let t = tunnels(&[], PortMap::default());
		assert_matches!(
			get_endpoint(&t, ProxyType::Direct),
			Err(EndpointError::NoTunnels)
		);
	}

	#[test]
	fn unparseable_address_is_rejected() {
		let t = tunnels(
			&[("zagent1.hola.org", "not-an-ip")],
			PortMap {
				direct: 22222,
				..Default::default()
			},
		);
		assert_matches!(
			get_endpoint(&t, ProxyType::Direct),
			Err(EndpointError::BadAddress { .. })
		);
	}
}
