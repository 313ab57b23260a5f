use std::str::FromStr;
use std::time::Duration;

/// Kind of relay pool requested from the Registrar. Drives both the
/// `zgettunnels` country key and the port picked from the response port map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
	#[default]
	Direct,
	Lum,
	Peer,
	Pool,
	Virt,
}

impl ProxyType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProxyType::Direct => "direct",
			ProxyType::Lum => "lum",
			ProxyType::Peer => "peer",
			ProxyType::Pool => "pool",
			ProxyType::Virt => "virt",
		}
	}
}

impl std::fmt::Display for ProxyType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ProxyType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"direct" => Ok(ProxyType::Direct),
			"lum" => Ok(ProxyType::Lum),
			"peer" => Ok(ProxyType::Peer),
			"pool" => Ok(ProxyType::Pool),
			"virt" => Ok(ProxyType::Virt),
			other => Err(format!(
				"unknown proxy type {other:?}, expected one of: direct, lum, peer, pool, virt"
			)),
		}
	}
}

/// Everything the credential service needs to know about one session's
/// Registrar conversation.
#[derive(Debug, Clone)]
pub struct Config {
	pub country: String,
	pub proxy_type: ProxyType,
	pub limit: u32,
	pub rotate: Duration,
	pub probe_timeout: Duration,
	pub backoff_initial: Duration,
	pub backoff_deadline: Duration,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn proxy_type_round_trips_through_display() {
		for t in [
			ProxyType::Direct,
			ProxyType::Lum,
			ProxyType::Peer,
			ProxyType::Pool,
			ProxyType::Virt,
		] {
			assert_eq!(t.as_str().parse::<ProxyType>().unwrap(), t);
		}
		assert!("socks".parse::<ProxyType>().is_err());
	}
}
