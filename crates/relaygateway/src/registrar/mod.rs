pub mod client;
pub mod fallback;
pub mod txn;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProxyType;
use crate::http::BoxError;
use crate::transport::Dialer;
use crate::transport::tls::TlsError;
pub use client::ApiClient;

pub const CCGI_URL: &str = "https://client.hola.org/client_cgi/";
pub const VPN_COUNTRIES_URL: &str = "https://client.hola.org/client_cgi/vpn_countries.json";
pub const BG_INIT_URL: &str = "https://client.hola.org/client_cgi/background_init";
pub const ZGETTUNNELS_URL: &str = "https://client.hola.org/client_cgi/zgettunnels";

pub const EXT_BROWSER: &str = "chrome";
pub const PRODUCT: &str = "cws";

// zgettunnels backoff never sleeps longer than this between attempts.
const BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(600);

/// Shared context for every Registrar conversation: how to reach the network,
/// how to present ourselves, and how to verify the peers.
pub struct RegistrarConfig {
	pub user_agent: String,
	pub ext_ver: String,
	pub roots: Arc<rustls::RootCertStore>,
	pub hide_sni: bool,
	pub base: Arc<dyn Dialer>,
	pub fallback_url: String,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistrarError {
	#[error("request to {url} failed: {source}")]
	Transport {
		url: String,
		#[source]
		source: BoxError,
	},
	#[error("bad status {status} from {url}")]
	BadStatus { url: String, status: u16 },
	#[error("malformed response from {url}: {source}")]
	Decode {
		url: String,
		#[source]
		source: serde_json::Error,
	},
	#[error("account is temporarily banned")]
	TemporaryBan,
	#[error("account is permanently banned")]
	PermanentBan,
	#[error("no tunnels in registrar response")]
	EmptyResponse,
	#[error("invalid registrar url {0:?}")]
	BadUrl(String),
	#[error(transparent)]
	Tls(#[from] TlsError),
}

impl RegistrarError {
	/// Whether another `zgettunnels` attempt can change the outcome.
	fn is_retryable(&self) -> bool {
		matches!(
			self,
			RegistrarError::Transport { .. }
				| RegistrarError::BadStatus { .. }
				| RegistrarError::EmptyResponse
		)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct BgInitResponse {
	#[serde(default)]
	pub ver: String,
	pub key: i64,
	#[serde(default)]
	pub country: String,
	#[serde(default)]
	pub blocked: bool,
	#[serde(default)]
	pub permanent: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PortMap {
	#[serde(default)]
	pub direct: u16,
	#[serde(default)]
	pub hola: u16,
	#[serde(default)]
	pub peer: u16,
	#[serde(default)]
	pub trial: u16,
	#[serde(default)]
	pub trial_peer: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelsResponse {
	#[serde(default)]
	pub agent_key: String,
	#[serde(default)]
	pub agent_types: BTreeMap<String, String>,
	#[serde(default)]
	pub ip_list: BTreeMap<String, String>,
	#[serde(default)]
	pub port: PortMap,
	#[serde(default)]
	pub protocol: BTreeMap<String, String>,
	#[serde(default)]
	pub vendor: BTreeMap<String, String>,
	#[serde(default)]
	pub ztun: BTreeMap<String, Vec<String>>,
}

fn decode<T: serde::de::DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, RegistrarError> {
	serde_json::from_slice(body).map_err(|source| RegistrarError::Decode {
		url: url.to_string(),
		source,
	})
}

/// Country codes with VPN exit support.
pub async fn vpn_countries(client: &ApiClient) -> Result<Vec<String>, RegistrarError> {
	let mut url = Url::parse(VPN_COUNTRIES_URL).expect("static url");
	url.query_pairs_mut().append_pair("browser", EXT_BROWSER);
	let body = client.get(&url).await?;
	let list: Vec<String> = decode(VPN_COUNTRIES_URL, &body)?;
	Ok(normalize_countries(list))
}

/// The Registrar reports the United Kingdom as `uk`; the ISO code `gb` is
/// added alongside it. The result is sorted and free of duplicates.
fn normalize_countries(mut list: Vec<String>) -> Vec<String> {
	if list.iter().any(|c| c == "uk") {
		list.push("gb".to_string());
	}
	list.sort();
	list.dedup();
	list
}

pub async fn background_init(
	client: &ApiClient,
	ext_ver: &str,
	user_uuid: &str,
) -> Result<BgInitResponse, RegistrarError> {
	let mut url = Url::parse(BG_INIT_URL).expect("static url");
	url.query_pairs_mut().append_pair("uuid", user_uuid);
	let body = client
		.post_form(&url, &[("login", "1"), ("ver", ext_ver)])
		.await?;
	let resp: BgInitResponse = decode(BG_INIT_URL, &body)?;
	if resp.blocked {
		return Err(if resp.permanent {
			RegistrarError::PermanentBan
		} else {
			RegistrarError::TemporaryBan
		});
	}
	Ok(resp)
}

/// The pool key the Registrar expects in the `country` parameter.
pub fn country_key(country: &str, proxy_type: ProxyType) -> String {
	match proxy_type {
		ProxyType::Lum => format!("{country}.pool_lum_{country}_shared"),
		ProxyType::Virt => format!("{country}.pool_virt_pool_{country}"),
		ProxyType::Pool => format!("{country}.pool"),
		ProxyType::Direct | ProxyType::Peer => country.to_string(),
	}
}

#[allow(clippy::too_many_arguments)]
pub async fn zgettunnels(
	client: &ApiClient,
	user_uuid: &str,
	session_key: i64,
	ext_ver: &str,
	country: &str,
	proxy_type: ProxyType,
	limit: u32,
) -> Result<TunnelsResponse, RegistrarError> {
	let mut url = Url::parse(ZGETTUNNELS_URL).expect("static url");
	url
		.query_pairs_mut()
		.append_pair("country", &country_key(country, proxy_type))
		.append_pair("limit", &limit.to_string())
		.append_pair("ping_id", &rand::rng().random::<f64>().to_string())
		.append_pair("ext_ver", ext_ver)
		.append_pair("browser", EXT_BROWSER)
		.append_pair("product", PRODUCT)
		.append_pair("uuid", user_uuid)
		.append_pair("session_key", &session_key.to_string())
		.append_pair("is_premium", "0");
	let body = client.get(&url).await?;
	let tunnels: TunnelsResponse = decode(ZGETTUNNELS_URL, &body)?;
	if tunnels.ip_list.is_empty() {
		return Err(RegistrarError::EmptyResponse);
	}
	Ok(tunnels)
}

/// The wall-time of one tunnel list acquisition is strictly bounded by
/// `deadline`; individual sleeps never exceed ten minutes.
fn backoff_policy(initial: Duration, deadline: Duration) -> ExponentialBackoff {
	ExponentialBackoff {
		initial_interval: initial,
		randomization_factor: 0.5,
		multiplier: 1.5,
		max_interval: BACKOFF_MAX_INTERVAL,
		max_elapsed_time: Some(deadline),
		..ExponentialBackoff::default()
	}
}

pub struct TunnelParams<'a> {
	pub country: &'a str,
	pub proxy_type: ProxyType,
	pub limit: u32,
	pub ext_ver: &'a str,
	pub backoff_initial: Duration,
	pub backoff_deadline: Duration,
}

/// Full session setup: mint a fresh user id, register it, then fetch tunnels,
/// retrying `zgettunnels` with exponential backoff until success or deadline.
pub async fn tunnels(
	client: &ApiClient,
	params: &TunnelParams<'_>,
) -> Result<(TunnelsResponse, String), RegistrarError> {
	let user_uuid = uuid::Uuid::new_v4().simple().to_string();
	let init = background_init(client, params.ext_ver, &user_uuid).await?;
	debug!(country = %init.country, "registrar session established");

	let policy = backoff_policy(params.backoff_initial, params.backoff_deadline);
	let tunnels = backoff::future::retry(policy, || async {
		zgettunnels(
			client,
			&user_uuid,
			init.key,
			params.ext_ver,
			params.country,
			params.proxy_type,
			params.limit,
		)
		.await
		.map_err(|e| {
			if e.is_retryable() {
				warn!(error = %e, "tunnel list fetch failed, will retry");
				backoff::Error::transient(e)
			} else {
				backoff::Error::permanent(e)
			}
		})
	})
	.await?;
	Ok((tunnels, user_uuid))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn country_key_per_proxy_type() {
		assert_eq!(country_key("de", ProxyType::Lum), "de.pool_lum_de_shared");
		assert_eq!(country_key("de", ProxyType::Virt), "de.pool_virt_pool_de");
		assert_eq!(country_key("de", ProxyType::Pool), "de.pool");
		assert_eq!(country_key("de", ProxyType::Peer), "de");
		assert_eq!(country_key("de", ProxyType::Direct), "de");
	}

	#[test]
	fn uk_implies_gb_and_result_is_sorted() {
		let got = normalize_countries(vec![
			"us".to_string(),
			"uk".to_string(),
			"de".to_string(),
			"de".to_string(),
		]);
		assert_eq!(got, vec!["de", "gb", "uk", "us"]);

		let got = normalize_countries(vec!["us".to_string(), "de".to_string()]);
		assert_eq!(got, vec!["de", "us"]);
	}

	#[test]
	fn backoff_policy_is_deadline_bounded() {
		let p = backoff_policy(Duration::from_secs(3), Duration::from_secs(300));
		assert_eq!(p.initial_interval, Duration::from_secs(3));
		assert_eq!(p.max_elapsed_time, Some(Duration::from_secs(300)));
		assert_eq!(p.max_interval, Duration::from_secs(600));
		assert_eq!(p.multiplier, 1.5);
		assert_eq!(p.randomization_factor, 0.5);
	}

	#[test]
	fn empty_ip_list_is_a_retryable_error() {
		let parsed: TunnelsResponse = serde_json::from_str(r#"{"ip_list":{}}"#).unwrap();
		assert!(parsed.ip_list.is_empty());
		assert!(RegistrarError::EmptyResponse.is_retryable());
		assert!(!RegistrarError::PermanentBan.is_retryable());
	}

	#[test]
	fn tunnels_response_parses_registrar_payload() {
		let raw = r#"{
			"agent_key": "key123",
			"agent_types": {"zagent1234.hola.org": "zagent"},
			"ip_list": {"zagent1234.hola.org": "198.51.100.10"},
			"port": {"direct": 22222, "hola": 22223, "peer": 22224, "trial": 22225, "trial_peer": 22226},
			"protocol": {"zagent1234.hola.org": "HTTP"},
			"vendor": {"zagent1234.hola.org": "do"},
			"ztun": {"de": ["HTTP zagent1234.hola.org:22222"]}
		}"#;
		let parsed: TunnelsResponse = serde_json::from_str(raw).unwrap();
		assert_eq!(parsed.agent_key, "key123");
		assert_eq!(parsed.port.direct, 22222);
		assert_eq!(parsed.port.trial_peer, 22226);
		assert_eq!(
			parsed.ip_list.get("zagent1234.hola.org").map(String::as_str),
			Some("198.51.100.10")
		);
	}
}
