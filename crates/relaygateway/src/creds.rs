use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::registrar::fallback::FallbackError;
use crate::registrar::txn::TransactionRunner;
use crate::registrar::{RegistrarConfig, RegistrarError, TunnelParams, TunnelsResponse, tunnels};
use crate::transport::dialer::AuthProvider;

#[derive(thiserror::Error, Debug)]
pub enum CredError {
	#[error("registrar transaction failed: {0}")]
	Registrar(#[from] RegistrarError),
	#[error("fallback path failed: {0}")]
	Fallback(#[from] FallbackError),
	#[error("no registrar endpoint reachable")]
	Unavailable,
}

/// Renders the login the relay expects for a session user id.
pub fn login(user_uuid: &str) -> String {
	format!("user-uuid-{user_uuid}-is_prem-0")
}

pub fn basic_auth_header(login: &str, password: &str) -> String {
	format!(
		"basic {}",
		BASE64_STANDARD.encode(format!("{login}:{password}"))
	)
}

struct CredState {
	auth_header: String,
	user_uuid: String,
}

/// Holds the live relay credential and keeps it fresh.
///
/// Readers always observe a consistent `{header, uuid}` pair: rotation
/// replaces both fields under the same mutex the accessor reads through.
pub struct CredService {
	state: Arc<Mutex<CredState>>,
	rotation: Option<JoinHandle<()>>,
}

impl CredService {
	/// Bootstraps credentials through the transaction runner and, when a
	/// rotation interval is configured, starts the (single) rotation task.
	/// Rotation failures are logged and never propagate to readers.
	pub async fn start(
		registrar: Arc<RegistrarConfig>,
		runner: Arc<TransactionRunner>,
		cfg: Config,
	) -> Result<(CredService, TunnelsResponse), CredError> {
		let (tunnels, user_uuid) = fetch_credentials(&runner, &registrar, &cfg).await?;
		let state = Arc::new(Mutex::new(CredState {
			auth_header: basic_auth_header(&login(&user_uuid), &tunnels.agent_key),
			user_uuid,
		}));

		let rotation = if cfg.rotate > Duration::ZERO {
			let state = state.clone();
			let runner = runner.clone();
			let registrar = registrar.clone();
			Some(tokio::spawn(async move {
				let mut ticker = tokio::time::interval(cfg.rotate);
				ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
				// interval fires immediately; the first rotation is one period out
				ticker.tick().await;
				loop {
					ticker.tick().await;
					info!("rotating credentials");
					match fetch_credentials(&runner, &registrar, &cfg).await {
						Ok((tuns, uuid)) => {
							let header = basic_auth_header(&login(&uuid), &tuns.agent_key);
							let mut state = state.lock().expect("cred mutex poisoned");
							state.auth_header = header;
							state.user_uuid = uuid;
							info!("credentials rotated");
						},
						Err(e) => warn!(error = %e, "credential rotation failed, keeping previous credentials"),
					}
				}
			}))
		} else {
			None
		};

		Ok((CredService { state, rotation }, tunnels))
	}

	pub fn auth(&self) -> String {
		self
			.state
			.lock()
			.expect("cred mutex poisoned")
			.auth_header
			.clone()
	}

	pub fn user_uuid(&self) -> String {
		self
			.state
			.lock()
			.expect("cred mutex poisoned")
			.user_uuid
			.clone()
	}

	pub fn auth_provider(&self) -> AuthProvider {
		let state = self.state.clone();
		Arc::new(move || {
			state
				.lock()
				.expect("cred mutex poisoned")
				.auth_header
				.clone()
		})
	}
}

impl Drop for CredService {
	fn drop(&mut self) {
		if let Some(task) = self.rotation.take() {
			task.abort();
		}
	}
}

/// One full credential acquisition through the transaction runner. The probe
/// owns the per-attempt timeout; the registrar's own error (a ban, say) wins
/// over the generic "nothing reachable" outcome.
pub async fn fetch_credentials(
	runner: &TransactionRunner,
	registrar: &RegistrarConfig,
	cfg: &Config,
) -> Result<(TunnelsResponse, String), CredError> {
	type Outcome = Option<Result<(TunnelsResponse, String), RegistrarError>>;
	let outcome: Arc<Mutex<Outcome>> = Arc::new(Mutex::new(None));

	let completed = runner
		.ensure_transaction(|client| {
			let outcome = outcome.clone();
			let country = cfg.country.clone();
			let ext_ver = registrar.ext_ver.clone();
			let (proxy_type, limit) = (cfg.proxy_type, cfg.limit);
			let (backoff_initial, backoff_deadline) = (cfg.backoff_initial, cfg.backoff_deadline);
			let probe_timeout = cfg.probe_timeout;
			async move {
				let params = TunnelParams {
					country: &country,
					proxy_type,
					limit,
					ext_ver: &ext_ver,
					backoff_initial,
					backoff_deadline,
				};
				match tokio::time::timeout(probe_timeout, tunnels(&client, &params)).await {
					Ok(Ok(res)) => {
						*outcome.lock().expect("outcome mutex poisoned") = Some(Ok(res));
						true
					},
					Ok(Err(e)) => {
						warn!(error = %e, "registrar transaction attempt failed");
						*outcome.lock().expect("outcome mutex poisoned") = Some(Err(e));
						false
					},
					Err(_) => {
						warn!("registrar transaction attempt timed out");
						false
					},
				}
			}
		})
		.await?;

	let outcome = outcome
		.lock()
		.expect("outcome mutex poisoned")
		.take();
	match (completed, outcome) {
		(true, Some(Ok(res))) => Ok(res),
		(_, Some(Err(e))) => Err(CredError::Registrar(e)),
		_ => Err(CredError::Unavailable),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn login_template() {
		assert_eq!(
			login("c6d4f8a04556ae42f22cbf2b1eaf1c2e"),
			"user-uuid-c6d4f8a04556ae42f22cbf2b1eaf1c2e-is_prem-0"
		);
	}

	#[test]
	fn auth_header_decodes_to_login_and_key() {
		let header = basic_auth_header(&login("c6d4f8a04556ae42f22cbf2b1eaf1c2e"), "agent-key-1");
		let (scheme, payload) = header.split_once(' ').unwrap();
		assert_eq!(scheme, "basic");
		let decoded = BASE64_STANDARD.decode(payload).unwrap();
		assert_eq!(
			decoded,
			b"user-uuid-c6d4f8a04556ae42f22cbf2b1eaf1c2e-is_prem-0:agent-key-1"
		);
	}

	#[test]
	fn accessor_sees_consistent_pair_across_swap() {
		let state = Arc::new(Mutex::new(CredState {
			auth_header: basic_auth_header(&login("a".repeat(32).as_str()), "key-a"),
			user_uuid: "a".repeat(32),
		}));
		let before = state.lock().unwrap().auth_header.clone();

		{
			let mut s = state.lock().unwrap();
			s.auth_header = basic_auth_header(&login("b".repeat(32).as_str()), "key-b");
			s.user_uuid = "b".repeat(32);
		}
		let after = state.lock().unwrap().auth_header.clone();

		for header in [before, after] {
			let payload = header.strip_prefix("basic ").unwrap();
			let decoded = String::from_utf8(BASE64_STANDARD.decode(payload).unwrap()).unwrap();
			let (login_part, key) = decoded.split_once(':').unwrap();
			// The uuid inside the login always matches the key generation.
			if login_part.contains(&"a".repeat(32)) {
				assert_eq!(key, "key-a");
			} else {
				assert_eq!(key, "key-b");
			}
		}
	}
}
