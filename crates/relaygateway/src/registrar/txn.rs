use std::sync::Arc;

use rand::TryRngCore;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::registrar::client::ApiClient;
use crate::registrar::fallback::{FallbackCache, FallbackError};
use crate::registrar::RegistrarConfig;

/// Runs Registrar transactions with transport-level fallback: the probe is
/// tried against a direct client first; if the direct path is blocked, each
/// emergency relay is tried in a fresh random order. The runner never retries
/// within one client, and probes are strictly sequential.
pub struct TransactionRunner {
	cfg: Arc<RegistrarConfig>,
	cache: FallbackCache,
}

impl TransactionRunner {
	pub fn new(cfg: Arc<RegistrarConfig>) -> TransactionRunner {
		let cache = FallbackCache::new(cfg.fallback_url.clone(), &cfg.user_agent);
		TransactionRunner { cfg, cache }
	}

	/// Returns `Ok(true)` on the first successful probe, `Ok(false)` when the
	/// direct path and every fallback agent failed, and `Err` only when the
	/// fallback config itself could not be obtained. Per-attempt timeouts are
	/// the probe's own responsibility.
	pub async fn ensure_transaction<F, Fut>(&self, probe: F) -> Result<bool, FallbackError>
	where
		F: Fn(ApiClient) -> Fut,
		Fut: Future<Output = bool>,
	{
		if probe(ApiClient::direct(&self.cfg)).await {
			return Ok(true);
		}
		info!("direct registrar path failed, trying fallback agents");

		let mut agents = self.cache.get().await?.agents;
		agents.shuffle(&mut OsRng.unwrap_err());
		for agent in &agents {
			let client = match ApiClient::via_agent(&self.cfg, agent) {
				Ok(client) => client,
				Err(e) => {
					warn!(agent = %agent.hostname(), error = %e, "unusable fallback agent");
					continue;
				},
			};
			info!(agent = %agent.hostname(), "probing via fallback agent");
			if probe(client).await {
				return Ok(true);
			}
		}
		Ok(false)
	}
}
