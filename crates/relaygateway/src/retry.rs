use std::fmt::Display;
use std::time::Duration;

use tracing::warn;

/// Runs a named startup action up to `attempts` times (0 means until it
/// succeeds), sleeping `interval` between failures. Returns the first success
/// or the last error.
pub async fn retry<T, E, F, Fut>(
	name: &str,
	attempts: u32,
	interval: Duration,
	mut f: F,
) -> Result<T, E>
where
	E: Display,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let mut attempt = 0u32;
	loop {
		attempt += 1;
		match f().await {
			Ok(v) => return Ok(v),
			Err(e) => {
				if attempts != 0 && attempt >= attempts {
					warn!(action = name, attempt, error = %e, "giving up");
					return Err(e);
				}
				warn!(action = name, attempt, error = %e, "attempt failed, retrying");
				tokio::time::sleep(interval).await;
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn returns_first_success() {
		let calls = AtomicU32::new(0);
		let res: Result<u32, &str> = retry("test", 5, Duration::from_secs(1), || {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			async move { if n < 2 { Err("nope") } else { Ok(n) } }
		})
		.await;
		assert_eq!(res.unwrap(), 2);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_attempts_return_last_error() {
		let calls = AtomicU32::new(0);
		let res: Result<u32, &str> = retry("test", 3, Duration::from_secs(1), || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err("always") }
		})
		.await;
		assert_eq!(res.unwrap_err(), "always");
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
