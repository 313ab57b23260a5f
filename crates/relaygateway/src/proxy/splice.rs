use std::io;

use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::transport::Stream;

/// Full-duplex copy between an accepted client connection and an established
/// relay tunnel. Each direction runs to completion independently; when one
/// side finishes its writer half is shut down so the peer observes EOF.
/// Returns (bytes sent upstream, bytes received downstream).
pub async fn splice(downstream: Stream, upstream: Stream) -> io::Result<(u64, u64)> {
	let (mut rd, mut wd) = tokio::io::split(downstream);
	let (mut ru, mut wu) = tokio::io::split(upstream);

	let send = async {
		let n = ignore_benign(tokio::io::copy(&mut rd, &mut wu).await)?;
		ignore_shutdown_errors(wu.shutdown().await)?;
		Ok::<u64, io::Error>(n)
	};
	let recv = async {
		let n = ignore_benign(tokio::io::copy(&mut ru, &mut wd).await)?;
		ignore_shutdown_errors(wd.shutdown().await)?;
		Ok::<u64, io::Error>(n)
	};

	// join, not try_join: one side completing must not cancel the other mid-copy.
	let (sent, received) = tokio::join!(send, recv);
	let res = (sent?, received?);
	trace!(sent = res.0, received = res.1, "splice complete");
	Ok(res)
}

// A peer may drop the connection at any point; an abrupt close at copy time is
// a normal end of tunnel, not a reportable failure.
fn ignore_benign(res: io::Result<u64>) -> io::Result<u64> {
	use io::ErrorKind::*;
	match res {
		Err(e) if matches!(
			e.kind(),
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe
		) =>
		{
			trace!(err = %e, "io terminated ungracefully");
			Ok(0)
		},
		other => other,
	}
}

fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
	use io::ErrorKind::*;
	match res {
		Err(e) if matches!(e.kind(), NotConnected | UnexpectedEof | BrokenPipe) => Ok(()),
		other => other,
	}
}
