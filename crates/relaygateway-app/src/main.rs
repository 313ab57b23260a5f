use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relaygateway::ProxyType;
use relaygateway::creds::{CredService, basic_auth_header, login};
use relaygateway::endpoint::get_endpoint;
use relaygateway::proxy::handler::ProxyHandler;
use relaygateway::registrar::fallback::FALLBACK_CONFIG_URL;
use relaygateway::registrar::txn::TransactionRunner;
use relaygateway::registrar::{ApiClient, RegistrarConfig, TunnelParams, tunnels, vpn_countries};
use relaygateway::resolver::FanResolver;
use relaygateway::retry::retry;
use relaygateway::transport::dialer::ProxyDialer;
use relaygateway::transport::tls::{TlsClient, load_roots};
use relaygateway::transport::{Dialer, DirectDialer};
use relaygateway::version::{
	DEFAULT_PROD_VERSION, EXT_ID, chrome_version, extension_version, user_agent,
};
use tracing::{error, info};
use url::Url;

// Exit codes kept stable for scripting around the binary.
const EXIT_ARGS: u8 = 2;
const EXIT_DATA: u8 = 3;
const EXIT_CREDS: u8 = 4;
const EXIT_ENDPOINT: u8 = 5;
const EXIT_RESOLVER: u8 = 6;
const EXIT_OUTBOUND_PROXY: u8 = 7;
const EXIT_VERSION: u8 = 8;
const EXIT_CA_FILE: u8 = 15;

fn parse_duration(s: &str) -> Result<Duration, String> {
	duration_str::parse(s).map_err(|e| e.to_string())
}

fn parse_proxy_type(s: &str) -> Result<ProxyType, String> {
	s.parse()
}

#[derive(Parser, Debug)]
#[command(about = "Local HTTP proxy forwarding traffic through rotating relay tunnels")]
#[command(disable_version_flag = true)]
struct Args {
	/// Desired proxy location (two-letter country code)
	#[arg(long, default_value = "us")]
	country: String,

	/// Relay pool to request: direct, lum, peer, pool or virt
	#[arg(long = "proxy-type", default_value = "direct", value_parser = parse_proxy_type)]
	proxy_type: ProxyType,

	/// Amount of proxies in the retrieved list
	#[arg(long, default_value_t = 3)]
	limit: u32,

	/// HTTP proxy listen address
	#[arg(long = "bind-address", default_value = "127.0.0.1:8080")]
	bind_address: String,

	/// Accept SOCKS5 instead of HTTP on the bind address
	#[arg(long = "socks-mode", default_value_t = false)]
	socks_mode: bool,

	/// Logging verbosity (10 - debug, 20 - info, 30 - warning, 40 - error)
	#[arg(long, default_value_t = 20)]
	verbosity: i32,

	/// Timeout for network operations
	#[arg(long, default_value = "35s", value_parser = parse_duration)]
	timeout: Duration,

	/// Rotate user ID once per given period
	#[arg(long, default_value = "48h", value_parser = parse_duration)]
	rotate: Duration,

	/// Initial tunnel list retry delay
	#[arg(long = "backoff-initial", default_value = "3s", value_parser = parse_duration)]
	backoff_initial: Duration,

	/// Maximum overall time for one tunnel list acquisition
	#[arg(long = "backoff-deadline", default_value = "5m", value_parser = parse_duration)]
	backoff_deadline: Duration,

	/// Startup discovery/bootstrap attempts, 0 means unlimited
	#[arg(long = "init-retries", default_value_t = 0)]
	init_retries: u32,

	/// Delay between startup attempts
	#[arg(long = "init-retry-interval", default_value = "5s", value_parser = parse_duration)]
	init_retry_interval: Duration,

	/// DNS upstream URL for the rescue resolver, repeatable
	/// (dns://, tcp://, https://, tls:// schemes)
	#[arg(long = "resolver")]
	resolver: Vec<String>,

	/// Extension version to report, skips discovery
	#[arg(long = "ext-ver")]
	ext_ver: Option<String>,

	/// Outbound proxy URL for all upstream connections
	#[arg(long = "proxy")]
	proxy: Option<String>,

	/// CA certificate bundle verifying relays, system roots when absent
	#[arg(long)]
	cafile: Option<std::path::PathBuf>,

	/// Omit SNI from relay TLS handshakes
	#[arg(long = "hide-sni", default_value_t = true, action = clap::ArgAction::Set)]
	hide_sni: bool,

	/// Browser User-Agent to present, skips Chrome version discovery
	#[arg(long = "user-agent")]
	user_agent: Option<String>,

	/// List available countries and exit
	#[arg(long = "list-countries", default_value_t = false)]
	list_countries: bool,

	/// Output proxy list and exit
	#[arg(long = "list-proxies", default_value_t = false)]
	list_proxies: bool,

	/// Print version and exit
	#[arg(long, default_value_t = false)]
	version: bool,
}

fn setup_logging(verbosity: i32) {
	let level = match verbosity {
		v if v <= 10 => tracing::Level::DEBUG,
		v if v <= 20 => tracing::Level::INFO,
		v if v <= 30 => tracing::Level::WARN,
		_ => tracing::Level::ERROR,
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();
}

fn main() -> ExitCode {
	let args = Args::parse();
	if args.version {
		println!("{}", env!("CARGO_PKG_VERSION"));
		return ExitCode::SUCCESS;
	}
	setup_logging(args.verbosity);

	if args.country.is_empty() {
		error!("country can't be an empty string");
		return ExitCode::from(EXIT_ARGS);
	}
	if args.list_countries && args.list_proxies {
		error!("list-countries and list-proxies flags are mutually exclusive");
		return ExitCode::from(EXIT_ARGS);
	}
	if args.socks_mode {
		error!("socks-mode is not supported by this build");
		return ExitCode::from(EXIT_ARGS);
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("tokio runtime must build")
		.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
	let roots = match load_roots(args.cafile.as_deref()) {
		Ok(roots) => roots,
		Err(e) => {
			error!(error = %e, "cannot load CA certificates");
			return ExitCode::from(EXIT_CA_FILE);
		},
	};

	let direct: Arc<dyn Dialer> = Arc::new(DirectDialer {
		timeout: args.timeout,
	});
	let base: Arc<dyn Dialer> = match &args.proxy {
		None => direct,
		Some(raw) => match outbound_proxy_dialer(raw, direct.clone(), roots.clone()) {
			Ok(dialer) => dialer,
			Err(e) => {
				error!(proxy = %raw, error = %e, "cannot initialize outbound proxy");
				return ExitCode::from(EXIT_OUTBOUND_PROXY);
			},
		},
	};

	// Version discovery feeds both the presented User-Agent and the extension
	// version reported to the Registrar.
	let discovery = {
		let mut builder = reqwest::Client::builder().timeout(args.timeout);
		if let Some(proxy) = &args.proxy {
			match reqwest::Proxy::all(proxy) {
				Ok(p) => builder = builder.proxy(p),
				Err(e) => {
					error!(proxy = %proxy, error = %e, "cannot initialize outbound proxy");
					return ExitCode::from(EXIT_OUTBOUND_PROXY);
				},
			}
		}
		builder.build().expect("reqwest client must build")
	};

	let chrome_ver = match (&args.user_agent, &args.ext_ver) {
		(Some(_), Some(_)) => None,
		_ => {
			match retry(
				"chrome version discovery",
				args.init_retries,
				args.init_retry_interval,
				|| chrome_version(&discovery),
			)
			.await
			{
				Ok(ver) => Some(ver),
				Err(e) => {
					error!(error = %e, "chrome version discovery failed");
					return ExitCode::from(EXIT_VERSION);
				},
			}
		},
	};
	let ua = match &args.user_agent {
		Some(ua) => ua.clone(),
		None => user_agent(chrome_ver.as_deref().expect("discovered when UA absent")),
	};
	let ext_ver = match &args.ext_ver {
		Some(v) => v.clone(),
		None => {
			let prod = chrome_ver.as_deref().unwrap_or(DEFAULT_PROD_VERSION);
			match retry(
				"extension version discovery",
				args.init_retries,
				args.init_retry_interval,
				|| extension_version(&discovery, prod, EXT_ID),
			)
			.await
			{
				Ok(v) => v,
				Err(e) => {
					error!(error = %e, "extension version discovery failed");
					return ExitCode::from(EXIT_VERSION);
				},
			}
		},
	};
	info!(user_agent = %ua, ext_ver = %ext_ver, "client identity ready");

	let resolver = match FanResolver::from_urls(&args.resolver).await {
		Ok(r) => Arc::new(r),
		Err(e) => {
			error!(error = %e, "cannot initialize resolver");
			return ExitCode::from(EXIT_RESOLVER);
		},
	};

	let registrar = Arc::new(RegistrarConfig {
		user_agent: ua,
		ext_ver,
		roots: roots.clone(),
		hide_sni: args.hide_sni,
		base: base.clone(),
		fallback_url: FALLBACK_CONFIG_URL.to_string(),
	});

	if args.list_countries {
		return list_countries(&registrar, args.timeout).await;
	}
	if args.list_proxies {
		return list_proxies(&registrar, &args).await;
	}

	let runner = Arc::new(TransactionRunner::new(registrar.clone()));
	let cred_cfg = relaygateway::Config {
		country: args.country.clone(),
		proxy_type: args.proxy_type,
		limit: args.limit,
		rotate: args.rotate,
		probe_timeout: args.timeout,
		backoff_initial: args.backoff_initial,
		backoff_deadline: args.backoff_deadline,
	};

	info!("initializing credential service");
	let started = retry(
		"credential bootstrap",
		args.init_retries,
		args.init_retry_interval,
		|| CredService::start(registrar.clone(), runner.clone(), cred_cfg.clone()),
	)
	.await;
	let (creds, tunnels) = match started {
		Ok(res) => res,
		Err(e) => {
			error!(error = %e, "credential service failed");
			return ExitCode::from(EXIT_CREDS);
		},
	};

	let endpoint = match get_endpoint(&tunnels, args.proxy_type) {
		Ok(ep) => ep,
		Err(e) => {
			error!(error = %e, "unable to determine proxy endpoint");
			return ExitCode::from(EXIT_ENDPOINT);
		},
	};
	info!(relay = %endpoint.addr(), host = %endpoint.host, "relay endpoint selected");

	let handler = match ProxyHandler::new(
		&endpoint,
		creds.auth_provider(),
		resolver,
		base,
		roots,
		args.hide_sni,
	) {
		Ok(h) => h,
		Err(e) => {
			error!(error = %e, "unable to set up relay transport");
			return ExitCode::from(EXIT_ENDPOINT);
		},
	};

	let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
		Ok(l) => l,
		Err(e) => {
			error!(bind = %args.bind_address, error = %e, "cannot bind listen address");
			return ExitCode::FAILURE;
		},
	};
	info!(bind = %args.bind_address, "proxy server ready");

	tokio::select! {
		res = handler.serve(listener) => {
			if let Err(e) = res {
				error!(error = %e, "accept loop failed");
				return ExitCode::FAILURE;
			}
		},
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
		},
	}
	// Rotation task stops with the credential service.
	drop(creds);
	ExitCode::SUCCESS
}

/// Outbound base proxy from `--proxy`. HTTP(S) CONNECT proxies only.
fn outbound_proxy_dialer(
	raw: &str,
	next: Arc<dyn Dialer>,
	roots: Arc<rustls::RootCertStore>,
) -> anyhow::Result<Arc<dyn Dialer>> {
	let url = Url::parse(raw)?;
	let tls = match url.scheme() {
		"http" => None,
		"https" => {
			let host = url.host_str().ok_or_else(|| anyhow::anyhow!("proxy url has no host"))?;
			Some(TlsClient::standard(host, roots)?)
		},
		other => anyhow::bail!("unsupported outbound proxy scheme {other:?}"),
	};
	let host = url
		.host_str()
		.ok_or_else(|| anyhow::anyhow!("proxy url has no host"))?;
	let port = url
		.port()
		.unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
	let auth = match (url.username(), url.password()) {
		("", _) => None,
		(user, pass) => {
			let header = basic_auth_header(user, pass.unwrap_or(""));
			let header: Arc<str> = header.into();
			Some(Arc::new(move || header.to_string())
				as Arc<dyn Fn() -> String + Send + Sync>)
		},
	};
	Ok(Arc::new(ProxyDialer::new(
		format!("{host}:{port}"),
		tls,
		auth,
		next,
	)))
}

async fn list_countries(registrar: &RegistrarConfig, timeout: Duration) -> ExitCode {
	let client = ApiClient::direct(registrar);
	match tokio::time::timeout(timeout, vpn_countries(&client)).await {
		Ok(Ok(countries)) => {
			for code in countries {
				println!("{code}");
			}
			ExitCode::SUCCESS
		},
		Ok(Err(e)) => {
			error!(error = %e, "country list fetch failed");
			ExitCode::from(EXIT_DATA)
		},
		Err(_) => {
			error!("country list fetch timed out");
			ExitCode::from(EXIT_DATA)
		},
	}
}

async fn list_proxies(registrar: &RegistrarConfig, args: &Args) -> ExitCode {
	let client = ApiClient::direct(registrar);
	let params = TunnelParams {
		country: &args.country,
		proxy_type: args.proxy_type,
		limit: args.limit,
		ext_ver: &registrar.ext_ver,
		backoff_initial: args.backoff_initial,
		backoff_deadline: args.backoff_deadline,
	};
	let (tunnels, user_uuid) = match tokio::time::timeout(args.timeout, tunnels(&client, &params)).await
	{
		Ok(Ok(res)) => res,
		Ok(Err(e)) => {
			error!(error = %e, "proxy list fetch failed");
			return ExitCode::from(EXIT_DATA);
		},
		Err(_) => {
			error!("proxy list fetch timed out");
			return ExitCode::from(EXIT_DATA);
		},
	};

	let login = login(&user_uuid);
	println!("Login: {login}");
	println!("Password: {}", tunnels.agent_key);
	println!(
		"Proxy-Authorization: {}",
		basic_auth_header(&login, &tunnels.agent_key)
	);
	println!();
	println!("Host,IP address,Direct port,Peer port,Vendor");
	for (host, ip) in &tunnels.ip_list {
		let http = tunnels
			.protocol
			.get(host)
			.map(|p| p.eq_ignore_ascii_case("http"))
			.unwrap_or(false);
		if !http {
			continue;
		}
		let vendor = tunnels.vendor.get(host).map(String::as_str).unwrap_or("");
		println!(
			"{host},{ip},{},{},{vendor}",
			tunnels.port.direct, tunnels.port.peer
		);
	}
	ExitCode::SUCCESS
}
