use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

pub const CHROME_VERSIONS_URL: &str =
	"https://versionhistory.googleapis.com/v1/chrome/platforms/win/channels/stable/versions";
pub const EXT_UPDATE_URL: &str = "https://clients2.google.com/service/update2/crx";

/// Chrome Web Store id of the extension whose version is impersonated.
pub const EXT_ID: &str = "gkojfkhlekighikafcpjkiklfbnlmeio";
pub const DEFAULT_PROD_VERSION: &str = "113.0";

#[derive(thiserror::Error, Debug)]
pub enum VersionError {
	#[error("version discovery request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("version feed had no entries")]
	NoData,
	#[error("update check response had no version attribute")]
	NoVersionAttr,
}

#[derive(Deserialize)]
struct VersionList {
	#[serde(default)]
	versions: Vec<VersionEntry>,
}

#[derive(Deserialize)]
struct VersionEntry {
	version: String,
}

/// Latest stable Chrome version for Windows, newest first.
pub async fn chrome_version(client: &reqwest::Client) -> Result<String, VersionError> {
	let resp: VersionList = client
		.get(CHROME_VERSIONS_URL)
		.query(&[("orderBy", "version desc"), ("pageSize", "1")])
		.send()
		.await?
		.error_for_status()?
		.json()
		.await?;
	resp
		.versions
		.into_iter()
		.next()
		.map(|v| v.version)
		.ok_or(VersionError::NoData)
}

static UPDATECHECK_VERSION: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"<updatecheck[^>]*\bversion="([^"]+)""#).expect("static regex")
});

/// Extension version advertised by the Chrome Web Store update service. The
/// response is a one-element `<gupdate>` XML envelope; the single attribute
/// we need is lifted straight out of it.
pub async fn extension_version(
	client: &reqwest::Client,
	prod_version: &str,
	id: &str,
) -> Result<String, VersionError> {
	let x = format!("id={id}&uc=");
	let body = client
		.get(EXT_UPDATE_URL)
		.query(&[
			("prodversion", prod_version),
			("acceptformat", "crx2,crx3"),
			("x", x.as_str()),
		])
		.send()
		.await?
		.error_for_status()?
		.text()
		.await?;
	UPDATECHECK_VERSION
		.captures(&body)
		.and_then(|c| c.get(1))
		.map(|m| m.as_str().to_string())
		.ok_or(VersionError::NoVersionAttr)
}

/// The browser identity presented on every Registrar call, matching the
/// platform the Chrome version was discovered for.
pub fn user_agent(chrome_version: &str) -> String {
	format!(
		"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{chrome_version} Safari/537.36"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_version_attribute_from_update_response() {
		let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<gupdate xmlns="http://www.google.com/update2/response" protocol="2.0" server="prod">
	<daystart elapsed_days="6000"/>
	<app appid="gkojfkhlekighikafcpjkiklfbnlmeio" cohort="1::" status="ok">
		<updatecheck codebase="https://clients2.googleusercontent.com/crx/blobs/x.crx" status="ok" version="1.229.541"/>
	</app>
</gupdate>"#;
		let m = UPDATECHECK_VERSION.captures(body).unwrap();
		assert_eq!(m.get(1).unwrap().as_str(), "1.229.541");
	}

	#[test]
	fn user_agent_embeds_chrome_version() {
		let ua = user_agent("124.0.6367.60");
		assert!(ua.contains("Chrome/124.0.6367.60 Safari/537.36"));
		assert!(ua.starts_with("Mozilla/5.0"));
	}
}
