//! GetCapabilities CRS discovery.
//!
//! Fetches a WMS (1.1.1 / 1.3.0) or WMTS (1.0.0) capabilities document and
//! extracts the CRS identifiers a service advertises. Documents vary wildly
//! in namespace prefixes and CRS spellings, so parsing is a tolerant element
//! scan and every identifier funnels through one normalizer
//! ([`crate::grid::normalize_crs`]). Any failure falls back to an assumed
//! Web Mercator + WGS84 pair; the resolver never blocks a download.
//!
//! Results are memoized per `(service hint, url)` for the process lifetime.

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::grid::normalize_crs;

/// Wall clock for one capabilities fetch.
const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(10);

/// Which protocol's capabilities document to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTypeHint {
    Wms,
    Wmts,
}

impl FromStr for ServiceTypeHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wms" => Ok(ServiceTypeHint::Wms),
            "wmts" => Ok(ServiceTypeHint::Wmts),
            other => Err(format!("unknown service type `{}`", other)),
        }
    }
}

/// Where a CRS answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrsSource {
    Wms,
    Wmts,
    /// The document could not be fetched or parsed; defaults were assumed.
    Assumed,
}

/// CRS identifiers a service supports, normalized to `EPSG:<code>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedCrs {
    pub supported_crs: Vec<String>,
    /// Preferred pick: `EPSG:3857` when offered, else `EPSG:4326`, else the
    /// first advertised system.
    pub default: String,
    pub source: CrsSource,
}

fn cache() -> &'static DashMap<(String, String), SupportedCrs> {
    static CACHE: OnceLock<DashMap<(String, String), SupportedCrs>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(CAPABILITIES_TIMEOUT)
            .build()
            .unwrap_or_default()
    })
}

/// Fallback used whenever fetching or parsing fails.
pub fn assumed_fallback() -> SupportedCrs {
    SupportedCrs {
        supported_crs: vec!["EPSG:3857".to_string(), "EPSG:4326".to_string()],
        default: "EPSG:3857".to_string(),
        source: CrsSource::Assumed,
    }
}

/// Resolves the CRS set advertised by a capabilities endpoint.
///
/// Memoized by `(hint, url)`; the first call per key fetches, every later
/// call is served from the process-wide cache.
pub async fn get_supported_crs(url: &str, hint: Option<ServiceTypeHint>) -> SupportedCrs {
    let key = (hint_key(hint).to_string(), url.to_string());
    if let Some(cached) = cache().get(&key) {
        return cached.clone();
    }

    let resolved = fetch_and_parse(url, hint).await.unwrap_or_else(|| {
        warn!(url = url, "capabilities unavailable, assuming default CRS set");
        assumed_fallback()
    });
    cache().insert(key, resolved.clone());
    resolved
}

fn hint_key(hint: Option<ServiceTypeHint>) -> &'static str {
    match hint {
        Some(ServiceTypeHint::Wms) => "wms",
        Some(ServiceTypeHint::Wmts) => "wmts",
        None => "",
    }
}

async fn fetch_and_parse(url: &str, hint: Option<ServiceTypeHint>) -> Option<SupportedCrs> {
    let response = match client().get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = url, error = %e, "capabilities fetch failed");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(url = url, status = response.status().as_u16(), "capabilities fetch error status");
        return None;
    }
    let xml = response.text().await.ok()?;
    parse_capabilities(&xml, hint.or_else(|| detect_from_url(url)))
}

/// Guesses the protocol from the endpoint URL.
fn detect_from_url(url: &str) -> Option<ServiceTypeHint> {
    let lower = url.to_ascii_lowercase();
    if lower.contains("wmts") {
        Some(ServiceTypeHint::Wmts)
    } else if lower.contains("wms") {
        Some(ServiceTypeHint::Wms)
    } else {
        None
    }
}

/// Parses a capabilities document with the preferred parser first, falling
/// back to the other when the preferred one finds nothing.
pub(crate) fn parse_capabilities(
    xml: &str,
    preferred: Option<ServiceTypeHint>,
) -> Option<SupportedCrs> {
    let order = match preferred {
        Some(ServiceTypeHint::Wms) => [ServiceTypeHint::Wms, ServiceTypeHint::Wmts],
        Some(ServiceTypeHint::Wmts) => [ServiceTypeHint::Wmts, ServiceTypeHint::Wms],
        None => [ServiceTypeHint::Wms, ServiceTypeHint::Wmts],
    };

    for service in order {
        let (codes, source) = match service {
            ServiceTypeHint::Wms => (parse_wms_crs(xml), CrsSource::Wms),
            ServiceTypeHint::Wmts => (parse_wmts_crs(xml), CrsSource::Wmts),
        };
        if !codes.is_empty() {
            let default = pick_default(&codes);
            return Some(SupportedCrs {
                supported_crs: codes,
                default,
                source,
            });
        }
    }
    None
}

/// WMS advertises `<CRS>` (1.3.0) or `<SRS>` (1.1.1) per layer; a 1.1.1
/// `SRS` element may hold a whitespace-separated list.
fn parse_wms_crs(xml: &str) -> Vec<String> {
    let mut raw = extract_elements(xml, "CRS");
    raw.extend(extract_elements(xml, "SRS"));
    normalize_all(raw.iter().flat_map(|value| value.split_whitespace()))
}

/// WMTS advertises `<SupportedCRS>` inside each `TileMatrixSet`.
fn parse_wmts_crs(xml: &str) -> Vec<String> {
    let raw = extract_elements(xml, "SupportedCRS");
    normalize_all(raw.iter().map(|s| s.as_str()))
}

fn normalize_all<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut codes = Vec::new();
    for value in values {
        if let Some(code) = normalize_crs(value) {
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
    }
    codes
}

fn pick_default(codes: &[String]) -> String {
    for preferred in ["EPSG:3857", "EPSG:4326"] {
        if codes.iter().any(|c| c == preferred) {
            return preferred.to_string();
        }
    }
    codes[0].clone()
}

/// Collects the text content of every element with the given local name,
/// ignoring namespace prefixes. Self-closing and empty elements yield
/// nothing; attributes are skipped.
fn extract_elements(xml: &str, local_name: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        if rest.starts_with("!--") {
            // Skip the whole comment so commented-out elements don't match.
            match rest.find("-->") {
                Some(end) => {
                    rest = &rest[end + 3..];
                    continue;
                }
                None => break,
            }
        }
        if rest.starts_with('/') || rest.starts_with('!') || rest.starts_with('?') {
            continue;
        }

        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        let local = name.rsplit(':').next().unwrap_or(name);
        if !local.eq_ignore_ascii_case(local_name) {
            continue;
        }

        let Some(gt) = rest.find('>') else { break };
        if rest[..gt].ends_with('/') {
            continue;
        }
        let after = &rest[gt + 1..];
        let Some(close) = after.find('<') else { break };
        let text = after[..close].trim();
        if !text.is_empty() {
            values.push(text.to_string());
        }
        rest = &after[close..];
    }

    values
}
