//! Out-of-band gateway reachability probe.
//!
//! `GET /health` on the HTTP side of the gateway URL; when the HTTP request
//! fails outright, fall back to a plain TCP connect so a gateway without the
//! endpoint still reports as reachable.

use std::time::Duration;

use {
    serde::Serialize,
    tokio::{net::TcpStream, time::Instant},
    tracing::debug,
    url::Url,
};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub url: String,
    pub healthy: bool,
    pub method: ProbeMethod,
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// `ws://host:port/...` → `http://host:port/health` (`wss` → `https`).
pub fn health_url(gateway_url: &str) -> Result<Url> {
    let mut url = Url::parse(gateway_url)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(Error::transport(format!(
                "cannot derive a health URL from scheme {other}"
            )));
        },
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::transport("cannot rewrite gateway URL scheme"))?;
    url.set_path("/health");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub async fn probe(gateway_url: &str, timeout: Duration) -> Result<HealthReport> {
    let url = health_url(gateway_url)?;
    let started = Instant::now();

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let http_error = match client.get(url.clone()).send().await {
        Ok(response) => {
            let status = response.status();
            debug!(%url, %status, "health endpoint answered");
            return Ok(HealthReport {
                url: url.to_string(),
                healthy: status.is_success(),
                method: ProbeMethod::Http,
                status: Some(status.as_u16()),
                latency_ms: started.elapsed().as_millis() as u64,
                error: (!status.is_success()).then(|| format!("HTTP {status}")),
            });
        },
        Err(e) => e,
    };
    debug!(%url, error = %http_error, "health endpoint failed, trying tcp");

    let host = url.host_str().unwrap_or("127.0.0.1").to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await;
    let error = match tcp {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("tcp connect timed out after {}ms", timeout.as_millis())),
    };
    Ok(HealthReport {
        url: format!("tcp://{host}:{port}"),
        healthy: error.is_none(),
        method: ProbeMethod::Tcp,
        status: None,
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    })
}
