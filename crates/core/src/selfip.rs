use std::net::IpAddr;
use thiserror::Error;

// Endpoints that answer a plain GET with the caller's public address.
const URLS: &[&str] = &[
  "https://checkip.amazonaws.com",
  "http://ip-api.com/line/?fields=query",
  "https://api.ipify.org",
  "https://icanhazip.com",
  "https://ipinfo.io/ip",
  "https://ipecho.net/plain",
  "https://myexternalip.com/raw",
];

#[derive(Debug, Error)]
pub enum SelfIpError {
  #[error("all attempts failed: {0}")]
  AllFailed(String),
}

/// Probe the list of public "what's my ip" endpoints sequentially and return
/// the first 200 response whose body parses as an address.
pub async fn get(http: &reqwest::Client) -> Result<IpAddr, SelfIpError> {
  let mut failures = Vec::with_capacity(URLS.len());

  for url in URLS {
    match get_from(http, url).await {
      Ok(ip) => return Ok(ip),
      Err(err) => failures.push(format!("{url}: {err}")),
    }
  }

  return Err(SelfIpError::AllFailed(failures.join("; ")));
}

async fn get_from(http: &reqwest::Client, url: &str) -> Result<IpAddr, String> {
  let response = http
    .get(url)
    .send()
    .await
    .map_err(|err| format!("get: {err}"))?;

  let status = response.status();
  if status != reqwest::StatusCode::OK {
    return Err(format!("status: {status}"));
  }

  let body = response
    .text()
    .await
    .map_err(|err| format!("read: {err}"))?;

  return body
    .trim()
    .parse::<IpAddr>()
    .map_err(|_| format!("invalid response: {:?}", body.trim()));
}
