use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;

use super::{GeoError, GeoInfo, GeoQuerier};

const DEFAULT_ENDPOINT: &str = "http://ip-api.com";

/// Upstream querier against the ip-api.com JSON API.
pub struct IpapiQuerier {
  http: reqwest::Client,
  endpoint: String,
}

impl Default for IpapiQuerier {
  fn default() -> Self {
    return Self::new();
  }
}

impl IpapiQuerier {
  pub fn new() -> Self {
    return IpapiQuerier {
      http: reqwest::Client::new(),
      endpoint: DEFAULT_ENDPOINT.to_string(),
    };
  }

  /// Point the querier at a different endpoint, e.g. a local stand-in.
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = endpoint.into();
    return self;
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpapiResponse {
  status: String,
  #[serde(default)]
  message: String,
  #[serde(default)]
  country: String,
  #[serde(default)]
  region_name: String,
  #[serde(default)]
  city: String,
  #[serde(default)]
  district: String,
  #[serde(default)]
  lat: f64,
  #[serde(default)]
  lon: f64,
}

impl IpapiResponse {
  fn location(&self) -> String {
    return [&self.country, &self.region_name, &self.city, &self.district]
      .iter()
      .filter(|part| !part.is_empty())
      .map(|part| part.as_str())
      .collect::<Vec<_>>()
      .join(", ");
  }
}

#[async_trait]
impl GeoQuerier for IpapiQuerier {
  async fn query(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
    let url = format!(
      "{endpoint}/json/{ip}?fields=status,message,country,regionName,city,district,lat,lon",
      endpoint = self.endpoint
    );

    let response = self.http.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(GeoError::Status(status));
    }

    let body: IpapiResponse = response.json().await?;
    if body.status != "success" {
      return Err(GeoError::Lookup(format!(
        "{status}: {message}",
        status = body.status,
        message = body.message
      )));
    }

    return Ok(GeoInfo {
      ip,
      location: body.location(),
      latitude: body.lat,
      longitude: body.lon,
    });
  }
}
