mod cached;
mod ipapi;

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

use crate::store::StorageError;

pub use cached::CachedQuerier;
pub use ipapi::IpapiQuerier;

/// Location reported for addresses that are not globally routable.
pub const RESERVED_LOCATION: &str = "Reserved IP";

#[derive(Debug, Error)]
pub enum GeoError {
  #[error("Request error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("Response status: {0}")]
  Status(reqwest::StatusCode),
  #[error("Lookup failed: {0}")]
  Lookup(String),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
  pub ip: IpAddr,
  pub location: String,
  pub latitude: f64,
  pub longitude: f64,
}

impl GeoInfo {
  pub(crate) fn reserved(ip: IpAddr) -> Self {
    return GeoInfo {
      ip,
      location: RESERVED_LOCATION.to_string(),
      latitude: 0.0,
      longitude: 0.0,
    };
  }
}

/// One upstream geolocation source.
#[async_trait]
pub trait GeoQuerier: Send + Sync {
  async fn query(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

/// Whether `ip` is outside globally routable unicast space: private ranges,
/// loopback, link-local, multicast, CGNAT and the like.
pub fn is_reserved(ip: IpAddr) -> bool {
  return match ip {
    IpAddr::V4(v4) => {
      v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_documentation()
        || v4.is_multicast()
        || v4.is_unspecified()
        // 100.64.0.0/10, carrier-grade NAT.
        || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
    }
    IpAddr::V6(v6) => {
      v6.is_loopback()
        || v6.is_multicast()
        || v6.is_unspecified()
        // fc00::/7, unique local.
        || (v6.segments()[0] & 0xfe00) == 0xfc00
        // fe80::/10, link local.
        || (v6.segments()[0] & 0xffc0) == 0xfe80
        || v6
          .to_ipv4_mapped()
          .is_some_and(|v4| is_reserved(IpAddr::V4(v4)))
    }
  };
}
