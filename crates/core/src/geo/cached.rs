use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use super::{is_reserved, GeoError, GeoInfo, GeoQuerier};
use crate::store::{IpGeo, Store};

/// How long a cached geo row stays fresh.
const CACHE_TTL: chrono::Duration = chrono::Duration::hours(24);

/// Read-through cache in front of an upstream querier, persisted in the
/// store. Reserved addresses never reach the cache or the upstream; upstream
/// failures are surfaced and never cached.
#[derive(Clone)]
pub struct CachedQuerier {
  inner: Arc<dyn GeoQuerier>,
  store: Arc<dyn Store>,
}

impl CachedQuerier {
  pub fn new(inner: Arc<dyn GeoQuerier>, store: Arc<dyn Store>) -> Self {
    return CachedQuerier { inner, store };
  }

  pub async fn query(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
    if is_reserved(ip) {
      return Ok(GeoInfo::reserved(ip));
    }

    let key = ip.to_string();
    if let Some(cached) = self.store.take_ip_geo(&key).await? {
      if Utc::now() - cached.created_at < CACHE_TTL {
        return Ok(GeoInfo {
          ip,
          location: cached.location,
          latitude: cached.latitude,
          longitude: cached.longitude,
        });
      }
    }

    let info = self.inner.query(ip).await?;

    let now = Utc::now();
    let row = IpGeo {
      ip: key,
      location: info.location.clone(),
      latitude: info.latitude,
      longitude: info.longitude,
      created_at: now,
      updated_at: now,
    };
    if let Err(err) = self.store.save_ip_geo(&row).await {
      // Serving the lookup matters more than caching it.
      warn!(ip = %row.ip, error = %err, "failed to cache geo info");
    }

    return Ok(info);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::SqliteStore;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingQuerier {
    calls: AtomicUsize,
    fail: bool,
  }

  impl CountingQuerier {
    fn new(fail: bool) -> Arc<Self> {
      return Arc::new(CountingQuerier {
        calls: AtomicUsize::new(0),
        fail,
      });
    }

    fn calls(&self) -> usize {
      return self.calls.load(Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl GeoQuerier for CountingQuerier {
    async fn query(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        return Err(GeoError::Lookup("upstream down".to_string()));
      }
      return Ok(GeoInfo {
        ip,
        location: "Testland".to_string(),
        latitude: 1.0,
        longitude: 2.0,
      });
    }
  }

  async fn store() -> Arc<dyn Store> {
    return Arc::new(SqliteStore::open_in_memory().await.unwrap());
  }

  #[tokio::test]
  async fn test_reserved_ip_short_circuits() {
    let upstream = CountingQuerier::new(false);
    let store = store().await;
    let querier = CachedQuerier::new(upstream.clone(), store.clone());

    let info = querier.query("10.0.0.1".parse().unwrap()).await.unwrap();
    assert_eq!(info.location, "Reserved IP");
    assert_eq!(info.latitude, 0.0);
    assert_eq!(upstream.calls(), 0);
    // Nothing was cached either.
    assert!(store.take_ip_geo("10.0.0.1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_hit_skips_upstream() {
    let upstream = CountingQuerier::new(false);
    let querier = CachedQuerier::new(upstream.clone(), store().await);
    let ip: IpAddr = "1.1.1.1".parse().unwrap();

    let first = querier.query(ip).await.unwrap();
    assert_eq!(first.location, "Testland");
    assert_eq!(upstream.calls(), 1);

    let second = querier.query(ip).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(upstream.calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_row_is_refreshed() {
    let upstream = CountingQuerier::new(false);
    let store = store().await;
    let querier = CachedQuerier::new(upstream.clone(), store.clone());
    let ip: IpAddr = "1.1.1.1".parse().unwrap();

    let stale = Utc::now() - chrono::Duration::hours(25);
    store
      .save_ip_geo(&IpGeo {
        ip: ip.to_string(),
        location: "Staleland".to_string(),
        latitude: 0.0,
        longitude: 0.0,
        created_at: stale,
        updated_at: stale,
      })
      .await
      .unwrap();

    let info = querier.query(ip).await.unwrap();
    assert_eq!(info.location, "Testland");
    assert_eq!(upstream.calls(), 1);

    // And the cache now carries the fresh row.
    let cached = store.take_ip_geo("1.1.1.1").await.unwrap().unwrap();
    assert_eq!(cached.location, "Testland");
    assert!(Utc::now() - cached.created_at < chrono::Duration::minutes(1));
  }

  #[tokio::test]
  async fn test_upstream_failure_not_cached() {
    let upstream = CountingQuerier::new(true);
    let store = store().await;
    let querier = CachedQuerier::new(upstream.clone(), store.clone());
    let ip: IpAddr = "1.1.1.1".parse().unwrap();

    assert!(querier.query(ip).await.is_err());
    assert!(store.take_ip_geo("1.1.1.1").await.unwrap().is_none());

    // The next call tries upstream again instead of serving a poisoned entry.
    assert!(querier.query(ip).await.is_err());
    assert_eq!(upstream.calls(), 2);
  }
}
