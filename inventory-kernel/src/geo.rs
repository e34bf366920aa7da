/**
 * GEO RESOLVER - Géolocalisation best-effort des adresses publiques
 *
 * ROLE :
 * Maps one public IP to country / city / coordinates. Every failure is
 * reported to the caller, which turns it into `location = null`.
 *
 * IMPLEMENTATIONS :
 * - IpWhoResolver : HTTP lookup (ipwho.is JSON) + in-memory TTL cache
 * - NullGeoResolver : offline deployments, never locates anything
 */

use crate::models::Location;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation service rejected {ip}: {message}")]
    Rejected { ip: IpAddr, message: String },
}

#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// `Ok(None)` when the service has no data for the address.
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Location>, GeoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeoResolver;

#[async_trait]
impl GeoResolver for NullGeoResolver {
    async fn resolve(&self, _ip: IpAddr) -> Result<Option<Location>, GeoError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct IpWhoResponse {
    success: bool,
    message: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    region: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl IpWhoResponse {
    fn into_location(self) -> Option<Location> {
        Some(Location {
            latitude: self.latitude?,
            longitude: self.longitude?,
            country: self.country,
            country_code: self.country_code,
            region: self.region,
            city: self.city,
        })
    }
}

pub struct IpWhoResolver {
    client: reqwest::Client,
    endpoint: String,
    ttl: Duration,
    cache: Mutex<HashMap<IpAddr, (Instant, Option<Location>)>>,
}

impl IpWhoResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, ttl: Duration) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            ttl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, ip: &IpAddr) -> Option<Option<Location>> {
        let mut cache = self.cache.lock();
        match cache.get(ip) {
            Some((at, loc)) if at.elapsed() < self.ttl => Some(loc.clone()),
            Some(_) => {
                cache.remove(ip);
                None
            }
            None => None,
        }
    }

    /// Stores an answer and drops every expired entry, so the cache only
    /// holds addresses seen within the last `ttl`.
    fn remember(&self, ip: IpAddr, location: Option<Location>) {
        let mut cache = self.cache.lock();
        let ttl = self.ttl;
        cache.retain(|_, (at, _)| at.elapsed() < ttl);
        cache.insert(ip, (Instant::now(), location));
    }
}

#[async_trait]
impl GeoResolver for IpWhoResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Location>, GeoError> {
        if let Some(hit) = self.cached(&ip) {
            return Ok(hit);
        }

        let url = format!("{}/{}", self.endpoint, ip);
        let body: IpWhoResponse = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        if !body.success {
            let message = body.message.unwrap_or_else(|| "unknown error".into());
            // reserved / bogon ranges come back as success=false; not worth asking again
            self.remember(ip, None);
            return Err(GeoError::Rejected { ip, message });
        }

        let location = body.into_location();
        debug!(%ip, located = location.is_some(), "geolocation resolved");
        self.remember(ip, location.clone());
        Ok(location)
    }
}
