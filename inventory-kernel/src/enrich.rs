//! Derived state for validated devices: location, connectivity, risk.
//!
//! Status and risk are pure functions of the raw fields and `now`; they are
//! recomputed on every write and never accepted from callers.

use crate::geo::GeoResolver;
use crate::models::{DeviceRecord, DeviceStatus, Location, RiskLevel, ValidDevice};
use chrono::{DateTime, Duration, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

/// Operating systems that count as unidentified for risk scoring.
const OS_DENYLIST: &[&str] = &["unknown", "custom"];

#[derive(Debug, thiserror::Error)]
#[error("invalid network prefix '{0}'")]
pub struct InvalidPrefix(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    network: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn parse(s: &str) -> Result<Self, InvalidPrefix> {
        let err = || InvalidPrefix(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(err)?;
        let network: IpAddr = addr.trim().parse().map_err(|_| err())?;
        let len: u8 = len.trim().parse().map_err(|_| err())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(err());
        }
        Ok(Self { network, len })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.len as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.len as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn is_non_routable_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_non_routable_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}

pub struct StateEnricher {
    resolver: Arc<dyn GeoResolver>,
    overlay: Vec<IpPrefix>,
    online_threshold: Duration,
}

impl StateEnricher {
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        overlay_prefixes: &[String],
        online_threshold: Duration,
    ) -> Result<Self, InvalidPrefix> {
        let overlay = overlay_prefixes.iter().map(|p| IpPrefix::parse(p)).collect::<Result<_, _>>()?;
        Ok(Self { resolver, overlay, online_threshold })
    }

    /// Private, loopback, link-local and mesh-overlay addresses are never located.
    pub fn is_public(&self, ip: &IpAddr) -> bool {
        let reserved = match ip {
            IpAddr::V4(v4) => is_non_routable_v4(v4),
            IpAddr::V6(v6) => is_non_routable_v6(v6),
        };
        !reserved && !self.overlay.iter().any(|p| p.contains(ip))
    }

    /// Resolves the first public address only.
    pub async fn locate(&self, addresses: &[String]) -> Option<Location> {
        let ip = addresses
            .iter()
            .filter_map(|a| a.parse::<IpAddr>().ok())
            .find(|ip| self.is_public(ip))?;
        match self.resolver.resolve(ip).await {
            Ok(location) => location,
            Err(e) => {
                debug!(%ip, error = %e, "geolocation failed");
                None
            }
        }
    }

    pub fn derive_status(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DeviceStatus {
        match last_seen {
            None => DeviceStatus::Unknown,
            Some(seen) if now - seen <= self.online_threshold => DeviceStatus::Online,
            Some(_) => DeviceStatus::Offline,
        }
    }

    pub async fn enrich(&self, device: ValidDevice, now: DateTime<Utc>) -> DeviceRecord {
        let location = self.locate(&device.addresses).await;
        let status = self.derive_status(device.last_seen, now);
        let risk_level = derive_risk(&device, location.as_ref(), now);
        DeviceRecord {
            device_id: device.device_id,
            name: device.name,
            user: device.user,
            hostname: device.hostname,
            operating_system: device.operating_system,
            addresses: device.addresses,
            tags: device.tags,
            authorized: device.authorized,
            is_external: device.is_external,
            created: device.created,
            last_seen: device.last_seen,
            key_expiry: device.key_expiry,
            client_version: device.client_version,
            location,
            status,
            risk_level,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Additive risk score. Fixed policy shared with the risk reports.
pub fn risk_score(device: &ValidDevice, location: Option<&Location>, now: DateTime<Utc>) -> u32 {
    let mut score = 0;
    if device.is_external {
        score += 2;
    }
    if !device.authorized {
        score += 3;
    }
    if device.key_expiry.is_some_and(|expiry| expiry < now) {
        score += 4;
    }
    if location.is_none() {
        score += 1;
    }
    let unidentified_os = match device.operating_system.as_deref() {
        None => true,
        Some(os) => OS_DENYLIST.iter().any(|d| os.eq_ignore_ascii_case(d)),
    };
    if unidentified_os {
        score += 1;
    }
    score
}

pub fn derive_risk(device: &ValidDevice, location: Option<&Location>, now: DateTime<Utc>) -> RiskLevel {
    match risk_score(device, location, now) {
        s if s >= 4 => RiskLevel::Critical,
        3 => RiskLevel::High,
        1 | 2 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NullGeoResolver;

    fn enricher() -> StateEnricher {
        StateEnricher::new(
            Arc::new(NullGeoResolver),
            &["100.64.0.0/10".to_string(), "fd7a:115c:a1e0::/48".to_string()],
            Duration::minutes(5),
        )
        .unwrap()
    }

    fn device(now: DateTime<Utc>) -> ValidDevice {
        ValidDevice {
            device_id: "d1".into(),
            name: "d1".into(),
            user: "alice@example.com".into(),
            hostname: None,
            operating_system: Some("linux".into()),
            addresses: vec!["8.8.8.8".into()],
            tags: vec![],
            authorized: true,
            is_external: false,
            created: now - Duration::days(30),
            last_seen: Some(now - Duration::minutes(2)),
            key_expiry: None,
            client_version: None,
        }
    }

    fn located() -> Location {
        Location {
            country: Some("United States".into()),
            country_code: Some("US".into()),
            city: None,
            region: None,
            latitude: 37.7,
            longitude: -122.4,
        }
    }

    #[test]
    fn test_prefix_parse_and_contains() {
        let p = IpPrefix::parse("100.64.0.0/10").unwrap();
        assert!(p.contains(&"100.101.1.1".parse().unwrap()));
        assert!(!p.contains(&"100.128.0.1".parse().unwrap()));
        assert!(!p.contains(&"fd7a::1".parse().unwrap()));
        assert!(IpPrefix::parse("0.0.0.0/0").unwrap().contains(&"9.9.9.9".parse().unwrap()));
        assert!(IpPrefix::parse("10.0.0.0/33").is_err());
        assert!(IpPrefix::parse("10.0.0.0").is_err());
    }

    #[test]
    fn test_public_address_classification() {
        let e = enricher();
        for private in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "127.0.0.1", "169.254.3.4", "100.100.100.100", "::1", "fe80::1", "fd7a:115c:a1e0::5", "fc00::1"] {
            assert!(!e.is_public(&private.parse().unwrap()), "{private} should be excluded");
        }
        for public in ["8.8.8.8", "172.32.0.1", "2001:4860:4860::8888"] {
            assert!(e.is_public(&public.parse().unwrap()), "{public} should be public");
        }
    }

    #[tokio::test]
    async fn test_locate_without_public_address() {
        let e = enricher();
        assert!(e.locate(&["100.64.0.1".into(), "10.0.0.1".into()]).await.is_none());
        assert!(e.locate(&[]).await.is_none());
    }

    #[test]
    fn test_status_thresholds() {
        let e = enricher();
        let now = Utc::now();
        assert_eq!(e.derive_status(Some(now - Duration::minutes(2)), now), DeviceStatus::Online);
        assert_eq!(e.derive_status(Some(now - Duration::minutes(5)), now), DeviceStatus::Online);
        assert_eq!(e.derive_status(Some(now - Duration::minutes(10)), now), DeviceStatus::Offline);
        assert_eq!(e.derive_status(Some(now - Duration::days(3)), now), DeviceStatus::Offline);
        assert_eq!(e.derive_status(None, now), DeviceStatus::Unknown);
    }

    #[test]
    fn test_risk_policy_table() {
        let now = Utc::now();
        let loc = located();

        let clean = device(now);
        assert_eq!(risk_score(&clean, Some(&loc), now), 0);
        assert_eq!(derive_risk(&clean, Some(&loc), now), RiskLevel::Low);

        assert_eq!(derive_risk(&clean, None, now), RiskLevel::Medium);

        let external = ValidDevice { is_external: true, ..device(now) };
        assert_eq!(derive_risk(&external, Some(&loc), now), RiskLevel::Medium);

        let unauthorized = ValidDevice { authorized: false, ..device(now) };
        assert_eq!(derive_risk(&unauthorized, Some(&loc), now), RiskLevel::High);

        let expired = ValidDevice { key_expiry: Some(now - Duration::days(1)), ..device(now) };
        assert_eq!(derive_risk(&expired, Some(&loc), now), RiskLevel::Critical);

        let future_expiry = ValidDevice { key_expiry: Some(now + Duration::days(1)), ..device(now) };
        assert_eq!(derive_risk(&future_expiry, Some(&loc), now), RiskLevel::Low);

        let custom_os = ValidDevice { operating_system: Some("Custom".into()), ..device(now) };
        assert_eq!(risk_score(&custom_os, Some(&loc), now), 1);
        let no_os = ValidDevice { operating_system: None, ..device(now) };
        assert_eq!(risk_score(&no_os, Some(&loc), now), 1);

        let all = ValidDevice {
            is_external: true,
            authorized: false,
            key_expiry: Some(now - Duration::days(1)),
            ..device(now)
        };
        assert_eq!(risk_score(&all, Some(&loc), now), 9);
    }

    #[tokio::test]
    async fn test_derivation_is_idempotent_and_last_seen_only_flips_status() {
        let e = enricher();
        let now = Utc::now();
        let a = e.enrich(device(now), now).await;
        let b = e.enrich(device(now), now).await;
        assert_eq!(a, b);

        let stale = ValidDevice { last_seen: Some(now - Duration::minutes(10)), ..device(now) };
        let c = e.enrich(stale, now).await;
        assert_eq!(a.status, DeviceStatus::Online);
        assert_eq!(c.status, DeviceStatus::Offline);
        assert_eq!(c.risk_level, a.risk_level);
        assert_eq!(c.location, a.location);
    }
}
