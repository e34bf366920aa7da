use async_trait::async_trait;
use inventory_kernel::geo::{GeoError, GeoResolver};
use inventory_kernel::models::Location;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Answers from a fixed table; records every lookup.
#[derive(Default)]
pub struct StaticGeoResolver {
    table: Mutex<HashMap<IpAddr, Location>>,
    lookups: AtomicUsize,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, ip: IpAddr, location: Location) -> Self {
        self.table.lock().insert(ip, location);
        self
    }

    /// Table with `8.8.8.8` placed in Mountain View.
    pub fn with_public_dns() -> Self {
        Self::new().with(
            IpAddr::from([8, 8, 8, 8]),
            Location {
                country: Some("United States".into()),
                country_code: Some("US".into()),
                city: Some("Mountain View".into()),
                region: Some("California".into()),
                latitude: 37.386,
                longitude: -122.0838,
            },
        )
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<Location>, GeoError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.table.lock().get(&ip).cloned())
    }
}
