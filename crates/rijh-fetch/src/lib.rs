//! HTTP fetch utilities and the geocoding resolver for RIJH.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "rijh-fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the extraction pipeline and the network. Implementations
/// return the body text of a successful GET and a typed error otherwise.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

/// Plain single-attempt fetcher. The harvester has no retry policy: a failed
/// fetch is reported to the caller, which skips the affected unit of work.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        debug!(url = %final_url, status = status.as_u16(), "fetched page");
        Ok(resp.text().await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// External geocoding service seam.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, FetchError>;
}

/// Nominatim returns lat/lon as numeric strings.
#[derive(Debug, Clone, Deserialize)]
pub struct NominatimPlace {
    pub lat: String,
    pub lon: String,
}

pub fn first_coordinates(places: &[NominatimPlace]) -> Option<Coordinates> {
    let place = places.first()?;
    let latitude = place.lat.parse().ok()?;
    let longitude = place.lon.parse().ok()?;
    Some(Coordinates {
        latitude,
        longitude,
    })
}

#[derive(Debug)]
pub struct NominatimClient {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimClient {
    pub const DEFAULT_ENDPOINT: &'static str = "https://nominatim.openstreetmap.org/search";

    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        // Nominatim's usage policy requires an identifying user agent.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("rijh-harvester/0.1")
            .default_headers(headers)
            .build()
            .context("building nominatim client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for NominatimClient {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, FetchError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        let places: Vec<NominatimPlace> = resp.json().await?;
        Ok(first_coordinates(&places))
    }
}

/// Place-name to coordinates resolver with a run-scoped memo cache.
///
/// Negative outcomes (no result, non-200, transport failure) are cached too,
/// so a location is looked up at most once per run. Geocoding is best-effort
/// enrichment and never fails the caller.
pub struct GeocodeResolver {
    lookup: Box<dyn GeocodeLookup>,
    cache: HashMap<String, Option<Coordinates>>,
    country_suffix: String,
    call_delay: Duration,
}

impl GeocodeResolver {
    pub fn new(lookup: Box<dyn GeocodeLookup>, country_suffix: impl Into<String>) -> Self {
        Self {
            lookup,
            cache: HashMap::new(),
            country_suffix: country_suffix.into(),
            call_delay: Duration::from_secs(1),
        }
    }

    /// Override the post-lookup rate-limit pause. Tests run with zero delay.
    pub fn with_call_delay(mut self, call_delay: Duration) -> Self {
        self.call_delay = call_delay;
        self
    }

    pub async fn resolve(&mut self, location: &str) -> Option<Coordinates> {
        if location.is_empty() {
            return None;
        }
        if let Some(cached) = self.cache.get(location) {
            return *cached;
        }

        // Country qualifier narrows ambiguous city names.
        let query = format!("{location}, {}", self.country_suffix);
        let outcome = match self.lookup.lookup(&query).await {
            Ok(coords) => coords,
            Err(err) => {
                warn!(location, %err, "geocoding lookup failed");
                None
            }
        };
        // One lookup per second at most, per the upstream usage policy.
        tokio::time::sleep(self.call_delay).await;

        self.cache.insert(location.to_string(), outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedLookup {
        calls: Arc<AtomicUsize>,
        result: Result<Option<Coordinates>, ()>,
    }

    #[async_trait]
    impl GeocodeLookup for ScriptedLookup {
        async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(query.ends_with(", United Kingdom"));
            match self.result {
                Ok(coords) => Ok(coords),
                Err(()) => Err(FetchError::HttpStatus {
                    status: 503,
                    url: "https://geocode.test/search".to_string(),
                }),
            }
        }
    }

    fn resolver_with(
        result: Result<Option<Coordinates>, ()>,
    ) -> (GeocodeResolver, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = ScriptedLookup {
            calls: calls.clone(),
            result,
        };
        let resolver = GeocodeResolver::new(Box::new(lookup), "United Kingdom")
            .with_call_delay(Duration::ZERO);
        (resolver, calls)
    }

    #[tokio::test]
    async fn second_resolve_hits_the_cache() {
        let coords = Coordinates {
            latitude: 51.5074,
            longitude: -0.1278,
        };
        let (mut resolver, calls) = resolver_with(Ok(Some(coords)));

        assert_eq!(resolver.resolve("London").await, Some(coords));
        assert_eq!(resolver.resolve("London").await, Some(coords));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_outcomes_are_cached() {
        let (mut resolver, calls) = resolver_with(Ok(None));

        assert_eq!(resolver.resolve("Nowhereville").await, None);
        assert_eq!(resolver.resolve("Nowhereville").await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_failures_never_propagate_and_are_cached() {
        let (mut resolver, calls) = resolver_with(Err(()));

        assert_eq!(resolver.resolve("Bristol").await, None);
        assert_eq!(resolver.resolve("Bristol").await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_location_skips_lookup_and_cache() {
        let (mut resolver, calls) = resolver_with(Ok(None));

        assert_eq!(resolver.resolve("").await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(resolver.cache.is_empty());
    }

    #[test]
    fn nominatim_payload_parses_numeric_strings() {
        let places: Vec<NominatimPlace> =
            serde_json::from_str(r#"[{"lat": "53.4794", "lon": "-2.2453"}]"#).unwrap();
        let coords = first_coordinates(&places).unwrap();
        assert!((coords.latitude - 53.4794).abs() < f64::EPSILON);
        assert!((coords.longitude - -2.2453).abs() < f64::EPSILON);
    }

    #[test]
    fn unparseable_coordinates_count_as_no_result() {
        let places = vec![NominatimPlace {
            lat: "not-a-number".to_string(),
            lon: "0.0".to_string(),
        }];
        assert!(first_coordinates(&places).is_none());
    }
}
