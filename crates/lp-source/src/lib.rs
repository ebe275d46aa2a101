//! Source collaborator: typed clients for the Takeaway country catalog and
//! area restaurant listings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lp_core::{CountrySnapshot, DeliveryArea, GeoPoint, Kitchen, Restaurant, SubKitchen};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "lp-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff applied to whole-snapshot fetches only. A
/// failed fetch is fatal for the run, so this is the one place a retry is
/// allowed to happen.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Opaque provider of typed hierarchical records, as seen by the pipeline.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_country(&self, country_code: &str) -> Result<CountrySnapshot, SourceError>;

    async fn fetch_restaurants(
        &self,
        country_code: &str,
        area: &DeliveryArea,
    ) -> Result<Vec<Restaurant>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct TakeawayClientConfig {
    pub base_url: String,
    pub language: String,
    pub app_version: String,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for TakeawayClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://de.citymeal.com/android/android.php".to_string(),
            language: "de".to_string(),
            app_version: "10.26.0".to_string(),
            user_agent: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP implementation of [`SnapshotProvider`] against the Takeaway endpoint.
#[derive(Debug)]
pub struct TakeawayClient {
    client: reqwest::Client,
    config: TakeawayClientConfig,
}

impl TakeawayClient {
    pub fn new(config: TakeawayClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client, config })
    }

    async fn get_with_retry(
        &self,
        what: &'static str,
        params: &[(&str, String)],
    ) -> Result<String, SourceError> {
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            debug!(what, attempt, "fetching from source");
            let resp_result = self
                .client
                .get(&self.config.base_url)
                .query(params)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(what, status = status.as_u16(), attempt, "retrying source fetch");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl SnapshotProvider for TakeawayClient {
    async fn fetch_country(&self, country_code: &str) -> Result<CountrySnapshot, SourceError> {
        let params = [
            ("command", "getcountrydata".to_string()),
            ("countryCode", country_code.to_string()),
            ("language", self.config.language.clone()),
            ("appVersion", self.config.app_version.clone()),
        ];
        let body = self.get_with_retry("country snapshot", &params).await?;
        let wire: WireCountry = decode("country snapshot", &body)?;
        Ok(wire.into_domain(country_code))
    }

    async fn fetch_restaurants(
        &self,
        country_code: &str,
        area: &DeliveryArea,
    ) -> Result<Vec<Restaurant>, SourceError> {
        let params = [
            ("command", "getrestaurants".to_string()),
            ("countryCode", country_code.to_string()),
            ("postalCode", area.postal_code.clone()),
            ("latitude", area.latitude.to_string()),
            ("longitude", area.longitude.to_string()),
            ("language", self.config.language.clone()),
            ("appVersion", self.config.app_version.clone()),
        ];
        let body = self.get_with_retry("restaurant list", &params).await?;
        let wire: WireRestaurantList = decode("restaurant list", &body)?;
        Ok(wire.restaurants.into_iter().map(WireRestaurant::into_domain).collect())
    }
}

/// Reads a previously captured snapshot bundle from disk. Used for offline
/// runs and tests; the JSON carries both the country catalog and the area
/// restaurant list.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct FixtureBundle {
    country: WireCountry,
    #[serde(default)]
    restaurants: Vec<WireRestaurant>,
}

impl FixtureProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<FixtureBundle, SourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: self.path.display().to_string(),
                source,
            })?;
        decode("fixture bundle", &text)
    }
}

#[async_trait]
impl SnapshotProvider for FixtureProvider {
    async fn fetch_country(&self, country_code: &str) -> Result<CountrySnapshot, SourceError> {
        Ok(self.load().await?.country.into_domain(country_code))
    }

    async fn fetch_restaurants(
        &self,
        _country_code: &str,
        _area: &DeliveryArea,
    ) -> Result<Vec<Restaurant>, SourceError> {
        Ok(self
            .load()
            .await?
            .restaurants
            .into_iter()
            .map(WireRestaurant::into_domain)
            .collect())
    }
}

fn decode<T: DeserializeOwned>(what: &'static str, body: &str) -> Result<T, SourceError> {
    serde_json::from_str(body).map_err(|source| SourceError::Decode { what, source })
}

// Wire shapes as the source serves them; field names follow the upstream API.

#[derive(Debug, Deserialize, Serialize)]
struct WireCountry {
    #[serde(default)]
    kitchens: Vec<WireKitchen>,
}

impl WireCountry {
    fn into_domain(self, country_code: &str) -> CountrySnapshot {
        CountrySnapshot {
            country_code: country_code.to_string(),
            kitchens: self.kitchens.into_iter().map(WireKitchen::into_domain).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireKitchen {
    id: i32,
    #[serde(default)]
    descriptions: WireDescriptions,
    #[serde(rename = "imageUrl", default)]
    image_url: String,
    #[serde(rename = "subKitchens", default)]
    sub_kitchens: Vec<WireSubKitchen>,
}

impl WireKitchen {
    fn into_domain(self) -> Kitchen {
        let kitchen_id = self.id;
        Kitchen {
            id: self.id,
            description_de: self.descriptions.de,
            description_en: self.descriptions.en,
            image_url: self.image_url,
            sub_kitchens: self
                .sub_kitchens
                .into_iter()
                .map(|s| s.into_domain(kitchen_id))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireDescriptions {
    #[serde(default)]
    de: String,
    #[serde(default)]
    en: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireSubKitchen {
    id: i32,
    #[serde(default)]
    descriptions: WireDescriptions,
}

impl WireSubKitchen {
    fn into_domain(self, kitchen_id: i32) -> SubKitchen {
        SubKitchen {
            id: self.id,
            description_de: self.descriptions.de,
            description_en: self.descriptions.en,
            kitchen_id,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireRestaurantList {
    #[serde(default)]
    restaurants: Vec<WireRestaurant>,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireRestaurant {
    id: String,
    name: String,
    #[serde(rename = "logoUrl", default)]
    logo_url: Option<String>,
    address: WireAddress,
    #[serde(rename = "subKitchens", default)]
    sub_kitchens: WireSubKitchenIds,
    #[serde(rename = "deliveryMethods", default)]
    delivery_methods: WireDeliveryMethods,
    #[serde(default)]
    location: Option<WireLocation>,
}

impl WireRestaurant {
    fn into_domain(self) -> Restaurant {
        Restaurant {
            id: self.id,
            name: self.name,
            logo_url: self.logo_url,
            city: self.address.city,
            street: self.address.street,
            delivery: self.delivery_methods.delivery,
            pickup: self.delivery_methods.pickup,
            location: self.location.map(|l| GeoPoint {
                latitude: l.latitude,
                longitude: l.longitude,
            }),
            sub_kitchen_ids: self.sub_kitchens.ids,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireAddress {
    #[serde(default)]
    city: String,
    #[serde(default)]
    street: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireSubKitchenIds {
    #[serde(default)]
    ids: Vec<i32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireDeliveryMethods {
    #[serde(default)]
    delivery: bool,
    #[serde(default)]
    pickup: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireLocation {
    latitude: f64,
    longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COUNTRY_JSON: &str = r#"{
        "kitchens": [
            {
                "id": 1,
                "descriptions": { "de": "Italienisch", "en": "Italian" },
                "imageUrl": "https://img.example/italian.png",
                "subKitchens": [
                    { "id": 10, "descriptions": { "de": "Pizza", "en": "Pizza" } },
                    { "id": 11, "descriptions": { "de": "", "en": "" } }
                ]
            }
        ]
    }"#;

    const RESTAURANTS_JSON: &str = r#"{
        "restaurants": [
            {
                "id": "r1",
                "name": "Tia y Tio",
                "logoUrl": "https://img.example/tia.png",
                "address": { "city": "Regensburg", "street": "Obere Bachgasse 9" },
                "subKitchens": { "ids": [10] },
                "deliveryMethods": { "delivery": true, "pickup": false },
                "location": { "latitude": 49.0167, "longitude": 12.0954 }
            },
            {
                "id": "r2",
                "name": "No Frills",
                "address": { "city": "Regensburg", "street": "X" },
                "subKitchens": { "ids": [] }
            }
        ]
    }"#;

    fn area() -> DeliveryArea {
        DeliveryArea {
            postal_code: "93047".to_string(),
            latitude: 49.0195,
            longitude: 12.0974,
        }
    }

    #[test]
    fn country_decodes_and_fills_parent_ids() {
        let wire: WireCountry = decode("country snapshot", COUNTRY_JSON).expect("decode");
        let snapshot = wire.into_domain("DE");
        assert_eq!(snapshot.country_code, "DE");
        assert_eq!(snapshot.kitchens.len(), 1);
        let kitchen = &snapshot.kitchens[0];
        assert_eq!(kitchen.description_de, "Italienisch");
        assert_eq!(kitchen.sub_kitchens.len(), 2);
        assert!(kitchen.sub_kitchens.iter().all(|s| s.kitchen_id == 1));
        assert!(kitchen.sub_kitchens[0].has_description());
        assert!(!kitchen.sub_kitchens[1].has_description());
    }

    #[test]
    fn restaurant_decode_tolerates_missing_optionals() {
        let wire: WireRestaurantList = decode("restaurant list", RESTAURANTS_JSON).expect("decode");
        let restaurants: Vec<_> = wire.restaurants.into_iter().map(WireRestaurant::into_domain).collect();
        assert_eq!(restaurants.len(), 2);

        let r1 = &restaurants[0];
        assert_eq!(r1.id, "r1");
        assert!(r1.delivery);
        assert!(!r1.pickup);
        assert_eq!(r1.sub_kitchen_ids, vec![10]);
        assert_eq!(r1.location.map(|l| l.latitude), Some(49.0167));

        let r2 = &restaurants[1];
        assert_eq!(r2.logo_url, None);
        assert_eq!(r2.location, None);
        assert!(!r2.delivery && !r2.pickup);
        assert!(r2.sub_kitchen_ids.is_empty());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_matches_policy() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    fn test_client(base_url: String) -> TakeawayClient {
        TakeawayClient::new(TakeawayClientConfig {
            base_url,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            ..TakeawayClientConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn country_fetch_retries_transient_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "getcountrydata"))
            .respond_with(ResponseTemplate::new(200).set_body_string(COUNTRY_JSON))
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let snapshot = client.fetch_country("DE").await.expect("snapshot after retry");
        assert_eq!(snapshot.kitchens.len(), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let err = client.fetch_country("DE").await.expect_err("404 must fail");
        match err {
            SourceError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn restaurant_fetch_carries_area_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "getrestaurants"))
            .and(query_param("postalCode", "93047"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESTAURANTS_JSON))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.uri());
        let restaurants = client.fetch_restaurants("DE", &area()).await.expect("restaurants");
        assert_eq!(restaurants.len(), 2);
    }

    #[tokio::test]
    async fn fixture_provider_round_trips_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        let bundle = format!(
            r#"{{ "country": {COUNTRY_JSON}, "restaurants": {} }}"#,
            serde_json::from_str::<serde_json::Value>(RESTAURANTS_JSON).expect("json")["restaurants"]
        );
        std::fs::write(&path, bundle).expect("write fixture");

        let provider = FixtureProvider::new(&path);
        let snapshot = provider.fetch_country("DE").await.expect("country");
        assert_eq!(snapshot.kitchens[0].sub_kitchens.len(), 2);
        let restaurants = provider.fetch_restaurants("DE", &area()).await.expect("restaurants");
        assert_eq!(restaurants[0].name, "Tia y Tio");
    }
}
