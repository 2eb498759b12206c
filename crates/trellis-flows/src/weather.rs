use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use trellis_core::config::WeatherConfig;
use trellis_core::error::{Result, TrellisError};

/// A day's forecast for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub date: String,
    pub max_temp: f64,
    pub min_temp: f64,
    pub precipitation_chance: f64,
    pub condition: String,
    pub location: String,
}

/// Anything that can produce a forecast for a city name.
pub trait ForecastSource: Send + Sync + 'static {
    fn forecast<'a>(&'a self, city: &'a str) -> BoxFuture<'a, Result<Forecast>>;
}

/// Human-readable condition for a WMO weather code.
pub fn weather_condition(code: i64) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Foggy",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        95 => "Thunderstorm",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Option<Vec<GeoLocation>>,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current: Current,
    hourly: Hourly,
}

#[derive(Deserialize)]
struct Current {
    weathercode: i64,
}

#[derive(Deserialize)]
struct Hourly {
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m: Vec<Option<f64>>,
}

/// First geocoding hit for `city`; an empty or missing `results` array is
/// `LocationNotFound`.
pub fn parse_location(city: &str, body: Value) -> Result<GeoLocation> {
    let response: GeocodingResponse = serde_json::from_value(body)
        .map_err(|e| TrellisError::Collaborator(format!("unexpected geocoding response: {}", e)))?;
    response
        .results
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| TrellisError::LocationNotFound(city.to_string()))
}

/// Reduce an hourly forecast to a single day summary.
pub fn build_forecast(location: String, date: String, body: Value) -> Result<Forecast> {
    let response: ForecastResponse = serde_json::from_value(body)
        .map_err(|e| TrellisError::Collaborator(format!("unexpected forecast response: {}", e)))?;

    let temps: Vec<f64> = response.hourly.temperature_2m.into_iter().flatten().collect();
    if temps.is_empty() {
        return Err(TrellisError::Collaborator(format!(
            "forecast for {} has no hourly temperatures",
            location
        )));
    }
    let max_temp = temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_temp = temps.iter().copied().fold(f64::INFINITY, f64::min);
    let precipitation_chance = response
        .hourly
        .precipitation_probability
        .into_iter()
        .flatten()
        .fold(0.0, f64::max);

    Ok(Forecast {
        date,
        max_temp,
        min_temp,
        precipitation_chance,
        condition: weather_condition(response.current.weathercode).to_string(),
        location,
    })
}

/// Open-Meteo geocoding + forecast client.
pub struct WeatherClient {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl WeatherClient {
    pub fn new(config: &WeatherConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TrellisError::Collaborator(e.to_string()))?;
        Ok(Self {
            http,
            geocoding_url: config.geocoding_url.clone(),
            forecast_url: config.forecast_url.clone(),
        })
    }

    pub fn geocoding_request_url(&self, city: &str) -> String {
        format!("{}?name={}&count=1", self.geocoding_url, urlencoding::encode(city))
    }

    pub fn forecast_request_url(&self, location: &GeoLocation) -> String {
        format!(
            "{}?latitude={}&longitude={}&current=precipitation,weathercode&timezone=auto&hourly=precipitation_probability,temperature_2m",
            self.forecast_url, location.latitude, location.longitude
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TrellisError::Collaborator(format!("request to {} failed: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TrellisError::Collaborator(format!("HTTP {} from {}", status, url)));
        }
        resp.json()
            .await
            .map_err(|e| TrellisError::Collaborator(format!("invalid JSON from {}: {}", url, e)))
    }

    pub async fn geocode(&self, city: &str) -> Result<GeoLocation> {
        let body = self.get_json(&self.geocoding_request_url(city)).await?;
        let location = parse_location(city, body)?;
        debug!(city, name = %location.name, lat = location.latitude, lon = location.longitude, "Geocoded city");
        Ok(location)
    }
}

impl ForecastSource for WeatherClient {
    fn forecast<'a>(&'a self, city: &'a str) -> BoxFuture<'a, Result<Forecast>> {
        Box::pin(async move {
            let location = self.geocode(city).await?;
            let body = self.get_json(&self.forecast_request_url(&location)).await?;
            build_forecast(location.name, chrono::Utc::now().to_rfc3339(), body)
        })
    }
}
