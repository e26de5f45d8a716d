//! # Weather Tool
//!
//! Current conditions for the configured city from Open-Meteo, normalized to
//! whole numbers and a short condition label.

use crate::config::{LocationConfig, WeatherConfig};
use crate::error::{AppResult, SessionError, ToolError};
use crate::session::events::DisplayInfo;
use crate::session::protocol::FunctionDeclaration;
use crate::tools::{ToolCallRequest, ToolHandler, ToolName};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Normalized weather shown to the user and returned to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherData {
    pub temperature: i64,
    pub condition: String,
    pub humidity: i64,
    pub wind_speed: i64,
}

/// Raw `current` block of an Open-Meteo forecast response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrentConditions {
    pub temperature_2m: f64,
    pub relative_humidity_2m: f64,
    pub wind_speed_10m: f64,
    #[serde(default)]
    pub weather_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: Option<CurrentConditions>,
}

/// WMO weather interpretation code to a short label.
pub fn describe_weather_code(code: Option<i64>) -> &'static str {
    match code {
        Some(0) => "Clear sky",
        Some(1) => "Mostly clear",
        Some(2) => "Partly cloudy",
        Some(3) => "Overcast",
        Some(45) => "Foggy",
        Some(48) => "Freezing fog",
        Some(51) => "Light drizzle",
        Some(53) => "Drizzle",
        Some(55) => "Heavy drizzle",
        Some(56) | Some(57) => "Freezing drizzle",
        Some(61) => "Light rain",
        Some(63) => "Rain",
        Some(65) => "Heavy rain",
        Some(66) | Some(67) => "Freezing rain",
        Some(71) => "Light snow",
        Some(73) => "Snow",
        Some(75) => "Heavy snow",
        Some(77) => "Snow grains",
        Some(80) => "Light showers",
        Some(81) => "Rain showers",
        Some(82) => "Heavy showers",
        Some(85) => "Light snow showers",
        Some(86) => "Snow showers",
        Some(95) => "Thunderstorms",
        Some(96) => "Storms w/ hail",
        Some(99) => "Thunder hail",
        _ => "Conditions unknown",
    }
}

/// Round half toward positive infinity (-3.5 becomes -3, 2.5 becomes 3).
pub fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

impl From<&CurrentConditions> for WeatherData {
    fn from(current: &CurrentConditions) -> Self {
        Self {
            temperature: round_half_up(current.temperature_2m),
            condition: describe_weather_code(current.weather_code).to_string(),
            humidity: round_half_up(current.relative_humidity_2m),
            wind_speed: round_half_up(current.wind_speed_10m),
        }
    }
}

/// Where current conditions come from.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self, location: &LocationConfig) -> Result<CurrentConditions, ToolError>;
}

/// Open-Meteo forecast API client.
pub struct OpenMeteoClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SessionError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn current(&self, location: &LocationConfig) -> Result<CurrentConditions, ToolError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,wind_speed_10m,weather_code".to_string(),
                ),
            ])
            .send()
            .await
            .map_err(|e| ToolError::new("Weather service unavailable").with_cause(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::new("Weather service unavailable").with_cause(format!("HTTP {}", status)));
        }

        let body: ForecastResponse = response
            .json()
            .await
            .map_err(|e| ToolError::new("Weather data missing").with_cause(e))?;

        body.current
            .ok_or_else(|| ToolError::new("Weather data missing"))
    }
}

/// `getWeather` tool.
pub struct GetWeather {
    source: Arc<dyn WeatherSource>,
    location: LocationConfig,
}

impl GetWeather {
    pub fn new(source: Arc<dyn WeatherSource>, location: LocationConfig) -> Self {
        Self { source, location }
    }
}

#[async_trait]
impl ToolHandler for GetWeather {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::with_location(
            ToolName::GetWeather.as_str(),
            &format!("Get the current weather for {}.", self.location.city),
            &format!("The city name, e.g., {}", self.location.city),
        )
    }

    async fn call(&self, request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
        if let Some(asked) = request.location() {
            if !asked.eq_ignore_ascii_case(&self.location.city) {
                debug!(asked, configured = %self.location.city, "Weather is only available for the configured city");
            }
        }

        let current = self.source.current(&self.location).await?;
        Ok(DisplayInfo::Weather(WeatherData::from(&current)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;

    struct FixedWeather(Result<CurrentConditions, ToolError>);

    #[async_trait]
    impl WeatherSource for FixedWeather {
        async fn current(&self, _location: &LocationConfig) -> Result<CurrentConditions, ToolError> {
            self.0.clone()
        }
    }

    fn request() -> ToolCallRequest {
        ToolCallRequest {
            id: "call-1".to_string(),
            name: "getWeather".to_string(),
            arguments: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_rounding_half_up() {
        assert_eq!(round_half_up(-3.4), -3);
        assert_eq!(round_half_up(-3.5), -3);
        assert_eq!(round_half_up(-3.6), -4);
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(79.6), 80);
    }

    #[test]
    fn test_weather_code_labels() {
        assert_eq!(describe_weather_code(Some(71)), "Light snow");
        assert_eq!(describe_weather_code(Some(57)), "Freezing drizzle");
        assert_eq!(describe_weather_code(Some(42)), "Conditions unknown");
        assert_eq!(describe_weather_code(None), "Conditions unknown");
    }

    #[test]
    fn test_parses_open_meteo_current_block() {
        let body = json!({
            "latitude": 43.14,
            "current": {
                "time": "2026-10-18T12:00",
                "temperature_2m": 11.8,
                "relative_humidity_2m": 64,
                "wind_speed_10m": 19.4,
                "weather_code": 3
            }
        });
        let parsed: ForecastResponse = serde_json::from_value(body).unwrap();
        let data = WeatherData::from(&parsed.current.unwrap());
        assert_eq!(data.temperature, 12);
        assert_eq!(data.condition, "Overcast");
        assert_eq!(data.humidity, 64);
        assert_eq!(data.wind_speed, 19);
    }

    #[tokio::test]
    async fn test_get_weather_normalizes_snowy_day() {
        let tool = GetWeather::new(
            Arc::new(FixedWeather(Ok(CurrentConditions {
                temperature_2m: -3.4,
                relative_humidity_2m: 80.0,
                wind_speed_10m: 12.0,
                weather_code: Some(71),
            }))),
            AppConfig::default().location,
        );

        let display = tool.call(&request()).await.unwrap();
        assert_eq!(
            display,
            DisplayInfo::Weather(WeatherData {
                temperature: -3,
                condition: "Light snow".to_string(),
                humidity: 80,
                wind_speed: 12,
            })
        );
        assert_eq!(
            display.payload(),
            json!({"temperature": -3, "condition": "Light snow", "humidity": 80, "windSpeed": 12})
        );
    }

    #[tokio::test]
    async fn test_get_weather_propagates_source_failure() {
        let tool = GetWeather::new(
            Arc::new(FixedWeather(Err(ToolError::new("Weather service unavailable").with_cause("HTTP 503")))),
            AppConfig::default().location,
        );
        let err = tool.call(&request()).await.unwrap_err();
        assert_eq!(err.message, "Weather service unavailable");
    }

    #[test]
    fn test_declaration_names_city() {
        let tool = GetWeather::new(
            Arc::new(FixedWeather(Err(ToolError::new("unused")))),
            AppConfig::default().location,
        );
        let declaration = tool.declaration();
        assert_eq!(declaration.name, "getWeather");
        assert!(declaration.description.contains("Brantford"));
    }
}
