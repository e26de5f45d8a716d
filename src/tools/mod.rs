//! # Tool Dispatch
//!
//! The remote agent can ask the client to run one of a fixed set of local
//! functions. This module owns that registry and guarantees that every request
//! produces exactly one result, whatever the handler does.
//!
//! ## Registered tools:
//! - `getWeather`: current conditions for the configured city
//! - `getConstructionUpdates`: upcoming road construction
//! - `getUpcomingEvents`: upcoming community events
//!
//! ## Failure policy:
//! - Unknown tool name: `{"error": "Unknown tool"}` back to the agent, nothing shown
//! - Handler error: `{"error": <message>}` back to the agent, message surfaced to the UI
//! - Handler panic: treated as a handler error with "Tool execution failed"

pub mod community;
pub mod weather;

use crate::config::AppConfig;
use crate::error::{AppResult, ToolError};
use crate::session::events::DisplayInfo;
use crate::session::protocol::FunctionDeclaration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use community::{BrantfordListings, CommunityData, GetConstructionUpdates, GetUpcomingEvents};
use weather::{GetWeather, OpenMeteoClient, WeatherSource};

/// A function invocation requested by the remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(rename = "args", alias = "arguments", default)]
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    /// The optional `location` argument, when it is a string.
    pub fn location(&self) -> Option<&str> {
        self.arguments.get("location").and_then(Value::as_str)
    }
}

/// What a tool produced: data on success, `{error}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolPayload {
    Success(Value),
    Failure { error: String },
}

impl ToolPayload {
    pub fn failure(message: impl Into<String>) -> Self {
        ToolPayload::Failure { error: message.into() }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ToolPayload::Failure { .. })
    }
}

/// The answer sent back for one [`ToolCallRequest`], echoing its id and name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub payload: ToolPayload,
}

/// Everything the session needs after a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: ToolResult,
    /// Display update to publish, present only on success
    pub display: Option<DisplayInfo>,
    /// Message to surface to the UI, present only on handler failure
    pub error: Option<String>,
}

/// Statically known tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    GetWeather,
    GetConstructionUpdates,
    GetUpcomingEvents,
}

impl ToolName {
    pub const ALL: [ToolName; 3] = [
        ToolName::GetWeather,
        ToolName::GetConstructionUpdates,
        ToolName::GetUpcomingEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::GetWeather => "getWeather",
            ToolName::GetConstructionUpdates => "getConstructionUpdates",
            ToolName::GetUpcomingEvents => "getUpcomingEvents",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL.into_iter().find(|name| name.as_str() == s).ok_or(())
    }
}

/// A locally executed tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declaration advertised to the agent in the setup message.
    fn declaration(&self) -> FunctionDeclaration;

    /// Run the tool. The returned display carries the typed payload.
    async fn call(&self, request: &ToolCallRequest) -> Result<DisplayInfo, ToolError>;
}

/// Aborts the wrapped task when dropped, so cancelling a dispatch also
/// cancels the handler it spawned.
struct AbortOnDrop(JoinHandle<Result<DisplayInfo, ToolError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Routes tool calls to their handlers.
pub struct ToolDispatcher {
    weather: Arc<dyn ToolHandler>,
    construction: Arc<dyn ToolHandler>,
    events: Arc<dyn ToolHandler>,
}

impl ToolDispatcher {
    pub fn new(
        weather: Arc<dyn ToolHandler>,
        construction: Arc<dyn ToolHandler>,
        events: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            weather,
            construction,
            events,
        }
    }

    /// Dispatcher with the given weather source and community listings.
    pub fn with_sources(
        config: &AppConfig,
        weather: Arc<dyn WeatherSource>,
        listings: Arc<dyn CommunityData>,
    ) -> Self {
        let city = config.location.city.clone();
        Self::new(
            Arc::new(GetWeather::new(weather, config.location.clone())),
            Arc::new(GetConstructionUpdates::new(listings.clone(), city.clone())),
            Arc::new(GetUpcomingEvents::new(listings, city)),
        )
    }

    /// Dispatcher backed by Open-Meteo and the built-in listings.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let weather = OpenMeteoClient::new(&config.weather)?;
        Ok(Self::with_sources(config, Arc::new(weather), Arc::new(BrantfordListings)))
    }

    fn handler(&self, name: ToolName) -> &Arc<dyn ToolHandler> {
        match name {
            ToolName::GetWeather => &self.weather,
            ToolName::GetConstructionUpdates => &self.construction,
            ToolName::GetUpcomingEvents => &self.events,
        }
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        ToolName::ALL
            .into_iter()
            .map(|name| self.handler(name).declaration())
            .collect()
    }

    /// Run one request to completion. Always yields exactly one result.
    pub async fn dispatch(&self, request: ToolCallRequest) -> ToolOutcome {
        let Ok(name) = request.name.parse::<ToolName>() else {
            warn!(tool = %request.name, call_id = %request.id, "Unknown tool requested");
            return ToolOutcome {
                result: ToolResult {
                    id: request.id,
                    name: request.name,
                    payload: ToolPayload::failure("Unknown tool"),
                },
                display: None,
                error: None,
            };
        };

        info!(tool = %name, call_id = %request.id, "Executing tool");

        let handler = Arc::clone(self.handler(name));
        let call = request.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.call(&call).await }));

        let outcome = match (&mut task.0).await {
            Ok(result) => result,
            Err(join_err) => Err(ToolError::new("Tool execution failed").with_cause(join_err)),
        };

        match outcome {
            Ok(display) => ToolOutcome {
                result: ToolResult {
                    id: request.id,
                    name: request.name,
                    payload: ToolPayload::Success(display.payload()),
                },
                display: Some(display),
                error: None,
            },
            Err(err) => {
                warn!(tool = %name, call_id = %request.id, error = %err, "Tool failed");
                ToolOutcome {
                    result: ToolResult {
                        id: request.id,
                        name: request.name,
                        payload: ToolPayload::failure(err.message.clone()),
                    },
                    display: None,
                    error: Some(err.message),
                }
            }
        }
    }
}

/// `{"location": "..."}` schema shared by every tool.
pub(crate) fn location_properties(description: &str) -> Value {
    json!({ "location": { "type": "STRING", "description": description } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::weather::WeatherData;

    struct Fixed(DisplayInfo);

    #[async_trait]
    impl ToolHandler for Fixed {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::with_location("fixed", "fixed", "city")
        }

        async fn call(&self, _request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::with_location("failing", "failing", "city")
        }

        async fn call(&self, _request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
            Err(ToolError::new("Weather service unavailable").with_cause("HTTP 502"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ToolHandler for Panicking {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::with_location("panicking", "panicking", "city")
        }

        async fn call(&self, _request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
            panic!("handler bug");
        }
    }

    fn weather() -> WeatherData {
        WeatherData {
            temperature: 4,
            condition: "Overcast".to_string(),
            humidity: 70,
            wind_speed: 9,
        }
    }

    fn dispatcher(weather_handler: Arc<dyn ToolHandler>) -> ToolDispatcher {
        ToolDispatcher::new(
            weather_handler,
            Arc::new(Fixed(DisplayInfo::Construction(Vec::new()))),
            Arc::new(Panicking),
        )
    }

    fn request(name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: "fc-1".to_string(),
            name: name.to_string(),
            arguments: Map::new(),
        }
    }

    #[test]
    fn test_request_accepts_args_and_arguments() {
        let a: ToolCallRequest =
            serde_json::from_str(r#"{"id":"1","name":"getWeather","args":{"location":"Brantford"}}"#).unwrap();
        let b: ToolCallRequest =
            serde_json::from_str(r#"{"id":"1","name":"getWeather","arguments":{"location":"Brantford"}}"#).unwrap();
        let c: ToolCallRequest = serde_json::from_str(r#"{"id":"1","name":"getWeather"}"#).unwrap();
        assert_eq!(a.location(), Some("Brantford"));
        assert_eq!(a, b);
        assert!(c.arguments.is_empty());
    }

    #[test]
    fn test_tool_names_round_trip() {
        for name in ToolName::ALL {
            assert_eq!(name.as_str().parse::<ToolName>(), Ok(name));
        }
        assert!("deleteCity".parse::<ToolName>().is_err());
    }

    #[tokio::test]
    async fn test_success_carries_payload_and_display() {
        let d = dispatcher(Arc::new(Fixed(DisplayInfo::Weather(weather()))));
        let outcome = d.dispatch(request("getWeather")).await;

        assert_eq!(outcome.result.id, "fc-1");
        assert_eq!(outcome.result.name, "getWeather");
        assert_eq!(
            serde_json::to_value(&outcome.result.payload).unwrap(),
            json!({"temperature": 4, "condition": "Overcast", "humidity": 70, "windSpeed": 9})
        );
        assert_eq!(outcome.display, Some(DisplayInfo::Weather(weather())));
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_answered_without_ui_error() {
        let d = dispatcher(Arc::new(Failing));
        let outcome = d.dispatch(request("deleteCity")).await;

        assert_eq!(outcome.result.id, "fc-1");
        assert_eq!(outcome.result.name, "deleteCity");
        assert_eq!(
            serde_json::to_value(&outcome.result.payload).unwrap(),
            json!({"error": "Unknown tool"})
        );
        assert_eq!(outcome.display, None);
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_not_raised() {
        let d = dispatcher(Arc::new(Failing));
        let outcome = d.dispatch(request("getWeather")).await;

        assert!(outcome.result.payload.is_failure());
        assert_eq!(
            serde_json::to_value(&outcome.result.payload).unwrap(),
            json!({"error": "Weather service unavailable"})
        );
        assert_eq!(outcome.error.as_deref(), Some("Weather service unavailable"));
        assert_eq!(outcome.display, None);
    }

    #[tokio::test]
    async fn test_handler_panic_still_yields_one_result() {
        let d = dispatcher(Arc::new(Failing));
        let outcome = d.dispatch(request("getUpcomingEvents")).await;
        assert_eq!(
            serde_json::to_value(&outcome.result.payload).unwrap(),
            json!({"error": "Tool execution failed"})
        );
        assert_eq!(outcome.error.as_deref(), Some("Tool execution failed"));
    }

    #[test]
    fn test_declarations_cover_registry() {
        let config = AppConfig::default();
        let d = ToolDispatcher::from_config(&config).unwrap();
        let names: Vec<String> = d.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["getWeather", "getConstructionUpdates", "getUpcomingEvents"]);
    }
}
