//! Current temperature lookup by city

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{Tool, ToolArgs, ToolDefinition, ToolError, ToolResult, required_str};

const NAME: &str = "get_weather";
const GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Geocodes a city with Nominatim and reads Open-Meteo's current temperature
pub struct Weather {
    client: Client,
    geocode_url: String,
    forecast_url: String,
}

impl Weather {
    /// Create a weather tool against the public endpoints
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new() -> crate::Result<Self> {
        Self::with_endpoints(GEOCODE_URL, FORECAST_URL)
    }

    /// Create a weather tool against custom geocoding and forecast endpoints
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn with_endpoints(geocode_url: &str, forecast_url: &str) -> crate::Result<Self> {
        // Nominatim rejects requests without an identifying user agent
        let client = Client::builder()
            .user_agent(concat!("parley-assistant/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            geocode_url: geocode_url.to_string(),
            forecast_url: forecast_url.to_string(),
        })
    }

    async fn geocode(&self, city: &str, country: &str) -> ToolResult<Option<(f64, f64)>> {
        let query = format!("{city}, {country}");
        let body: Value = self
            .client
            .get(&self.geocode_url)
            .query(&[("q", query.as_str()), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(parse_coordinates(&body))
    }

    async fn temperature(&self, latitude: f64, longitude: f64) -> ToolResult<Option<f64>> {
        let body: Value = self
            .client
            .get(&self.forecast_url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current", "temperature_2m".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(parse_temperature(&body))
    }
}

/// First search hit's coordinates; Nominatim encodes them as strings
fn parse_coordinates(body: &Value) -> Option<(f64, f64)> {
    let place = body.as_array()?.first()?;
    let coordinate = |key: &str| -> Option<f64> {
        match place.get(key)? {
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        }
    };
    Some((coordinate("lat")?, coordinate("lon")?))
}

fn parse_temperature(body: &Value) -> Option<f64> {
    body.get("current")?.get("temperature_2m")?.as_f64()
}

#[async_trait]
impl Tool for Weather {
    fn name(&self) -> &str {
        NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: NAME.to_string(),
            description: "Get the weather of a city in degrees Celsius.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "city": {
                        "type": "string",
                        "description": "The city name to get the weather for.",
                    },
                    "country": {
                        "type": "string",
                        "description": "The country code of the city.",
                    },
                },
                "required": ["city", "country"],
                "additionalProperties": false,
            }),
        }
    }

    async fn execute(&self, args: &ToolArgs) -> ToolResult<Value> {
        let city = required_str(args, "city")?;
        let country = required_str(args, "country")?;

        let Some((latitude, longitude)) = self.geocode(city, country).await? else {
            return Err(ToolError::Failed("City not found".to_string()));
        };
        tracing::debug!(city, country, latitude, longitude, "geocoded city");

        match self.temperature(latitude, longitude).await? {
            Some(temperature) => Ok(json!({ "temperature": temperature })),
            None => Err(ToolError::Failed(
                "Could not retrieve weather data".to_string(),
            )),
        }
    }
}
