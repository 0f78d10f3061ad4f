//! HTTP client for the telemetry batch API
//!
//! Two endpoints, both whole-batch: a 2xx response means every record in the
//! request was accepted, anything else means none were.
//!
//! | Endpoint | Body | Limit |
//! |----------|------|-------|
//! | `POST {base}/location-data/batch` | `{"locations": [...]}` | 1000 |
//! | `POST {base}/location-events/batch` | `{"events": [...]}` | 500 |
//!
//! Every record carries its `client_id` so the server can drop a batch it
//! already stored when an acknowledgement was lost.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::types::{DeviceInfo, StoredEvent, StoredPosition};

/// Server acknowledgement for an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAck {
    /// Records the request carried
    pub accepted: usize,
    /// Free-form server message, if any
    pub message: Option<String>,
}

/// The remote side of the sync protocol.
///
/// Implementations return [`Error::Network`] for failures worth retrying on a
/// later cycle, [`Error::BatchTooLarge`] when the batch exceeds the server
/// limit, and [`Error::RemoteRejected`] for everything else.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send_positions(&self, batch: &[StoredPosition]) -> Result<BatchAck>;

    async fn send_events(&self, batch: &[StoredEvent]) -> Result<BatchAck>;
}

// ============================================
// Wire format
// ============================================

#[derive(Debug, Serialize)]
struct PositionPayload<'a> {
    client_id: &'a str,
    recorded_at: String,
    latitude: f64,
    longitude: f64,
    speed: f64,
    accuracy: Option<f64>,
    altitude: Option<f64>,
    heading: Option<f64>,
    device_info: &'a DeviceInfo,
}

impl<'a> From<&'a StoredPosition> for PositionPayload<'a> {
    fn from(p: &'a StoredPosition) -> Self {
        Self {
            client_id: &p.client_id,
            recorded_at: p.sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            latitude: p.sample.latitude,
            longitude: p.sample.longitude,
            speed: p.sample.speed,
            accuracy: p.sample.accuracy,
            altitude: p.sample.altitude,
            heading: p.sample.heading,
            device_info: &p.sample.device_info,
        }
    }
}

#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    client_id: &'a str,
    event_type: &'static str,
    event_time: String,
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    max_speed: Option<f64>,
    acceleration: Option<f64>,
    impact_force: Option<f64>,
    description: &'a str,
    event_data: &'a serde_json::Value,
}

impl<'a> From<&'a StoredEvent> for EventPayload<'a> {
    fn from(e: &'a StoredEvent) -> Self {
        let event = &e.event;
        Self {
            client_id: &e.client_id,
            event_type: event.event_type.as_str(),
            event_time: event.event_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            latitude: event.latitude,
            longitude: event.longitude,
            speed: event.speed,
            max_speed: event.max_speed,
            acceleration: event.acceleration,
            impact_force: event.impact_force,
            description: &event.description,
            event_data: &event.raw_context,
        }
    }
}

#[derive(Debug, Serialize)]
struct LocationsRequest<'a> {
    locations: Vec<PositionPayload<'a>>,
}

#[derive(Debug, Serialize)]
struct EventsRequest<'a> {
    events: Vec<EventPayload<'a>>,
}

/// Body of a batch response
#[derive(Debug, Default, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// Validation error body, `{"message": "...", "errors": {"field": ["..."]}}`
#[derive(Debug, Default, Deserialize)]
struct ValidationResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: std::collections::HashMap<String, Vec<String>>,
}

// ============================================
// Client
// ============================================

/// HTTP implementation of [`RemoteApi`]
pub struct HttpRemoteApi {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteApi {
    /// Create a new client from configuration
    ///
    /// Returns an error if `base_url` is missing or a header value is invalid.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("remote.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let Some(token) = &config.api_token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_token: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_batch<T: Serialize + ?Sized>(
        &self,
        path: &str,
        batch_key: &str,
        size: usize,
        body: &T,
    ) -> Result<BatchAck> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        tracing::debug!(url = %url, status = %status, size, "Batch response");

        interpret_response(status, &text, batch_key, size)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn send_positions(&self, batch: &[StoredPosition]) -> Result<BatchAck> {
        let body = LocationsRequest {
            locations: batch.iter().map(PositionPayload::from).collect(),
        };
        self.post_batch("/location-data/batch", "locations", batch.len(), &body)
            .await
    }

    async fn send_events(&self, batch: &[StoredEvent]) -> Result<BatchAck> {
        let body = EventsRequest {
            events: batch.iter().map(EventPayload::from).collect(),
        };
        self.post_batch("/location-events/batch", "events", batch.len(), &body)
            .await
    }
}

/// Map an HTTP status and body onto the sync error model.
fn interpret_response(
    status: StatusCode,
    text: &str,
    batch_key: &str,
    size: usize,
) -> Result<BatchAck> {
    if status.is_success() {
        // Non-JSON 2xx bodies still count as acceptance
        let body: BatchResponse = serde_json::from_str(text).unwrap_or_default();
        if body.success == Some(false) {
            return Err(Error::RemoteRejected {
                status: status.as_u16(),
                message: body
                    .message
                    .unwrap_or_else(|| "server reported failure".to_string()),
            });
        }
        return Ok(BatchAck {
            accepted: size,
            message: body.message,
        });
    }

    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(Error::BatchTooLarge { size });
    }

    if status == StatusCode::UNPROCESSABLE_ENTITY {
        let body: ValidationResponse = serde_json::from_str(text).unwrap_or_default();
        // An error on the batch key itself (not `locations.3.latitude`) is the size rule
        if body.errors.contains_key(batch_key) {
            return Err(Error::BatchTooLarge { size });
        }
        return Err(Error::RemoteRejected {
            status: status.as_u16(),
            message: body.message.unwrap_or_else(|| text.to_string()),
        });
    }

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(Error::Network(format!("API error ({}): {}", status, text)));
    }

    Err(Error::RemoteRejected {
        status: status.as_u16(),
        message: if text.is_empty() {
            status.to_string()
        } else {
            text.to_string()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BehaviorEvent, EventType, PositionSample};
    use chrono::{TimeZone, Utc};

    fn stored_position() -> StoredPosition {
        let ts = Utc.with_ymd_and_hms(2025, 9, 29, 10, 0, 0).unwrap();
        let mut sample = PositionSample::new(ts, 40.5, -3.5, 88.0);
        sample.accuracy = Some(4.0);
        sample
            .device_info
            .insert("platform".to_string(), serde_json::json!("linux"));
        StoredPosition {
            id: 1,
            client_id: "6f1c2d4e-0000-4000-8000-000000000001".to_string(),
            sample,
            synced: false,
            created_at: ts,
        }
    }

    fn stored_event() -> StoredEvent {
        let ts = Utc.with_ymd_and_hms(2025, 9, 29, 10, 0, 2).unwrap();
        StoredEvent {
            id: 7,
            client_id: "6f1c2d4e-0000-4000-8000-000000000007".to_string(),
            event: BehaviorEvent {
                event_type: EventType::HarshBraking,
                event_time: ts,
                latitude: 40.5,
                longitude: -3.5,
                speed: Some(60.0),
                max_speed: None,
                acceleration: Some(8.33),
                impact_force: None,
                description: "harsh braking: 8.33 m/s²".to_string(),
                raw_context: serde_json::json!({"previous_speed": 90.0}),
                notified: false,
                synced: false,
            },
            created_at: ts,
        }
    }

    #[test]
    fn test_position_wire_format() {
        let position = stored_position();
        let body = LocationsRequest {
            locations: vec![PositionPayload::from(&position)],
        };
        let json = serde_json::to_value(&body).unwrap();
        let record = &json["locations"][0];

        assert_eq!(record["client_id"], position.client_id.as_str());
        assert_eq!(record["recorded_at"], "2025-09-29T10:00:00.000Z");
        assert_eq!(record["speed"], 88.0);
        assert_eq!(record["accuracy"], 4.0);
        assert!(record["altitude"].is_null());
        assert_eq!(record["device_info"]["platform"], "linux");
    }

    #[test]
    fn test_event_wire_format() {
        let event = stored_event();
        let body = EventsRequest {
            events: vec![EventPayload::from(&event)],
        };
        let json = serde_json::to_value(&body).unwrap();
        let record = &json["events"][0];

        assert_eq!(record["event_type"], "harsh_braking");
        assert_eq!(record["event_time"], "2025-09-29T10:00:02.000Z");
        assert_eq!(record["event_data"]["previous_speed"], 90.0);
        assert!(record.get("raw_context").is_none());
        assert!(record.get("notified").is_none());
    }

    #[test]
    fn test_success_response() {
        let ack = interpret_response(
            StatusCode::CREATED,
            r#"{"success":true,"message":"3 saved"}"#,
            "locations",
            3,
        )
        .unwrap();
        assert_eq!(ack.accepted, 3);
        assert_eq!(ack.message.as_deref(), Some("3 saved"));

        // Empty body is still acceptance
        assert!(interpret_response(StatusCode::OK, "", "locations", 3).is_ok());
    }

    #[test]
    fn test_success_false_is_rejection() {
        let err = interpret_response(
            StatusCode::OK,
            r#"{"success":false,"message":"nope"}"#,
            "events",
            2,
        )
        .unwrap_err();
        assert!(matches!(err, Error::RemoteRejected { status: 200, .. }));
    }

    #[test]
    fn test_size_limit_responses() {
        let err = interpret_response(StatusCode::PAYLOAD_TOO_LARGE, "", "locations", 1000)
            .unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { size: 1000 }));

        let body = r#"{"message":"too many","errors":{"events":["The events field must not have more than 500 items."]}}"#;
        let err = interpret_response(StatusCode::UNPROCESSABLE_ENTITY, body, "events", 600)
            .unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { size: 600 }));

        let body = r#"{"message":"bad record","errors":{"events.0.latitude":["out of range"]}}"#;
        let err = interpret_response(StatusCode::UNPROCESSABLE_ENTITY, body, "events", 10)
            .unwrap_err();
        assert!(matches!(err, Error::RemoteRejected { status: 422, .. }));
    }

    #[test]
    fn test_transient_and_permanent_failures() {
        let err = interpret_response(StatusCode::BAD_GATEWAY, "upstream", "events", 1).unwrap_err();
        assert!(err.is_transient());

        let err = interpret_response(StatusCode::UNAUTHORIZED, "", "events", 1).unwrap_err();
        assert!(matches!(err, Error::RemoteRejected { status: 401, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_client_requires_base_url() {
        let result = HttpRemoteApi::new(&RemoteConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));

        let config = RemoteConfig {
            base_url: Some("https://fleet.example.com/api/".to_string()),
            api_token: Some("token".to_string()),
            ..Default::default()
        };
        let client = HttpRemoteApi::new(&config).unwrap();
        assert_eq!(client.base_url(), "https://fleet.example.com/api");
    }

    // ============================================
    // Over HTTP
    // ============================================

    fn client_for(server: &mockito::ServerGuard) -> HttpRemoteApi {
        HttpRemoteApi::new(&RemoteConfig {
            base_url: Some(format!("{}/api", server.url())),
            api_token: Some("test-token".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_positions_posts_batch() {
        let mut server = mockito::Server::new_async().await;
        let position = stored_position();
        let mock = server
            .mock("POST", "/api/location-data/batch")
            .match_header("authorization", "Bearer test-token")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "locations": [{
                    "client_id": position.client_id,
                    "recorded_at": "2025-09-29T10:00:00.000Z",
                    "speed": 88.0,
                    "device_info": {"platform": "linux"}
                }]
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"message":"1 location saved"}"#)
            .expect(1)
            .create_async()
            .await;

        let ack = client_for(&server)
            .send_positions(std::slice::from_ref(&position))
            .await
            .unwrap();

        assert_eq!(ack.accepted, 1);
        assert_eq!(ack.message.as_deref(), Some("1 location saved"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_events_posts_event_data() {
        let mut server = mockito::Server::new_async().await;
        let event = stored_event();
        let mock = server
            .mock("POST", "/api/location-events/batch")
            .match_header("authorization", "Bearer test-token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "events": [{
                    "client_id": event.client_id,
                    "event_type": "harsh_braking",
                    "event_data": {"previous_speed": 90.0}
                }]
            })))
            .with_status(201)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let ack = client_for(&server)
            .send_events(std::slice::from_ref(&event))
            .await
            .unwrap();

        assert_eq!(ack.accepted, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_size_limit_responses() {
        let mut server = mockito::Server::new_async().await;
        let client = client_for(&server);

        let too_large = server
            .mock("POST", "/api/location-data/batch")
            .with_status(413)
            .create_async()
            .await;
        let err = client.send_positions(&[stored_position()]).await.unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { size: 1 }));
        too_large.assert_async().await;

        let limit = server
            .mock("POST", "/api/location-events/batch")
            .with_status(422)
            .with_body(
                r#"{"message":"too many","errors":{"events":["The events field must not have more than 500 items."]}}"#,
            )
            .create_async()
            .await;
        let err = client.send_events(&[stored_event()]).await.unwrap_err();
        assert!(matches!(err, Error::BatchTooLarge { size: 1 }));
        limit.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_failures_map_to_sync_errors() {
        let mut server = mockito::Server::new_async().await;
        let client = client_for(&server);

        let unavailable = server
            .mock("POST", "/api/location-data/batch")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;
        let err = client.send_positions(&[stored_position()]).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());
        unavailable.assert_async().await;
        unavailable.remove_async().await;

        let refused = server
            .mock("POST", "/api/location-events/batch")
            .with_status(200)
            .with_body(r#"{"success":false,"message":"device not registered"}"#)
            .create_async()
            .await;
        let err = client.send_events(&[stored_event()]).await.unwrap_err();
        match err {
            Error::RemoteRejected { status, message } => {
                assert_eq!(status, 200);
                assert_eq!(message, "device not registered");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        refused.assert_async().await;

        let invalid = server
            .mock("POST", "/api/location-data/batch")
            .with_status(422)
            .with_body(r#"{"message":"bad record","errors":{"locations.0.latitude":["out of range"]}}"#)
            .create_async()
            .await;
        let err = client.send_positions(&[stored_position()]).await.unwrap_err();
        assert!(matches!(err, Error::RemoteRejected { status: 422, .. }));
        assert!(!err.is_transient());
        invalid.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        // Bound then dropped, so nothing is listening
        let url = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };
        let client = HttpRemoteApi::new(&RemoteConfig {
            base_url: Some(url),
            timeout_secs: 2,
            ..Default::default()
        })
        .unwrap();

        let err = client.send_positions(&[stored_position()]).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
