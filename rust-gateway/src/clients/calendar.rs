//! Calendar provider client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ApiClient, ClientError};

/// A booked tour, as reported by the calendar provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Booking {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invitee_name: Option<String>,
    #[serde(default)]
    pub invitee_email: Option<String>,
    #[serde(default)]
    pub invitee_phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn get_booking(&self, booking_id: &str) -> Result<Booking, ClientError>;
}

/// REST calendar client authenticated with a bearer key.
#[derive(Clone)]
pub struct HttpCalendarClient {
    api: ApiClient,
}

impl HttpCalendarClient {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let authorization = api_key.map(|key| format!("Bearer {}", key));
        Ok(Self {
            api: ApiClient::new("calendar", base_url, authorization, timeout, max_attempts)?,
        })
    }
}

#[async_trait]
impl CalendarClient for HttpCalendarClient {
    async fn get_booking(&self, booking_id: &str) -> Result<Booking, ClientError> {
        let response = self
            .api
            .get(&format!("/bookings/{}", booking_id), &[])
            .await?;

        // Some providers wrap the resource in a `resource` object.
        let resource = match response.get("resource") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => response,
        };

        serde_json::from_value(resource).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_booking() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/bookings/bk_1")
                    .header("authorization", "Bearer cal-key");
                then.status(200).json_body(json!({
                    "resource": {
                        "id": "bk_1",
                        "status": "active",
                        "start_time": "2024-05-03T16:00:00Z",
                        "invitee_phone": "+525512345678",
                        "location": "Roma Norte"
                    }
                }));
            })
            .await;

        let calendar =
            HttpCalendarClient::new(&server.base_url(), Some("cal-key"), Duration::from_secs(5), 1)
                .unwrap();
        let booking = calendar.get_booking("bk_1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(booking.id, "bk_1");
        assert_eq!(booking.invitee_phone.as_deref(), Some("+525512345678"));
        assert_eq!(booking.extra["location"], "Roma Norte");
    }

    #[tokio::test]
    async fn test_booking_without_id_is_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bookings/bk_2");
                then.status(200).json_body(json!({"status": "active"}));
            })
            .await;

        let calendar =
            HttpCalendarClient::new(&server.base_url(), Some("cal-key"), Duration::from_secs(5), 1)
                .unwrap();
        let err = calendar.get_booking("bk_2").await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }
}
