// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Valid temperature range in degrees Celsius
pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 50.0);
/// Valid relative humidity range in percent
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
/// Valid CO2 concentration range in ppm
pub const CO2_RANGE: (f64, f64) = (300.0, 2000.0);

/// One environmental sample as it travels over the messaging channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    /// Capture time at the station, carried on the wire as `timestamp`
    #[serde(rename = "timestamp", deserialize_with = "deserialize_captured_at")]
    pub captured_at: DateTime<Utc>,
}

/// Durable form of a reading, owned by the storage gateway once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    /// Unix seconds at persistence time (server receive time)
    #[serde(rename = "timestamp")]
    pub received_at: i64,
    /// Serialized [`SensorReading`], kept opaque by the store
    #[serde(rename = "data")]
    pub payload: String,
}

/// A stored record with its payload already decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub id: Uuid,
    #[serde(rename = "timestamp")]
    pub received_at: i64,
    pub data: SensorReading,
}

/// Response message for the query interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub records: Vec<DecodedRecord>,
}

impl QueryResponse {
    pub fn success(records: Vec<DecodedRecord>) -> Self {
        let message = if records.is_empty() {
            "No data found".to_string()
        } else {
            format!("{} record(s)", records.len())
        };
        Self {
            success: true,
            message,
            records,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            message,
            records: Vec::new(),
        }
    }
}

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Accept RFC 3339 timestamps as well as offset-less ISO 8601 ones,
/// which older stations emit in local-naive form. Naive values are taken as UTC.
fn deserialize_captured_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_naive_timestamp_is_utc() {
        let json = r#"{"temperature":1.5,"humidity":40.0,"co2":415.25,"timestamp":"2024-03-01T12:30:45.123456"}"#;
        let reading: SensorReading = serde_json::from_str(json).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(123456);
        assert_eq!(reading.captured_at, expected);
    }

    #[test]
    fn test_stored_record_field_names() {
        let record = StoredRecord {
            id: Uuid::nil(),
            received_at: 1_700_000_000,
            payload: "{}".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["data"], "{}");
        assert!(value.get("id").is_some());
    }

    #[test]
    fn test_query_response_messages() {
        let empty = QueryResponse::success(vec![]);
        assert!(empty.success);
        assert_eq!(empty.message, "No data found");

        let failed = QueryResponse::error("boom".to_string());
        assert!(!failed.success);
        assert!(failed.records.is_empty());
    }
}
