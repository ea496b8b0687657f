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

//! Record codec
//!
//! Readings travel as JSON objects on the wire and are stored as the same
//! JSON document in the `data` column. Decoding validates field ranges so
//! that a malformed reading is dropped at the receive boundary instead of
//! being persisted.

use bytes::Bytes;

use crate::error::CodecError;
use crate::protocol::{
    DecodedRecord, SensorReading, StoredRecord, CO2_RANGE, HUMIDITY_RANGE, TEMPERATURE_RANGE,
};

/// Encode a reading as a transport payload
pub fn encode_reading(reading: &SensorReading) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(reading)?))
}

/// Decode and validate a transport payload
pub fn decode_reading(payload: &[u8]) -> Result<SensorReading, CodecError> {
    let reading: SensorReading = serde_json::from_slice(payload)?;
    validate(&reading)?;
    Ok(reading)
}

/// Serialize a reading into the storage representation
pub fn to_storage(reading: &SensorReading) -> Result<String, CodecError> {
    Ok(serde_json::to_string(reading)?)
}

/// Parse the storage representation back into a reading
pub fn from_storage(data: &str) -> Result<SensorReading, CodecError> {
    Ok(serde_json::from_str(data)?)
}

/// Decode a stored record's payload for the query surface
pub fn decode_record(record: StoredRecord) -> Result<DecodedRecord, CodecError> {
    let data = from_storage(&record.payload)?;
    Ok(DecodedRecord {
        id: record.id,
        received_at: record.received_at,
        data,
    })
}

/// Check every field lies in its documented range
pub fn validate(reading: &SensorReading) -> Result<(), CodecError> {
    check_range("temperature", reading.temperature, TEMPERATURE_RANGE)?;
    check_range("humidity", reading.humidity, HUMIDITY_RANGE)?;
    check_range("co2", reading.co2, CO2_RANGE)?;
    Ok(())
}

fn check_range(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), CodecError> {
    // NaN fails both comparisons
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(CodecError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn reading() -> SensorReading {
        SensorReading {
            temperature: 21.37,
            humidity: 48.05,
            co2: 612.9,
            captured_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let original = reading();
        let payload = encode_reading(&original).unwrap();
        assert_eq!(decode_reading(&payload).unwrap(), original);
    }

    #[test]
    fn test_unrounded_readings_survive_both_representations() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let original = SensorReading {
                temperature: rng.gen_range(TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1),
                humidity: rng.gen_range(HUMIDITY_RANGE.0..=HUMIDITY_RANGE.1),
                co2: rng.gen_range(CO2_RANGE.0..=CO2_RANGE.1),
                captured_at: Utc
                    .timestamp_opt(rng.gen_range(0..4_000_000_000), rng.gen_range(0..1_000_000_000))
                    .unwrap(),
            };

            let payload = encode_reading(&original).unwrap();
            let decoded = decode_reading(&payload).unwrap();
            assert_eq!(decoded.temperature.to_bits(), original.temperature.to_bits());
            assert_eq!(decoded.humidity.to_bits(), original.humidity.to_bits());
            assert_eq!(decoded.co2.to_bits(), original.co2.to_bits());
            assert_eq!(decoded, original);

            let stored = from_storage(&to_storage(&original).unwrap()).unwrap();
            assert_eq!(stored, original);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let payload = encode_reading(&reading()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        for field in ["temperature", "humidity", "co2", "timestamp"] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode_reading(b"not json [1]").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let mut bad = reading();
        bad.co2 = 12.0;
        let payload = serde_json::to_vec(&bad).unwrap();
        match decode_reading(&payload).unwrap_err() {
            CodecError::OutOfRange { field, .. } => assert_eq!(field, "co2"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let mut edge = reading();
        edge.temperature = -50.0;
        edge.humidity = 100.0;
        edge.co2 = 2000.0;
        assert!(validate(&edge).is_ok());

        edge.temperature = f64::NAN;
        assert!(validate(&edge).is_err());
    }

    #[test]
    fn test_decode_record() {
        let original = reading();
        let record = StoredRecord {
            id: Uuid::new_v4(),
            received_at: 1_700_000_123,
            payload: to_storage(&original).unwrap(),
        };
        let decoded = decode_record(record.clone()).unwrap();
        assert_eq!(decoded.id, record.id);
        assert_eq!(decoded.received_at, 1_700_000_123);
        assert_eq!(decoded.data, original);
    }
}
