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

// Synthetic readings for a virtual environmental station

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{SensorReading, CO2_RANGE, HUMIDITY_RANGE, TEMPERATURE_RANGE};

/// Produces the readings the publish loop sends
pub trait ReadingSource: Send {
    fn next_reading(&mut self) -> SensorReading;
}

/// Uniformly distributed readings rounded to two decimals
pub struct RandomReadingSource {
    rng: StdRng,
}

impl RandomReadingSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic source for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample(&mut self, (min, max): (f64, f64)) -> f64 {
        let value = self.rng.gen_range(min..=max);
        // Rounding can't leave the range since both bounds are whole numbers
        (value * 100.0).round() / 100.0
    }
}

impl ReadingSource for RandomReadingSource {
    fn next_reading(&mut self) -> SensorReading {
        SensorReading {
            temperature: self.sample(TEMPERATURE_RANGE),
            humidity: self.sample(HUMIDITY_RANGE),
            co2: self.sample(CO2_RANGE),
            captured_at: Utc::now(),
        }
    }
}
