// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use chrono::{DateTime, Utc};

use crate::astro_util::sun_altitude;
use crate::config::ObservatoryConfig;

/// True when the Sun is above `altitude_threshold` degrees, i.e. it is too
/// bright for the sky images to be meaningful.
pub fn is_daytime(latitude: f64, longitude: f64, timestamp: &DateTime<Utc>,
                  altitude_threshold: f64) -> bool {
    sun_altitude(latitude, longitude, timestamp) > altitude_threshold
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateDecision {
    pub sun_altitude: f64,  // Degrees.
    pub skip: bool,
}

/// Applies `is_daytime()` for the configured observatory. An observatory
/// whose location is left at (0, 0) is never gated.
pub struct DaytimeGate {
    observatory: ObservatoryConfig,
}

impl DaytimeGate {
    pub fn new(observatory: &ObservatoryConfig) -> Self {
        DaytimeGate{observatory: observatory.clone()}
    }

    pub fn check(&self, timestamp: &DateTime<Utc>) -> GateDecision {
        let obs = &self.observatory;
        let altitude = sun_altitude(obs.latitude, obs.longitude, timestamp);
        GateDecision{
            sun_altitude: altitude,
            skip: obs.location_configured() && altitude > obs.daytime_threshold,
        }
    }
}

// mod tests.
