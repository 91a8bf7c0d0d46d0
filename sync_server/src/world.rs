//! World state singletons and their gated mutations.
//!
//! Every setter builds a candidate, runs it through the same validator the
//! wire uses and, only if it passes, replaces the singleton and broadcasts it
//! whole. A rejected change leaves state untouched and sends nothing.

use sync_shared::{
    protocol::Payload,
    weather::{Season, Weather},
};
use tracing::{debug, info};

use crate::context::ServerContext;

#[derive(Debug, Default)]
pub struct WorldState {
    pub weather: Weather,
}

impl ServerContext {
    pub fn set_weather(&mut self, name: &str) -> bool {
        let candidate = Weather {
            weather_name: name.to_string(),
            ..self.world.weather.clone()
        };
        self.apply_weather(candidate)
    }

    pub fn set_time(&mut self, hour: u8, minute: u8) -> bool {
        let candidate = Weather {
            time_hour: hour,
            time_minute: minute,
            ..self.world.weather.clone()
        };
        self.apply_weather(candidate)
    }

    pub fn set_date(&mut self, day: u8, month: u8) -> bool {
        let candidate = Weather {
            date_day: day,
            date_month: month,
            ..self.world.weather.clone()
        };
        self.apply_weather(candidate)
    }

    pub fn set_season(&mut self, season: Season) -> bool {
        let candidate = Weather {
            season,
            ..self.world.weather.clone()
        };
        self.apply_weather(candidate)
    }

    /// Replaces the whole singleton if `candidate` validates.
    pub fn apply_weather(&mut self, candidate: Weather) -> bool {
        if !candidate.validate() {
            debug!(?candidate, "weather change rejected");
            return false;
        }
        info!(
            time = %format!("{:02}:{:02}", candidate.time_hour, candidate.time_minute),
            date = %format!("{}/{}", candidate.date_day, candidate.date_month),
            weather = %candidate.weather_name,
            season = %candidate.season,
            "weather changed"
        );
        self.world.weather = candidate;
        let snapshot = self.world.weather.clone();
        self.broadcast(&snapshot);
        true
    }
}
