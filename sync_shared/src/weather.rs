//! World weather singleton.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Longest accepted weather preset name, in bytes.
pub const MAX_WEATHER_NAME_LEN: usize = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Spring,
    #[default]
    Summer,
    Autumn,
    Winter,
}

impl Season {
    pub fn to_wire(self) -> u8 {
        match self {
            Season::Spring => 0,
            Season::Summer => 1,
            Season::Autumn => 2,
            Season::Winter => 3,
        }
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Season::Spring),
            1 => Some(Season::Summer),
            2 => Some(Season::Autumn),
            3 => Some(Season::Winter),
            _ => None,
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Autumn => "autumn",
            Season::Winter => "winter",
        };
        f.write_str(name)
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spring" => Ok(Season::Spring),
            "summer" => Ok(Season::Summer),
            "autumn" | "fall" => Ok(Season::Autumn),
            "winter" => Ok(Season::Winter),
            other => Err(format!("unknown season '{other}'")),
        }
    }
}

/// Time of day, date and weather preset shared by the whole world.
///
/// Always broadcast whole, never as a partial patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weather {
    pub time_hour: u8,
    pub time_minute: u8,
    pub date_day: u8,
    pub date_month: u8,
    pub weather_name: String,
    pub season: Season,
}

impl Default for Weather {
    fn default() -> Self {
        Self {
            time_hour: 12,
            time_minute: 0,
            date_day: 1,
            date_month: 6,
            weather_name: "clear".to_string(),
            season: Season::Summer,
        }
    }
}

impl Weather {
    pub fn is_valid_time(hour: u8, minute: u8) -> bool {
        hour < 24 && minute < 60
    }

    pub fn is_valid_date(day: u8, month: u8) -> bool {
        (1..=31).contains(&day) && (1..=12).contains(&month)
    }

    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name.len() <= MAX_WEATHER_NAME_LEN
    }

    /// All range constraints at once.
    pub fn is_valid(&self) -> bool {
        Self::is_valid_time(self.time_hour, self.time_minute)
            && Self::is_valid_date(self.date_day, self.date_month)
            && Self::is_valid_name(&self.weather_name)
    }
}
