//! The single alarm definition owned by the [`AlarmStore`](crate::store::AlarmStore).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Local wall-clock time at which the alarm fires. Serialised as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(CoreError::InvalidAlarm(format!(
                "time of day out of range: {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// `None` only for out-of-range values that bypassed [`TimeOfDay::new`].
    pub fn to_naive(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidAlarm(format!("expected HH:MM, got {s:?}")))?;
        let hour = h
            .parse::<u8>()
            .map_err(|_| CoreError::InvalidAlarm(format!("bad hour in {s:?}")))?;
        let minute = m
            .parse::<u8>()
            .map_err(|_| CoreError::InvalidAlarm(format!("bad minute in {s:?}")))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// The one alarm this process schedules.
///
/// Weekdays use `0 = Monday … 6 = Sunday`, matching chrono's
/// `num_days_from_monday`. An absent or empty filter means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub time_of_day: TimeOfDay,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday_filter: Option<BTreeSet<u8>>,
    /// IANA zone in which `time_of_day` and `weekday_filter` are interpreted.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub device_name: String,
    /// Playlist / album / track URI handed to the playback client.
    #[serde(default)]
    pub playback_target: String,
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default)]
    pub fade_in: bool,
    #[serde(default)]
    pub shuffle: bool,
    /// Commit `enabled = false` after the first successful trigger.
    #[serde(default = "bool_true")]
    pub one_shot: bool,
}

impl Default for AlarmDefinition {
    fn default() -> Self {
        Self {
            time_of_day: TimeOfDay { hour: 7, minute: 0 },
            enabled: false,
            weekday_filter: None,
            timezone: default_timezone(),
            device_name: String::new(),
            playback_target: String::new(),
            volume: default_volume(),
            fade_in: false,
            shuffle: false,
            one_shot: true,
        }
    }
}

impl AlarmDefinition {
    /// Reject anything the scheduler must never see.
    ///
    /// A disabled definition only needs a well-formed time and weekday set;
    /// device and target are required once it is enabled.
    pub fn validate(&self) -> Result<()> {
        TimeOfDay::new(self.time_of_day.hour, self.time_of_day.minute)?;

        if let Some(days) = &self.weekday_filter {
            if let Some(bad) = days.iter().find(|d| **d > 6) {
                return Err(CoreError::InvalidAlarm(format!(
                    "weekday {bad} out of range (0 = Monday … 6 = Sunday)"
                )));
            }
        }

        if self.volume > 100 {
            return Err(CoreError::InvalidAlarm(format!(
                "volume {} out of range 0-100",
                self.volume
            )));
        }

        if self.enabled {
            if self.device_name.trim().is_empty() {
                return Err(CoreError::InvalidAlarm(
                    "device_name is required for an enabled alarm".into(),
                ));
            }
            if self.playback_target.trim().is_empty() {
                return Err(CoreError::InvalidAlarm(
                    "playback_target is required for an enabled alarm".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether the alarm may fire on `weekday`.
    pub fn allows_weekday(&self, weekday: Weekday) -> bool {
        match &self.weekday_filter {
            None => true,
            Some(days) if days.is_empty() => true,
            Some(days) => days.contains(&(weekday.num_days_from_monday() as u8)),
        }
    }

    /// True when `other` changes what an in-flight cycle was working towards:
    /// the calendar schedule or the device being probed.
    ///
    /// Volume, shuffle, fade-in and target changes are picked up by the
    /// pre-trigger snapshot instead.
    pub fn redefines(&self, other: &AlarmDefinition) -> bool {
        self.time_of_day != other.time_of_day
            || self.timezone != other.timezone
            || self.normalized_weekdays() != other.normalized_weekdays()
            || self.device_name != other.device_name
    }

    fn normalized_weekdays(&self) -> Option<&BTreeSet<u8>> {
        self.weekday_filter.as_ref().filter(|d| !d.is_empty())
    }
}

fn default_timezone() -> Tz {
    Tz::UTC
}

fn default_volume() -> u8 {
    50
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_alarm() -> AlarmDefinition {
        AlarmDefinition {
            enabled: true,
            device_name: "Kitchen".into(),
            playback_target: "spotify:playlist:37i9dQZF1DX0UrRvztWcAU".into(),
            ..AlarmDefinition::default()
        }
    }

    #[test]
    fn time_of_day_parses_and_displays() {
        let t: TimeOfDay = "07:05".parse().unwrap();
        assert_eq!(t, TimeOfDay { hour: 7, minute: 5 });
        assert_eq!(t.to_string(), "07:05");
    }

    #[test]
    fn time_of_day_rejects_out_of_range() {
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("07:60".parse::<TimeOfDay>().is_err());
        assert!("seven".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn definition_deserializes_from_minimal_json() {
        let def: AlarmDefinition = serde_json::from_str(
            r#"{"time_of_day":"06:45","enabled":true,"device_name":"Bedroom",
                "playback_target":"spotify:album:1","timezone":"Europe/Berlin",
                "weekday_filter":[0,1,2,3,4]}"#,
        )
        .unwrap();
        assert_eq!(def.time_of_day, TimeOfDay { hour: 6, minute: 45 });
        assert_eq!(def.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(def.volume, 50);
        assert!(def.one_shot);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn invalid_time_is_rejected_at_deserialization() {
        let res: std::result::Result<AlarmDefinition, _> =
            serde_json::from_str(r#"{"time_of_day":"25:00"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn validate_rejects_bad_weekday_and_volume() {
        let mut def = enabled_alarm();
        def.weekday_filter = Some([0, 7].into_iter().collect());
        assert!(def.validate().is_err());

        let mut def = enabled_alarm();
        def.volume = 101;
        assert!(def.validate().is_err());
    }

    #[test]
    fn enabled_alarm_requires_device_and_target() {
        let mut def = enabled_alarm();
        def.device_name = "  ".into();
        assert!(def.validate().is_err());

        // Disabled definitions may be incomplete.
        def.enabled = false;
        assert!(def.validate().is_ok());
    }

    #[test]
    fn empty_weekday_filter_means_every_day() {
        let mut def = enabled_alarm();
        def.weekday_filter = Some(BTreeSet::new());
        assert!(def.allows_weekday(Weekday::Sun));

        def.weekday_filter = Some([5, 6].into_iter().collect());
        assert!(def.allows_weekday(Weekday::Sat));
        assert!(!def.allows_weekday(Weekday::Mon));
    }

    #[test]
    fn volume_change_is_not_a_redefinition() {
        let a = enabled_alarm();
        let mut b = a.clone();
        b.volume = 80;
        assert!(!a.redefines(&b));

        b.time_of_day = TimeOfDay { hour: 6, minute: 30 };
        assert!(a.redefines(&b));
    }

    #[test]
    fn absent_and_empty_weekday_filters_are_equivalent() {
        let a = enabled_alarm();
        let mut b = a.clone();
        b.weekday_filter = Some(BTreeSet::new());
        assert!(!a.redefines(&b));
    }
}
