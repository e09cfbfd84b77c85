use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

/// One local-time window, "HH:MM" with start < end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingWindow {
    pub start: String,
    pub end: String,
}

impl WorkingWindow {
    /// Minutes since local midnight for both bounds; None when malformed.
    pub fn bounds_minutes(&self) -> Option<(u32, u32)> {
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        if start < end {
            Some((start, end))
        } else {
            None
        }
    }
}

pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h <= 23 && m <= 59 {
        Some(h * 60 + m)
    } else {
        None
    }
}

/// Weekly working-hours map keyed sun..sat. Absent day = closed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkingHours {
    pub sun: Option<Vec<WorkingWindow>>,
    pub mon: Option<Vec<WorkingWindow>>,
    pub tue: Option<Vec<WorkingWindow>>,
    pub wed: Option<Vec<WorkingWindow>>,
    pub thu: Option<Vec<WorkingWindow>>,
    pub fri: Option<Vec<WorkingWindow>>,
    pub sat: Option<Vec<WorkingWindow>>,
}

impl WorkingHours {
    pub fn windows_for(&self, day: Weekday) -> &[WorkingWindow] {
        let slot = match day {
            Weekday::Sun => &self.sun,
            Weekday::Mon => &self.mon,
            Weekday::Tue => &self.tue,
            Weekday::Wed => &self.wed,
            Weekday::Thu => &self.thu,
            Weekday::Fri => &self.fri,
            Weekday::Sat => &self.sat,
        };
        slot.as_deref().unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.sun, &self.mon, &self.tue, &self.wed, &self.thu, &self.fri, &self.sat,
        ]
        .iter()
        .all(|d| d.as_ref().map(|w| w.is_empty()).unwrap_or(true))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Business {
    pub id: String,
    pub name: String,
    pub timezone: String,
    pub working_hours: Json<WorkingHours>,
    pub default_duration_min: i32,
    pub slot_granularity_min: i32,
    pub buffer_before_min: i32,
    pub buffer_after_min: i32,
    pub lead_time_min: i32,
    pub max_days_ahead: i32,
    pub max_daily_jobs: Option<i32>,
    pub emergency_enabled: bool,
    pub emergency_sms_phone: Option<String>,
    pub emergency_call_phone: Option<String>,
    pub emergency_retry_count: i32,
    pub emergency_retry_delay_sec: i32,
    pub auto_sms_enabled: bool,
}

/// Operator-editable overlay; every field optional, wins over the business
/// row when present.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BusinessProfile {
    pub business_id: String,
    pub timezone: Option<String>,
    pub working_hours: Option<Json<WorkingHours>>,
    pub slot_duration_min: Option<i32>,
    pub buffer_min: Option<i32>,
    pub emergency_enabled: Option<bool>,
    pub emergency_phone: Option<String>,
    pub service_area: Option<Json<Value>>,
}

/// Business defaults merged with the profile overlay; everything the
/// availability engine and orchestrator read comes from here.
#[derive(Debug, Clone)]
pub struct EffectiveProfile {
    pub business_id: String,
    pub timezone: Tz,
    pub working_hours: WorkingHours,
    pub default_duration_min: i64,
    pub slot_granularity_min: i64,
    pub buffer_before_min: i64,
    pub buffer_after_min: i64,
    pub lead_time_min: i64,
    pub max_days_ahead: i64,
    pub max_daily_jobs: Option<i64>,
    pub emergency_enabled: bool,
    pub emergency_sms_phone: Option<String>,
    pub emergency_call_phone: Option<String>,
    pub emergency_retry_count: u32,
    pub emergency_retry_delay_sec: u64,
    pub auto_sms_enabled: bool,
}

impl EffectiveProfile {
    pub fn merge(business: &Business, profile: Option<&BusinessProfile>) -> anyhow::Result<Self> {
        let tz_name = profile
            .and_then(|p| p.timezone.as_deref())
            .unwrap_or(&business.timezone);
        let timezone: Tz = tz_name
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid timezone: {tz_name}"))?;

        let working_hours = profile
            .and_then(|p| p.working_hours.as_ref())
            .map(|j| j.0.clone())
            .unwrap_or_else(|| business.working_hours.0.clone());

        let buffer = profile.and_then(|p| p.buffer_min);
        let emergency_phone = profile
            .and_then(|p| p.emergency_phone.clone())
            .or_else(|| business.emergency_sms_phone.clone());

        Ok(Self {
            business_id: business.id.clone(),
            timezone,
            working_hours,
            default_duration_min: profile
                .and_then(|p| p.slot_duration_min)
                .unwrap_or(business.default_duration_min) as i64,
            slot_granularity_min: business.slot_granularity_min.max(1) as i64,
            buffer_before_min: buffer.unwrap_or(business.buffer_before_min) as i64,
            buffer_after_min: buffer.unwrap_or(business.buffer_after_min) as i64,
            lead_time_min: business.lead_time_min as i64,
            max_days_ahead: business.max_days_ahead as i64,
            max_daily_jobs: business.max_daily_jobs.map(|n| n as i64),
            emergency_enabled: profile
                .and_then(|p| p.emergency_enabled)
                .unwrap_or(business.emergency_enabled),
            emergency_sms_phone: emergency_phone,
            emergency_call_phone: business.emergency_call_phone.clone(),
            emergency_retry_count: business.emergency_retry_count.max(0) as u32,
            emergency_retry_delay_sec: business.emergency_retry_delay_sec.max(0) as u64,
            auto_sms_enabled: business.auto_sms_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: &str, end: &str) -> WorkingWindow {
        WorkingWindow {
            start: start.into(),
            end: end.into(),
        }
    }

    #[test]
    fn parses_hhmm() {
        assert_eq!(parse_hhmm("08:00"), Some(480));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("8"), None);
        assert_eq!(parse_hhmm("08:60"), None);
    }

    #[test]
    fn window_bounds_require_start_before_end() {
        assert_eq!(window("08:00", "17:00").bounds_minutes(), Some((480, 1020)));
        assert_eq!(window("17:00", "08:00").bounds_minutes(), None);
    }

    #[test]
    fn missing_day_means_closed() {
        let wh = WorkingHours {
            mon: Some(vec![window("08:00", "17:00")]),
            ..Default::default()
        };
        assert_eq!(wh.windows_for(Weekday::Mon).len(), 1);
        assert!(wh.windows_for(Weekday::Sun).is_empty());
    }

    #[test]
    fn working_hours_deserializes_sparse_map() {
        let wh: WorkingHours =
            serde_json::from_str(r#"{"mon":[{"start":"08:00","end":"17:00"}]}"#).unwrap();
        assert_eq!(wh.windows_for(Weekday::Mon)[0].start, "08:00");
        assert!(wh.windows_for(Weekday::Tue).is_empty());
    }

    fn base_business() -> Business {
        Business {
            id: "b1".into(),
            name: "Acme HVAC".into(),
            timezone: "America/Chicago".into(),
            working_hours: Json(WorkingHours {
                mon: Some(vec![window("08:00", "17:00")]),
                ..Default::default()
            }),
            default_duration_min: 60,
            slot_granularity_min: 15,
            buffer_before_min: 10,
            buffer_after_min: 20,
            lead_time_min: 60,
            max_days_ahead: 14,
            max_daily_jobs: None,
            emergency_enabled: false,
            emergency_sms_phone: Some("+15550000001".into()),
            emergency_call_phone: None,
            emergency_retry_count: 2,
            emergency_retry_delay_sec: 60,
            auto_sms_enabled: true,
        }
    }

    #[test]
    fn merge_without_profile_uses_business_defaults() {
        let merged = EffectiveProfile::merge(&base_business(), None).unwrap();
        assert_eq!(merged.timezone, chrono_tz::America::Chicago);
        assert_eq!(merged.default_duration_min, 60);
        assert_eq!(merged.buffer_before_min, 10);
        assert_eq!(merged.buffer_after_min, 20);
        assert!(!merged.emergency_enabled);
    }

    #[test]
    fn profile_fields_win_over_business_fields() {
        let profile = BusinessProfile {
            business_id: "b1".into(),
            timezone: Some("America/New_York".into()),
            working_hours: None,
            slot_duration_min: Some(90),
            buffer_min: Some(30),
            emergency_enabled: Some(true),
            emergency_phone: Some("+15550009999".into()),
            service_area: None,
        };
        let merged = EffectiveProfile::merge(&base_business(), Some(&profile)).unwrap();
        assert_eq!(merged.timezone, chrono_tz::America::New_York);
        assert_eq!(merged.default_duration_min, 90);
        // A single profile buffer applies to both sides.
        assert_eq!(merged.buffer_before_min, 30);
        assert_eq!(merged.buffer_after_min, 30);
        assert!(merged.emergency_enabled);
        assert_eq!(merged.emergency_sms_phone.as_deref(), Some("+15550009999"));
        // Working hours fall through to the business when not overridden.
        assert_eq!(merged.working_hours.windows_for(Weekday::Mon).len(), 1);
    }

    #[test]
    fn merge_rejects_unknown_timezone() {
        let mut business = base_business();
        business.timezone = "Not/AZone".into();
        assert!(EffectiveProfile::merge(&business, None).is_err());
    }
}
