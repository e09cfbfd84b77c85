use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;

use crate::models::business::{parse_hhmm, Business, BusinessProfile, EffectiveProfile, WorkingHours};

pub struct BusinessService;

/// Partial profile patch accepted by PUT /api/businesses/:id/profile.
/// emergency_enabled tolerates true/false/0/1 from older clients.
#[derive(Debug, Default, Deserialize)]
pub struct ProfilePatch {
    pub timezone: Option<String>,
    pub working_hours: Option<WorkingHours>,
    pub slot_duration_min: Option<i64>,
    pub buffer_min: Option<i64>,
    pub emergency_enabled: Option<Value>,
    pub emergency_phone: Option<String>,
    pub service_area: Option<Value>,
}

impl BusinessService {
    pub async fn get_business(pool: &PgPool, id: &str) -> anyhow::Result<Option<Business>> {
        let business = sqlx::query_as::<_, Business>(
            "SELECT id, name, timezone, working_hours, default_duration_min,
                    slot_granularity_min, buffer_before_min, buffer_after_min,
                    lead_time_min, max_days_ahead, max_daily_jobs,
                    emergency_enabled, emergency_sms_phone, emergency_call_phone,
                    emergency_retry_count, emergency_retry_delay_sec, auto_sms_enabled
             FROM businesses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(business)
    }

    pub async fn get_profile(pool: &PgPool, id: &str) -> anyhow::Result<Option<BusinessProfile>> {
        let profile = sqlx::query_as::<_, BusinessProfile>(
            "SELECT business_id, timezone, working_hours, slot_duration_min,
                    buffer_min, emergency_enabled, emergency_phone, service_area
             FROM business_profiles WHERE business_id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(profile)
    }

    /// Business defaults overlaid with the operator profile. None when the
    /// business does not exist.
    pub async fn effective_profile(
        pool: &PgPool,
        id: &str,
    ) -> anyhow::Result<Option<EffectiveProfile>> {
        let Some(business) = Self::get_business(pool, id).await? else {
            return Ok(None);
        };
        let profile = Self::get_profile(pool, id).await?;
        Ok(Some(EffectiveProfile::merge(&business, profile.as_ref())?))
    }

    /// Validate and apply a partial profile patch. Returns the list of
    /// validation failures (empty = applied).
    pub async fn update_profile(
        pool: &PgPool,
        id: &str,
        patch: &ProfilePatch,
    ) -> anyhow::Result<Vec<String>> {
        let errors = validate_patch(patch);
        if !errors.is_empty() {
            return Ok(errors);
        }

        let emergency_enabled = patch.emergency_enabled.as_ref().map(coerce_bool_lossy);
        sqlx::query(
            "INSERT INTO business_profiles
                (business_id, timezone, working_hours, slot_duration_min, buffer_min,
                 emergency_enabled, emergency_phone, service_area, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
             ON CONFLICT (business_id) DO UPDATE SET
                timezone = COALESCE(EXCLUDED.timezone, business_profiles.timezone),
                working_hours = COALESCE(EXCLUDED.working_hours, business_profiles.working_hours),
                slot_duration_min = COALESCE(EXCLUDED.slot_duration_min, business_profiles.slot_duration_min),
                buffer_min = COALESCE(EXCLUDED.buffer_min, business_profiles.buffer_min),
                emergency_enabled = COALESCE(EXCLUDED.emergency_enabled, business_profiles.emergency_enabled),
                emergency_phone = COALESCE(EXCLUDED.emergency_phone, business_profiles.emergency_phone),
                service_area = COALESCE(EXCLUDED.service_area, business_profiles.service_area),
                updated_at = NOW()",
        )
        .bind(id)
        .bind(&patch.timezone)
        .bind(patch.working_hours.as_ref().map(sqlx::types::Json))
        .bind(patch.slot_duration_min.map(|v| v as i32))
        .bind(patch.buffer_min.map(|v| v as i32))
        .bind(emergency_enabled)
        .bind(&patch.emergency_phone)
        .bind(patch.service_area.as_ref().map(sqlx::types::Json))
        .execute(pool)
        .await?;
        Ok(Vec::new())
    }
}

fn coerce_bool_lossy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn is_booleanish(value: &Value) -> bool {
    matches!(value, Value::Bool(_))
        || matches!(value, Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1))
}

pub fn validate_patch(patch: &ProfilePatch) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(tz) = &patch.timezone {
        if tz.parse::<chrono_tz::Tz>().is_err() {
            errors.push(format!("invalid timezone: {tz}"));
        }
    }

    if let Some(hours) = &patch.working_hours {
        for day in ["sun", "mon", "tue", "wed", "thu", "fri", "sat"] {
            let windows = match day {
                "sun" => &hours.sun,
                "mon" => &hours.mon,
                "tue" => &hours.tue,
                "wed" => &hours.wed,
                "thu" => &hours.thu,
                "fri" => &hours.fri,
                _ => &hours.sat,
            };
            for window in windows.as_deref().unwrap_or(&[]) {
                if parse_hhmm(&window.start).is_none() || parse_hhmm(&window.end).is_none() {
                    errors.push(format!("working_hours.{day}: times must be HH:MM"));
                } else if window.bounds_minutes().is_none() {
                    errors.push(format!("working_hours.{day}: start must be before end"));
                }
            }
        }
    }

    if let Some(duration) = patch.slot_duration_min {
        if !(15..=240).contains(&duration) {
            errors.push("slot_duration_min must be between 15 and 240".into());
        }
    }

    if let Some(buffer) = patch.buffer_min {
        if !(0..=120).contains(&buffer) {
            errors.push("buffer_min must be between 0 and 120".into());
        }
    }

    if let Some(flag) = &patch.emergency_enabled {
        if !is_booleanish(flag) {
            errors.push("emergency_enabled must be true, false, 0 or 1".into());
        }
    }

    if let Some(phone) = &patch.emergency_phone {
        let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
        if !phone.is_empty() && digits < 7 {
            errors.push("emergency_phone must contain at least 7 digits".into());
        }
    }

    if let Some(area) = &patch.service_area {
        match area.get("mode").and_then(Value::as_str) {
            Some("radius") | Some("zip") => {}
            _ => errors.push("service_area.mode must be \"radius\" or \"zip\"".into()),
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::business::WorkingWindow;
    use serde_json::json;

    #[test]
    fn accepts_valid_patch() {
        let patch = ProfilePatch {
            timezone: Some("America/Chicago".into()),
            slot_duration_min: Some(60),
            buffer_min: Some(30),
            emergency_enabled: Some(json!(1)),
            emergency_phone: Some("+1 555 000 1111".into()),
            service_area: Some(json!({ "mode": "radius", "radius_km": 40 })),
            ..Default::default()
        };
        assert!(validate_patch(&patch).is_empty());
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        let patch = ProfilePatch {
            slot_duration_min: Some(10),
            buffer_min: Some(500),
            ..Default::default()
        };
        let errors = validate_patch(&patch);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_short_emergency_phone() {
        let patch = ProfilePatch {
            emergency_phone: Some("12345".into()),
            ..Default::default()
        };
        assert_eq!(validate_patch(&patch).len(), 1);
        // Empty string clears the phone and is allowed.
        let clear = ProfilePatch {
            emergency_phone: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_patch(&clear).is_empty());
    }

    #[test]
    fn rejects_non_boolean_emergency_flag() {
        let patch = ProfilePatch {
            emergency_enabled: Some(json!("yes")),
            ..Default::default()
        };
        assert_eq!(validate_patch(&patch).len(), 1);
        assert!(coerce_bool_lossy(&json!(true)));
        assert!(coerce_bool_lossy(&json!(1)));
        assert!(!coerce_bool_lossy(&json!(0)));
    }

    #[test]
    fn rejects_inverted_working_window() {
        let patch = ProfilePatch {
            working_hours: Some(WorkingHours {
                mon: Some(vec![WorkingWindow {
                    start: "17:00".into(),
                    end: "08:00".into(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let errors = validate_patch(&patch);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mon"));
    }

    #[test]
    fn rejects_unknown_service_area_mode() {
        let patch = ProfilePatch {
            service_area: Some(json!({ "mode": "county" })),
            ..Default::default()
        };
        assert_eq!(validate_patch(&patch).len(), 1);
    }
}
