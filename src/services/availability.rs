use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::models::business::EffectiveProfile;

/// A `{startUtc, endUtc}` pair the external calendar reports as taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Slot {
    pub start_local: String,
    pub end_local: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

/// Expand each busy interval by the tenant buffers, then sort and merge
/// overlapping/adjacent intervals. The result is sorted and pairwise
/// disjoint, and its union equals the union of the expanded inputs.
pub fn normalize_busy_utc(
    intervals: &[BusyInterval],
    buffer_before_min: i64,
    buffer_after_min: i64,
) -> Vec<BusyInterval> {
    let mut expanded: Vec<BusyInterval> = intervals
        .iter()
        .filter(|iv| iv.end > iv.start)
        .map(|iv| BusyInterval {
            start: iv.start - Duration::minutes(buffer_before_min.max(0)),
            end: iv.end + Duration::minutes(buffer_after_min.max(0)),
        })
        .collect();
    expanded.sort_by_key(|iv| iv.start);

    let mut merged: Vec<BusyInterval> = Vec::with_capacity(expanded.len());
    for iv in expanded {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// Strict interval overlap: `a.start < b.end && a.end > b.start`.
fn overlaps_any(start: DateTime<Utc>, end: DateTime<Utc>, busy: &[BusyInterval]) -> bool {
    busy.iter().any(|iv| start < iv.end && end > iv.start)
}

/// Deterministic slot enumeration over the effective profile's working
/// hours. `now_utc` is an explicit input so the function stays pure.
///
/// Per local day in [window_start, window_start + days), per working-hours
/// window of that weekday: clamp the cursor to the lead-time floor, round it
/// up to the next granularity boundary, then walk the window emitting every
/// candidate whose UTC projection misses all merged busy intervals.
pub fn slots(
    profile: &EffectiveProfile,
    window_start_local: NaiveDate,
    days: i64,
    duration_min: i64,
    merged_busy_utc: &[BusyInterval],
    now_utc: DateTime<Utc>,
) -> Vec<Slot> {
    let granularity = profile.slot_granularity_min.max(1);
    if duration_min <= 0 {
        return Vec::new();
    }

    let earliest_local = (now_utc + Duration::minutes(profile.lead_time_min))
        .with_timezone(&profile.timezone)
        .naive_local();

    let mut out = Vec::new();
    for offset in 0..days.max(0) {
        let date = window_start_local + Duration::days(offset);
        for window in profile.working_hours.windows_for(date.weekday()) {
            let Some((win_start, win_end)) = window.bounds_minutes() else {
                continue;
            };

            // Cursor in minutes-of-day, clamped by the lead-time floor.
            let mut cursor = win_start as i64;
            if earliest_local.date() > date {
                continue;
            }
            if earliest_local.date() == date {
                let floor = i64::from(earliest_local.time().hour()) * 60
                    + i64::from(earliest_local.time().minute())
                    + if earliest_local.time().second() > 0 { 1 } else { 0 };
                cursor = cursor.max(floor);
            }
            // Round up to the next granularity boundary.
            cursor = cursor.div_euclid(granularity) * granularity
                + if cursor.rem_euclid(granularity) > 0 { granularity } else { 0 };

            while cursor + duration_min <= win_end as i64 {
                if let Some(slot) = project_slot(profile, date, cursor, duration_min) {
                    if !overlaps_any(slot.start_utc, slot.end_utc, merged_busy_utc) {
                        out.push(slot);
                    }
                }
                cursor += granularity;
            }
        }
    }
    out
}

/// Resolve one candidate to concrete local + UTC datetimes. Returns None
/// for local times that do not exist (DST spring-forward gap).
fn project_slot(
    profile: &EffectiveProfile,
    date: NaiveDate,
    minute_of_day: i64,
    duration_min: i64,
) -> Option<Slot> {
    let start_time =
        NaiveTime::from_hms_opt((minute_of_day / 60) as u32, (minute_of_day % 60) as u32, 0)?;
    let start_naive = date.and_time(start_time);
    let end_naive = start_naive + Duration::minutes(duration_min);

    let start_local = profile.timezone.from_local_datetime(&start_naive).earliest()?;
    let end_local = profile.timezone.from_local_datetime(&end_naive).earliest()?;

    Some(Slot {
        start_local: start_local.to_rfc3339(),
        end_local: end_local.to_rfc3339(),
        start_utc: start_local.with_timezone(&Utc),
        end_utc: end_local.with_timezone(&Utc),
    })
}

/// True when the local projection of `start_utc` falls outside every
/// working-hours window of its weekday. A tenant with no configured hours
/// is treated as always after-hours.
pub fn is_outside_business_hours(start_utc: DateTime<Utc>, profile: &EffectiveProfile) -> bool {
    let local = start_utc.with_timezone(&profile.timezone);
    let minute = i64::from(local.time().hour()) * 60 + i64::from(local.time().minute());
    !profile
        .working_hours
        .windows_for(local.date_naive().weekday())
        .iter()
        .filter_map(|w| w.bounds_minutes())
        .any(|(start, end)| minute >= i64::from(start) && minute < i64::from(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::business::{WorkingHours, WorkingWindow};

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn busy(start: &str, end: &str) -> BusyInterval {
        BusyInterval {
            start: utc(start),
            end: utc(end),
        }
    }

    fn weekday_hours(start: &str, end: &str) -> WorkingHours {
        let window = vec![WorkingWindow {
            start: start.into(),
            end: end.into(),
        }];
        WorkingHours {
            mon: Some(window.clone()),
            tue: Some(window.clone()),
            wed: Some(window.clone()),
            thu: Some(window.clone()),
            fri: Some(window),
            ..Default::default()
        }
    }

    fn chicago_profile() -> EffectiveProfile {
        EffectiveProfile {
            business_id: "b1".into(),
            timezone: chrono_tz::America::Chicago,
            working_hours: weekday_hours("08:00", "17:00"),
            default_duration_min: 60,
            slot_granularity_min: 15,
            buffer_before_min: 0,
            buffer_after_min: 0,
            lead_time_min: 60,
            max_days_ahead: 14,
            max_daily_jobs: None,
            emergency_enabled: true,
            emergency_sms_phone: Some("+15550009999".into()),
            emergency_call_phone: None,
            emergency_retry_count: 2,
            emergency_retry_delay_sec: 60,
            auto_sms_enabled: true,
        }
    }

    #[test]
    fn merge_sorts_and_joins_overlaps() {
        let merged = normalize_busy_utc(
            &[
                busy("2026-01-12T16:00:00Z", "2026-01-12T17:00:00Z"),
                busy("2026-01-12T14:00:00Z", "2026-01-12T15:30:00Z"),
                busy("2026-01-12T15:00:00Z", "2026-01-12T16:00:00Z"),
            ],
            0,
            0,
        );
        assert_eq!(
            merged,
            vec![busy("2026-01-12T14:00:00Z", "2026-01-12T17:00:00Z")]
        );
    }

    #[test]
    fn merge_expands_by_buffers() {
        let merged = normalize_busy_utc(
            &[busy("2026-01-12T15:00:00Z", "2026-01-12T16:00:00Z")],
            15,
            30,
        );
        assert_eq!(
            merged,
            vec![busy("2026-01-12T14:45:00Z", "2026-01-12T16:30:00Z")]
        );
    }

    #[test]
    fn merge_keeps_disjoint_intervals_apart() {
        let merged = normalize_busy_utc(
            &[
                busy("2026-01-12T10:00:00Z", "2026-01-12T11:00:00Z"),
                busy("2026-01-12T12:00:00Z", "2026-01-12T13:00:00Z"),
            ],
            0,
            0,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged[0].end < merged[1].start);
    }

    #[test]
    fn merge_drops_empty_intervals() {
        let merged = normalize_busy_utc(
            &[busy("2026-01-12T10:00:00Z", "2026-01-12T10:00:00Z")],
            0,
            0,
        );
        assert!(merged.is_empty());
    }

    // Now = 2026-01-10T07:00:00-06:00; Monday 2026-01-12 is fully in the
    // future, so the first slot sits at the window open.
    #[test]
    fn enumerates_full_open_day() {
        let profile = chicago_profile();
        let now = utc("2026-01-10T13:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let result = slots(&profile, day, 1, 60, &[], now);

        assert_eq!(result.first().unwrap().start_local, "2026-01-12T08:00:00-06:00");
        // 08:00..16:00 inclusive starts at 15-minute granularity
        assert_eq!(result.len(), 33);
        assert_eq!(result.last().unwrap().start_local, "2026-01-12T16:00:00-06:00");
        assert_eq!(result.first().unwrap().start_utc, utc("2026-01-12T14:00:00Z"));
    }

    #[test]
    fn is_deterministic_and_order_stable() {
        let profile = chicago_profile();
        let now = utc("2026-01-10T13:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let busy_list = normalize_busy_utc(
            &[busy("2026-01-12T15:00:00Z", "2026-01-12T16:00:00Z")],
            0,
            0,
        );
        let a = slots(&profile, day, 3, 60, &busy_list, now);
        let b = slots(&profile, day, 3, 60, &busy_list, now);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0].start_utc < w[1].start_utc
            || w[0].start_utc == w[1].start_utc));
    }

    #[test]
    fn lead_time_rounds_cursor_up_to_granularity() {
        let profile = chicago_profile();
        // 09:07 local + 60 min lead = 10:07 → first slot 10:15
        let now = utc("2026-01-12T15:07:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let result = slots(&profile, day, 1, 60, &[], now);
        assert_eq!(result.first().unwrap().start_local, "2026-01-12T10:15:00-06:00");
    }

    #[test]
    fn busy_interval_excludes_strictly_overlapping_slots() {
        let profile = chicago_profile();
        let now = utc("2026-01-10T13:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        // Busy 09:00–10:00 local
        let busy_list = vec![busy("2026-01-12T15:00:00Z", "2026-01-12T16:00:00Z")];
        let result = slots(&profile, day, 1, 60, &busy_list, now);

        assert!(!result
            .iter()
            .any(|s| s.start_utc < utc("2026-01-12T16:00:00Z")
                && s.end_utc > utc("2026-01-12T15:00:00Z")));
        // Back-to-back neighbors survive: 08:00–09:00 and 10:00–11:00.
        assert!(result.iter().any(|s| s.start_utc == utc("2026-01-12T14:00:00Z")));
        assert!(result.iter().any(|s| s.start_utc == utc("2026-01-12T16:00:00Z")));
    }

    #[test]
    fn weekend_has_no_slots() {
        let profile = chicago_profile();
        let now = utc("2026-01-05T00:00:00Z");
        let saturday = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        assert!(slots(&profile, saturday, 1, 60, &[], now).is_empty());
    }

    #[test]
    fn duration_longer_than_window_yields_nothing() {
        let profile = chicago_profile();
        let now = utc("2026-01-05T00:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        assert!(slots(&profile, day, 1, 600, &[], now).is_empty());
    }

    #[test]
    fn after_hours_detection() {
        let profile = chicago_profile();
        // 22:00 local on a Monday
        assert!(is_outside_business_hours(utc("2026-01-13T04:00:00Z"), &profile));
        // 09:00 local on a Monday
        assert!(!is_outside_business_hours(utc("2026-01-12T15:00:00Z"), &profile));
        // Saturday mid-day
        assert!(is_outside_business_hours(utc("2026-01-10T18:00:00Z"), &profile));
    }

    #[test]
    fn split_day_emits_both_windows() {
        let mut profile = chicago_profile();
        profile.working_hours = WorkingHours {
            mon: Some(vec![
                WorkingWindow {
                    start: "08:00".into(),
                    end: "12:00".into(),
                },
                WorkingWindow {
                    start: "13:00".into(),
                    end: "17:00".into(),
                },
            ]),
            ..Default::default()
        };
        let now = utc("2026-01-05T00:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let result = slots(&profile, day, 1, 60, &[], now);

        // 08:00..11:00 and 13:00..16:00 starts at 15-minute steps.
        assert_eq!(result.len(), 13 + 13);
        // Nothing lands in the lunch gap.
        assert!(!result.iter().any(|s| s.start_local.contains("T12:")));
    }

    #[test]
    fn multi_day_window_covers_each_weekday_once() {
        let profile = chicago_profile();
        let now = utc("2026-01-05T00:00:00Z");
        // Mon Jan 12 through Sun Jan 18: five working days.
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let result = slots(&profile, day, 7, 60, &[], now);
        let days: std::collections::BTreeSet<&str> = result
            .iter()
            .map(|s| &s.start_local[..10])
            .collect();
        assert_eq!(days.len(), 5);
        assert!(days.contains("2026-01-12"));
        assert!(days.contains("2026-01-16"));
        assert!(!days.contains("2026-01-17"));
    }

    #[test]
    fn window_end_is_exclusive_for_start_plus_duration() {
        let profile = chicago_profile();
        let now = utc("2026-01-05T00:00:00Z");
        let day = NaiveDate::from_ymd_opt(2026, 1, 12).unwrap();
        let result = slots(&profile, day, 1, 60, &[], now);
        // Last admissible start is 16:00 for a 17:00 close.
        assert_eq!(result.last().unwrap().end_local, "2026-01-12T17:00:00-06:00");
    }
}
