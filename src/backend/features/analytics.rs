use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::backend::data::storage::{fetch_credits, fetch_study_days};
use crate::backend::engine::models::{
    AnalyticsRange, AnalyticsSummary, AppResult, HeatmapPoint, TopicTotal,
};

/// Longest window any report looks back over.
pub const MAX_RANGE_DAYS: i64 = 3660;

pub fn clamp_range_days(days: i64) -> i64 {
    days.clamp(1, MAX_RANGE_DAYS)
}

/// The trailing `days` calendar days ending on `today`, inclusive.
pub fn last_days_range(days: i64, today: NaiveDate) -> AnalyticsRange {
    let days = clamp_range_days(days);
    AnalyticsRange {
        from: today.checked_sub_signed(Duration::days(days - 1)),
        to: Some(today),
        topic_id: None,
    }
}

pub fn summary(
    conn: &Connection,
    range: &AnalyticsRange,
    today: NaiveDate,
) -> AppResult<AnalyticsSummary> {
    let credits = fetch_credits(conn, range)?;

    let mut total_focus_minutes = 0;
    let mut minutes_today = 0;
    let mut days_with_focus = HashSet::new();

    for credit in &credits {
        total_focus_minutes += credit.whole_minutes;
        if credit.day == today {
            minutes_today += credit.whole_minutes;
        }
        if credit.whole_minutes > 0 {
            days_with_focus.insert(credit.day);
        }
    }

    let avg_daily_focus_minutes = if days_with_focus.is_empty() {
        0
    } else {
        total_focus_minutes / days_with_focus.len() as i64
    };

    let marked: HashSet<NaiveDate> = fetch_study_days(conn)?.into_iter().collect();

    Ok(AnalyticsSummary {
        total_focus_minutes,
        credit_records: credits.len() as i64,
        study_days: days_with_focus.len() as i64,
        streak_days: calculate_streak_days(&marked, today),
        avg_daily_focus_minutes,
        minutes_today,
    })
}

pub fn topic_totals(conn: &Connection, range: &AnalyticsRange) -> AppResult<Vec<TopicTotal>> {
    let mut by_topic: HashMap<i64, i64> = HashMap::new();
    for credit in fetch_credits(conn, range)? {
        *by_topic.entry(credit.topic_id).or_insert(0) += credit.whole_minutes;
    }

    let mut totals: Vec<TopicTotal> = by_topic
        .into_iter()
        .map(|(topic_id, minutes)| TopicTotal { topic_id, minutes })
        .collect();
    totals.sort_by(|a, b| b.minutes.cmp(&a.minutes).then(a.topic_id.cmp(&b.topic_id)));
    Ok(totals)
}

/// One point per day from `from` to `to`, days without credits included as zero.
pub fn heatmap(conn: &Connection, from: NaiveDate, to: NaiveDate) -> AppResult<Vec<HeatmapPoint>> {
    let range = AnalyticsRange {
        from: Some(from),
        to: Some(to),
        topic_id: None,
    };

    let mut by_day: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    let mut day = from;
    while day <= to {
        by_day.insert(day, 0);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    for credit in fetch_credits(conn, &range)? {
        *by_day.entry(credit.day).or_insert(0) += credit.whole_minutes;
    }

    Ok(by_day
        .into_iter()
        .map(|(date, minutes)| HeatmapPoint { date, minutes })
        .collect())
}

/// Consecutive study days ending today. A day still in progress does not
/// break the streak, so counting starts from yesterday when today is unmarked.
pub fn calculate_streak_days(study_days: &HashSet<NaiveDate>, today: NaiveDate) -> i64 {
    let mut current = if study_days.contains(&today) {
        today
    } else {
        match today.pred_opt() {
            Some(prev) => prev,
            None => return 0,
        }
    };

    let mut streak = 0;
    while study_days.contains(&current) {
        streak += 1;
        match current.pred_opt() {
            Some(prev) => current = prev,
            None => break,
        }
    }

    streak
}
