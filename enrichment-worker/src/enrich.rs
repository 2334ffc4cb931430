use chrono::{DateTime, Datelike, Utc, Weekday};
use pipeline_core::{Channel, Payload};
use serde_json::{json, Value};

pub const MAX_COMMENT_LENGTH: usize = 2000;

/// Optional profile fields that count towards a tutor's completeness score.
const PROFILE_FIELDS: [&str; 6] = [
    "bio",
    "avatar_url",
    "subjects",
    "hourly_rate",
    "education",
    "availability",
];

/// The field set the store accepts per data type. Everything else is
/// dropped during projection, never persisted.
pub fn allowed_fields(channel: Channel) -> &'static [&'static str] {
    match channel {
        Channel::Tutors => &[
            "tutor_id",
            "name",
            "email",
            "hourly_rate",
            "subjects_count",
            "profile_completeness",
        ],
        Channel::Sessions => &[
            "session_id",
            "tutor_id",
            "student_id",
            "status",
            "duration_minutes",
            "duration_hours",
            "revenue",
            "rating",
            "is_completed",
            "day_of_week",
        ],
        Channel::Feedback => &[
            "feedback_id",
            "session_id",
            "tutor_id",
            "rating",
            "sentiment",
            "comment",
            "has_comment",
        ],
    }
}

/// Compute derived fields for one message, then project the result down to
/// the persistence-allowed set. Errors are collected, not thrown one at a
/// time, so the dead-letter record shows everything that went wrong.
pub fn enrich(channel: Channel, data: &Payload) -> Result<Payload, Vec<String>> {
    let mut enriched = data.clone();
    let errors = match channel {
        Channel::Tutors => enrich_tutor(&mut enriched),
        Channel::Sessions => enrich_session(&mut enriched),
        Channel::Feedback => enrich_feedback(&mut enriched),
    };
    if !errors.is_empty() {
        return Err(errors);
    }
    enriched.retain(|key, _| allowed_fields(channel).contains(&key.as_str()));
    Ok(enriched)
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn enrich_session(data: &mut Payload) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(minutes) = data.get("duration_minutes").and_then(Value::as_f64) else {
        errors.push("duration_minutes missing or not a number".to_string());
        return errors;
    };
    let hours = round2(minutes / 60.0);
    data.insert("duration_hours".to_string(), json!(hours));

    if let Some(rate) = data.get("hourly_rate").and_then(Value::as_f64) {
        data.insert("revenue".to_string(), json!(round2(hours * rate)));
    }

    let completed = data.get("status").and_then(Value::as_str) == Some("completed");
    data.insert("is_completed".to_string(), json!(completed));

    if let Some(scheduled) = data.get("scheduled_at").and_then(Value::as_str) {
        match scheduled.parse::<DateTime<Utc>>() {
            Ok(at) => {
                data.insert("day_of_week".to_string(), json!(weekday_name(at.weekday())));
            }
            Err(_) => errors.push(format!("scheduled_at {scheduled:?} is not a timestamp")),
        }
    }
    errors
}

fn enrich_feedback(data: &mut Payload) -> Vec<String> {
    let mut errors = Vec::new();

    match data.get("rating").and_then(Value::as_f64) {
        Some(rating) => {
            let sentiment = if rating <= 2.0 {
                "negative"
            } else if rating < 4.0 {
                "neutral"
            } else {
                "positive"
            };
            data.insert("sentiment".to_string(), json!(sentiment));
        }
        None => errors.push("rating missing or not a number".to_string()),
    }

    let comment = data.get("comment").and_then(Value::as_str).map(str::to_string);
    if let Some(comment) = comment {
        if comment.chars().count() > MAX_COMMENT_LENGTH {
            let truncated: String = comment.chars().take(MAX_COMMENT_LENGTH).collect();
            data.insert("comment".to_string(), json!(truncated));
        }
        data.insert("has_comment".to_string(), json!(true));
    } else {
        data.insert("has_comment".to_string(), json!(false));
    }
    errors
}

fn enrich_tutor(data: &mut Payload) -> Vec<String> {
    let filled = PROFILE_FIELDS
        .iter()
        .filter(|field| match data.get(**field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        })
        .count();
    let completeness = round2(filled as f64 / PROFILE_FIELDS.len() as f64 * 100.0);
    data.insert("profile_completeness".to_string(), json!(completeness));

    let subjects_count = data
        .get("subjects")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    data.insert("subjects_count".to_string(), json!(subjects_count));
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn session_enrichment_derives_and_projects() {
        let enriched = enrich(
            Channel::Sessions,
            &payload(&[
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("student_id", json!("ST1")),
                ("status", json!("completed")),
                ("duration_minutes", json!(90)),
                ("hourly_rate", json!(40.0)),
                ("scheduled_at", json!("2026-08-17T10:00:00Z")),
                ("internal_note", json!("do not persist")),
            ]),
        )
        .unwrap();

        assert_eq!(enriched.get("duration_hours"), Some(&json!(1.5)));
        assert_eq!(enriched.get("revenue"), Some(&json!(60.0)));
        assert_eq!(enriched.get("is_completed"), Some(&json!(true)));
        assert_eq!(enriched.get("day_of_week"), Some(&json!("monday")));
        // Projection drops fields the store does not accept.
        assert!(!enriched.contains_key("internal_note"));
        assert!(!enriched.contains_key("scheduled_at"));
        assert!(!enriched.contains_key("hourly_rate"));
    }

    #[test]
    fn session_without_duration_fails_enrichment() {
        let errors = enrich(
            Channel::Sessions,
            &payload(&[("session_id", json!("S1"))]),
        )
        .unwrap_err();
        assert!(errors[0].contains("duration_minutes"));
    }

    #[test]
    fn feedback_sentiment_buckets() {
        for (rating, expected) in [(1, "negative"), (2, "negative"), (3, "neutral"), (4, "positive"), (5, "positive")] {
            let enriched = enrich(
                Channel::Feedback,
                &payload(&[
                    ("feedback_id", json!("F1")),
                    ("session_id", json!("S1")),
                    ("tutor_id", json!("T1")),
                    ("rating", json!(rating)),
                ]),
            )
            .unwrap();
            assert_eq!(enriched.get("sentiment"), Some(&json!(expected)), "rating {rating}");
            assert_eq!(enriched.get("has_comment"), Some(&json!(false)));
        }
    }

    #[test]
    fn long_comments_are_truncated() {
        let long = "x".repeat(MAX_COMMENT_LENGTH + 50);
        let enriched = enrich(
            Channel::Feedback,
            &payload(&[
                ("feedback_id", json!("F1")),
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("rating", json!(5)),
                ("comment", json!(long)),
            ]),
        )
        .unwrap();
        let comment = enriched.get("comment").unwrap().as_str().unwrap();
        assert_eq!(comment.chars().count(), MAX_COMMENT_LENGTH);
    }

    #[test]
    fn tutor_profile_completeness() {
        let enriched = enrich(
            Channel::Tutors,
            &payload(&[
                ("tutor_id", json!("T1")),
                ("name", json!("Ada")),
                ("email", json!("ada@example.com")),
                ("bio", json!("Maths tutor")),
                ("subjects", json!(["maths", "physics"])),
                ("hourly_rate", json!(35.0)),
            ]),
        )
        .unwrap();
        // 3 of 6 profile fields filled: bio, subjects, hourly_rate.
        assert_eq!(enriched.get("profile_completeness"), Some(&json!(50.0)));
        assert_eq!(enriched.get("subjects_count"), Some(&json!(2)));
    }
}
