use pipeline_core::{Channel, Payload};
use serde_json::Value;

pub const MAX_COMMENT_LENGTH: usize = 2000;

const SESSION_STATUSES: [&str; 4] = ["scheduled", "completed", "cancelled", "no_show"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Result of the structural and business-rule checks for one message.
/// Warnings do not fail validation; they are carried downstream as a count.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub fn validate(channel: Channel, data: &Payload) -> ValidationOutcome {
    match channel {
        Channel::Tutors => validate_tutor(data),
        Channel::Sessions => validate_session(data),
        Channel::Feedback => validate_feedback(data),
    }
}

fn require_string(outcome: &mut ValidationOutcome, data: &Payload, field: &str) {
    match data.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => {}
        Some(_) => outcome.error(field, "must not be empty"),
        None => outcome.error(field, "is required"),
    }
}

fn optional_number(data: &Payload, field: &str) -> Option<Result<f64, ()>> {
    data.get(field).map(|v| v.as_f64().ok_or(()))
}

fn check_rating(outcome: &mut ValidationOutcome, data: &Payload, required: bool) {
    match optional_number(data, "rating") {
        Some(Ok(rating)) if (1.0..=5.0).contains(&rating) => {}
        Some(Ok(rating)) => outcome.error("rating", format!("{rating} is outside the 1-5 range")),
        Some(Err(())) => outcome.error("rating", "must be a number"),
        None if required => outcome.error("rating", "is required"),
        None => {}
    }
}

fn validate_tutor(data: &Payload) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    require_string(&mut outcome, data, "tutor_id");
    require_string(&mut outcome, data, "name");

    match data.get("email").and_then(Value::as_str) {
        Some(email) if email.contains('@') => {}
        Some(_) => outcome.error("email", "is not a valid address"),
        None => outcome.error("email", "is required"),
    }

    if let Some(result) = optional_number(data, "hourly_rate") {
        match result {
            Ok(rate) if rate >= 0.0 => {}
            Ok(_) => outcome.error("hourly_rate", "must not be negative"),
            Err(()) => outcome.error("hourly_rate", "must be a number"),
        }
    }

    match data.get("subjects") {
        Some(Value::Array(subjects)) if subjects.is_empty() => {
            outcome.error("subjects", "must not be empty")
        }
        Some(Value::Array(_)) => {}
        Some(_) => outcome.error("subjects", "must be a list"),
        None => outcome.warn("tutor has no subjects listed"),
    }
    outcome
}

fn validate_session(data: &Payload) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    require_string(&mut outcome, data, "session_id");
    require_string(&mut outcome, data, "tutor_id");
    require_string(&mut outcome, data, "student_id");

    match optional_number(data, "duration_minutes") {
        Some(Ok(minutes)) if minutes > 0.0 => {}
        Some(Ok(_)) => outcome.error("duration_minutes", "must be positive"),
        Some(Err(())) => outcome.error("duration_minutes", "must be a number"),
        None => outcome.error("duration_minutes", "is required"),
    }

    let status = data.get("status").and_then(Value::as_str);
    match status {
        Some(s) if SESSION_STATUSES.contains(&s) => {}
        Some(s) => outcome.error("status", format!("unknown status {s:?}")),
        None => outcome.error("status", "is required"),
    }

    check_rating(&mut outcome, data, false);
    if status == Some("completed") && !data.contains_key("rating") {
        outcome.warn("completed session has no rating");
    }
    outcome
}

fn validate_feedback(data: &Payload) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    require_string(&mut outcome, data, "feedback_id");
    require_string(&mut outcome, data, "session_id");
    require_string(&mut outcome, data, "tutor_id");
    check_rating(&mut outcome, data, true);

    if let Some(comment) = data.get("comment").and_then(Value::as_str) {
        if comment.chars().count() > MAX_COMMENT_LENGTH {
            outcome.warn("comment exceeds maximum length and will be truncated");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn valid_session_passes() {
        let outcome = validate(
            Channel::Sessions,
            &payload(&[
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("student_id", json!("ST1")),
                ("duration_minutes", json!(60)),
                ("status", json!("completed")),
                ("rating", json!(5)),
            ]),
        );
        assert!(outcome.is_valid());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn out_of_range_rating_names_the_field() {
        let outcome = validate(
            Channel::Feedback,
            &payload(&[
                ("feedback_id", json!("F1")),
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("rating", json!(6)),
            ]),
        );
        assert!(!outcome.is_valid());
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.field == "rating" && e.message.contains("1-5")));
    }

    #[test]
    fn completed_session_without_rating_warns() {
        let outcome = validate(
            Channel::Sessions,
            &payload(&[
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("student_id", json!("ST1")),
                ("duration_minutes", json!(30)),
                ("status", json!("completed")),
            ]),
        );
        assert!(outcome.is_valid());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn tutor_requires_contact_details() {
        let outcome = validate(
            Channel::Tutors,
            &payload(&[("tutor_id", json!("T1")), ("name", json!(""))]),
        );
        let fields: Vec<&str> = outcome.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"email"));
    }

    #[test]
    fn negative_duration_fails() {
        let outcome = validate(
            Channel::Sessions,
            &payload(&[
                ("session_id", json!("S1")),
                ("tutor_id", json!("T1")),
                ("student_id", json!("ST1")),
                ("duration_minutes", json!(-10)),
                ("status", json!("scheduled")),
            ]),
        );
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.field == "duration_minutes"));
    }
}
