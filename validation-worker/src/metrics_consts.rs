pub const MESSAGES_VALID: &str = "validation_messages_valid";
pub const MESSAGES_INVALID: &str = "validation_messages_invalid";
pub const MESSAGES_UNKNOWN_CHANNEL: &str = "validation_messages_unknown_channel";
pub const WARNINGS_RAISED: &str = "validation_warnings_raised";
