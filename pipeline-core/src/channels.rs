use std::fmt;
use std::str::FromStr;

use crate::PipelineError;

/// Terminal sink for messages that fail validation, enrichment, or exhaust
/// their retries. Shared by every data type.
pub const DEAD_LETTER_CHANNEL: &str = "dead_letter";

/// The fixed set of raw ingestion channels, one per data type.
///
/// Each raw channel has two derived streams: `<channel>:validated` (the
/// enrichment input, fed by the validation stage) and `<channel>:retry`
/// (where the consumer republishes messages that still have retry budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Tutors,
    Sessions,
    Feedback,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Tutors, Channel::Sessions, Channel::Feedback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Tutors => "tutors",
            Channel::Sessions => "sessions",
            Channel::Feedback => "feedback",
        }
    }

    /// The enrichment-input stream the validation stage forwards to.
    pub fn validated(&self) -> String {
        format!("{}:validated", self.as_str())
    }

    /// The stream the consumer republishes retryable messages onto.
    pub fn retry(&self) -> String {
        format!("{}:retry", self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tutors" => Ok(Channel::Tutors),
            "sessions" => Ok(Channel::Sessions),
            "feedback" => Ok(Channel::Feedback),
            other => Err(PipelineError::UnknownChannel(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names() {
        assert_eq!(Channel::Sessions.validated(), "sessions:validated");
        assert_eq!(Channel::Feedback.retry(), "feedback:retry");
    }

    #[test]
    fn parse_round_trips_and_rejects_unknown() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!(matches!(
            "payments".parse::<Channel>(),
            Err(PipelineError::UnknownChannel(_))
        ));
    }
}
