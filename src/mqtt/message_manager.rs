use chrono::NaiveDateTime;
use std::borrow::Cow;
use std::fmt;

const PREVIEW_CHARS: usize = 10;

/// A publish received from the broker, stamped with local receive time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload_text().chars().take(PREVIEW_CHARS).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, invalid sequences replaced.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn received_at(&self) -> NaiveDateTime {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = MQTTMessage::from_topic("remoteled/MRI-07/reported", "PRINCIPAL-and-more");
        let rendered = msg.to_string();
        assert!(rendered.ends_with("remoteled/MRI-07/reported: PRINCIPAL-"));
    }

    #[test]
    fn display_keeps_short_payloads() {
        let msg = MQTTMessage::from_topic("t", "ON");
        assert!(msg.to_string().ends_with("t: ON"));
    }

    #[test]
    fn payload_text_replaces_invalid_utf8() {
        let msg = MQTTMessage::from_topic("t", vec![0x4f, 0xff, 0x4b]);
        assert_eq!(msg.payload_text(), "O\u{fffd}K");
    }
}
