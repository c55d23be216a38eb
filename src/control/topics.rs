use super::types::DeviceIdentity;

/// Root segment shared by every device topic.
pub const TOPIC_ROOT: &str = "remoteled";

/// Topic names derived from a device identifier.
///
/// | Purpose      | Topic                          | Direction        |
/// |--------------|--------------------------------|------------------|
/// | Command      | `remoteled/{device}/desired`   | session → device |
/// | State report | `remoteled/{device}/reported`  | device → session |
/// | Liveness     | `remoteled/{device}/status`    | device → session |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub desired: String,
    pub reported: String,
    pub status: String,
}

/// Which device topic an inbound message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Desired,
    Reported,
    Status,
    Foreign,
}

impl DeviceTopics {
    pub fn derive(identity: &DeviceIdentity) -> Self {
        let base = format!("{}/{}", TOPIC_ROOT, identity.as_str());
        Self {
            desired: format!("{}/desired", base),
            reported: format!("{}/reported", base),
            status: format!("{}/status", base),
        }
    }

    /// Topics a session subscribes to; the command topic is publish-only.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.reported.clone(), self.status.clone()]
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.reported {
            TopicKind::Reported
        } else if topic == self.status {
            TopicKind::Status
        } else if topic == self.desired {
            TopicKind::Desired
        } else {
            TopicKind::Foreign
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(device: &str) -> DeviceTopics {
        DeviceTopics::derive(&DeviceIdentity::new(device).unwrap())
    }

    #[test]
    fn derives_wire_topics() {
        let t = topics("MRI-07");
        assert_eq!(t.desired, "remoteled/MRI-07/desired");
        assert_eq!(t.reported, "remoteled/MRI-07/reported");
        assert_eq!(t.status, "remoteled/MRI-07/status");
    }

    #[test]
    fn derivation_is_deterministic() {
        for device in ["MRI-07", "Clinica Central 3", "ñandú"] {
            assert_eq!(topics(device), topics(device));
        }
    }

    #[test]
    fn device_id_is_used_verbatim() {
        let t = topics(" MRI 07 ");
        assert_eq!(t.reported, "remoteled/ MRI 07 /reported");
    }

    #[test]
    fn subscriptions_exclude_command_topic() {
        let t = topics("MRI-07");
        assert_eq!(
            t.subscriptions(),
            vec!["remoteled/MRI-07/reported", "remoteled/MRI-07/status"]
        );
    }

    #[test]
    fn classifies_inbound_topics() {
        let t = topics("MRI-07");
        assert_eq!(t.classify("remoteled/MRI-07/reported"), TopicKind::Reported);
        assert_eq!(t.classify("remoteled/MRI-07/status"), TopicKind::Status);
        assert_eq!(t.classify("remoteled/MRI-07/desired"), TopicKind::Desired);
        assert_eq!(t.classify("remoteled/MRI-08/reported"), TopicKind::Foreign);
    }
}
