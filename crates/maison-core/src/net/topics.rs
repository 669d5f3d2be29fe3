use core::fmt::Write;

use log::warn;
use thiserror_no_std::Error;

use super::QoS;

pub const TOPIC_LEN: usize = 64;

pub type Topic = heapless::String<TOPIC_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("topic longer than 64 bytes")]
pub struct TopicTooLong;

/// Application-defined subscription, relative to the device topic root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTopic {
    pub suffix: &'static str,
    pub qos: QoS,
}

/// All topics of one device: `<prefix><device>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub ctrl: Topic,
    pub state: Topic,
    pub log: Topic,
    pub config: Topic,
    pub event: Topic,
    pub user: Option<(Topic, QoS)>,
}

impl Topics {
    pub fn new(prefix: &str, device: &str, user: Option<UserTopic>) -> Self {
        Self {
            ctrl: build_fixed(prefix, device, "ctrl"),
            state: build_fixed(prefix, device, "state"),
            log: build_fixed(prefix, device, "log"),
            config: build_fixed(prefix, device, "config"),
            event: build_fixed(prefix, device, "event"),
            user: user.map(|u| (build_fixed(prefix, device, u.suffix), u.qos)),
        }
    }

    /// Topic for an arbitrary suffix under the same root.
    pub fn custom(prefix: &str, device: &str, suffix: &str) -> Result<Topic, TopicTooLong> {
        build(prefix, device, suffix)
    }

    pub fn is_ctrl(&self, topic: &str) -> bool {
        self.ctrl.as_str() == topic
    }
}

fn build(prefix: &str, device: &str, suffix: &str) -> Result<Topic, TopicTooLong> {
    let mut topic = Topic::new();
    write!(topic, "{prefix}{device}/{suffix}").map_err(|_| TopicTooLong)?;
    Ok(topic)
}

/// Device topics always end in their own suffix: an overlong root loses the
/// tail of the device name instead.
fn build_fixed(prefix: &str, device: &str, suffix: &str) -> Topic {
    if let Ok(topic) = build(prefix, device, suffix) {
        return topic;
    }

    let room = TOPIC_LEN.saturating_sub(prefix.len() + 1 + suffix.len());
    let mut end = room.min(device.len());
    while !device.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        "Topic {}{}/{} exceeds {} bytes, device name cut to {:?}",
        prefix,
        device,
        suffix,
        TOPIC_LEN,
        &device[..end]
    );

    let mut topic = Topic::new();
    for part in [prefix, &device[..end], "/", suffix] {
        if topic.push_str(part).is_err() {
            // Prefix and suffix alone exceed the capacity.
            break;
        }
    }
    topic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new(
            "maison/",
            "DOOR1",
            Some(UserTopic {
                suffix: "relay",
                qos: QoS::AtMostOnce,
            }),
        );
        assert_eq!(topics.ctrl.as_str(), "maison/DOOR1/ctrl");
        assert_eq!(topics.state.as_str(), "maison/DOOR1/state");
        assert_eq!(topics.log.as_str(), "maison/DOOR1/log");
        assert_eq!(topics.config.as_str(), "maison/DOOR1/config");
        assert_eq!(topics.event.as_str(), "maison/DOOR1/event");
        let (user, qos) = topics.user.clone().unwrap();
        assert_eq!(user.as_str(), "maison/DOOR1/relay");
        assert_eq!(qos, QoS::AtMostOnce);
        assert!(topics.is_ctrl("maison/DOOR1/ctrl"));
        assert!(!topics.is_ctrl("maison/DOOR2/ctrl"));
    }

    #[test]
    fn test_overlong_device_keeps_suffix() {
        let prefix = "building-a/floor-3/north-wing/";
        let device = "VERY-LONG-DEVICE-NAME-000000001";
        let topics = Topics::new(prefix, device, None);

        assert_eq!(topics.ctrl.len(), TOPIC_LEN);
        assert!(topics.ctrl.ends_with("/ctrl"));
        assert!(topics.config.ends_with("/config"));
        assert_ne!(topics.ctrl, topics.config);
        assert!(topics.ctrl.starts_with("building-a/floor-3/north-wing/VERY-LONG"));
    }

    #[test]
    fn test_overlong_custom_topic_rejected() {
        assert_eq!(
            Topics::custom("maison/", "DOOR1", "relay").unwrap().as_str(),
            "maison/DOOR1/relay"
        );
        let suffix = "telemetry/temperature/outdoor/north-facade/sensor-array-7";
        assert_eq!(Topics::custom("maison/", "DOOR1", suffix), Err(TopicTooLong));
    }
}
