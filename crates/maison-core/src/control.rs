//! Control topic grammar
//!
//! Commands are plain text, case-sensitive and matched by prefix:
//!
//! | payload | meaning |
//! |---|---|
//! | `CONFIG:<json>` | apply a candidate config |
//! | `CONFIG?` | echo the current config |
//! | `STATE?` | publish a state snapshot |
//! | `RESTART!!` | persist state and restart |
//! | `REBOOT!` | restart without persisting |
//! | `NEW_CODE:<json>` | start a firmware transfer |
//!
//! While a transfer is running every other payload is firmware bytes.

const CONFIG: &[u8] = b"CONFIG:";
const CONFIG_QUERY: &[u8] = b"CONFIG?";
const STATE_QUERY: &[u8] = b"STATE?";
const RESTART: &[u8] = b"RESTART!!";
const REBOOT: &[u8] = b"REBOOT!";
const NEW_CODE: &[u8] = b"NEW_CODE:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Config(&'a [u8]),
    ConfigQuery,
    StateQuery,
    Restart,
    Reboot,
    NewCode(&'a [u8]),
    /// Raw image bytes of the running transfer.
    Firmware(&'a [u8]),
    Unknown(&'a [u8]),
}

impl<'a> Command<'a> {
    /// Classify a control payload. `ota_receiving` routes non-descriptor payloads to the transfer.
    pub fn parse(payload: &'a [u8], ota_receiving: bool) -> Self {
        if let Some(descriptor) = payload.strip_prefix(NEW_CODE) {
            return Self::NewCode(descriptor);
        }
        if ota_receiving {
            return Self::Firmware(payload);
        }

        if let Some(json) = payload.strip_prefix(CONFIG) {
            Self::Config(json)
        } else if payload.starts_with(CONFIG_QUERY) {
            Self::ConfigQuery
        } else if payload.starts_with(STATE_QUERY) {
            Self::StateQuery
        } else if payload.starts_with(RESTART) {
            Self::Restart
        } else if payload.starts_with(REBOOT) {
            Self::Reboot
        } else {
            Self::Unknown(payload)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG:",
            Self::ConfigQuery => "CONFIG?",
            Self::StateQuery => "STATE?",
            Self::Restart => "RESTART!!",
            Self::Reboot => "REBOOT!",
            Self::NewCode(_) => "NEW_CODE:",
            Self::Firmware(_) => "firmware",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands() {
        assert_eq!(
            Command::parse(br#"CONFIG:{"version":2}"#, false),
            Command::Config(br#"{"version":2}"#)
        );
        assert_eq!(Command::parse(b"CONFIG?", false), Command::ConfigQuery);
        assert_eq!(Command::parse(b"STATE?", false), Command::StateQuery);
        assert_eq!(Command::parse(b"RESTART!!", false), Command::Restart);
        assert_eq!(Command::parse(b"REBOOT!", false), Command::Reboot);
        assert_eq!(
            Command::parse(br#"NEW_CODE:{"SIZE":1}"#, false),
            Command::NewCode(br#"{"SIZE":1}"#)
        );
    }

    #[test]
    fn test_case_and_prefix_rules() {
        assert_eq!(Command::parse(b"state?", false), Command::Unknown(b"state?"));
        assert_eq!(Command::parse(b"RESTART!", false), Command::Unknown(b"RESTART!"));
        assert_eq!(Command::parse(b"STATE? please", false), Command::StateQuery);
        assert_eq!(Command::parse(b"", false), Command::Unknown(b""));
    }

    #[test]
    fn test_transfer_captures_payloads() {
        assert_eq!(Command::parse(b"STATE?", true), Command::Firmware(b"STATE?"));
        assert_eq!(Command::parse(&[0xE9, 0x03], true), Command::Firmware(&[0xE9, 0x03]));
        assert_eq!(
            Command::parse(b"NEW_CODE:{}", true),
            Command::NewCode(b"{}")
        );
    }
}
