mod common;

use common::*;
use embassy_time::Instant;
use maison_core::lifecycle::{Next, State, UserResult};
use maison_core::ota::OtaStatus;
use maison_core::platform::{Platform, ResetReason};
use pretty_assertions::assert_eq;

const IMAGE_MD5: &str = "7acedd1a84a4cfcb6e7a16003242945e";

fn config_command(version: u16, device: &str) -> Vec<u8> {
    let mut payload = b"CONFIG:".to_vec();
    payload.extend_from_slice(&config_json(version, device));
    payload
}

fn new_code(app: &str) -> Vec<u8> {
    format!(r#"NEW_CODE:{{"SIZE":100,"APP_NAME":"{app}","MD5":"{IMAGE_MD5}"}}"#).into_bytes()
}

/// Mains node with `messages` waiting on its control topic.
fn node_with(messages: &[&[u8]]) -> Node {
    let mut parts = hardware();
    for message in messages {
        parts.broker.queue(&ctrl_topic(), message);
    }
    boot(mains_options(), parts, &Scripted::idle())
}

#[test]
fn test_newer_config_adopted() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[config_command(4, "FRONT").as_slice()]);
    node.activate(&mut app).unwrap();

    assert_eq!(node.config().version, 4);
    assert_eq!(node.config().device_name.as_str(), "FRONT");

    let broker = node.net().broker();
    assert_eq!(broker.subscriptions, ["maison/FRONT/ctrl"]);
    let echoes = broker.sent_on("maison/FRONT/config");
    assert_eq!(echoes.len(), 1);
    assert!(echoes[0].starts_with(r#"{"device":"FRONT","msg_type":"CONFIG","content":{"version":4"#));

    let files = node.config_manager().files();
    let backup: serde_json::Value =
        serde_json::from_slice(files.get("/config_1.json").unwrap()).unwrap();
    assert_eq!(backup["version"], 3);
    let primary: serde_json::Value =
        serde_json::from_slice(files.get("/config.json").unwrap()).unwrap();
    assert_eq!(primary["device_name"], "FRONT");
}

#[test]
fn test_stale_config_rejected() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[
        config_command(3, "FRONT").as_slice(),
        config_command(2, "BACK").as_slice(),
    ]);
    let writes = node.config_manager().files().write_count();
    node.activate(&mut app).unwrap();

    assert_eq!(node.config().version, 3);
    assert_eq!(node.config().device_name.as_str(), DEVICE);
    assert_eq!(node.config_manager().files().write_count(), writes);

    let broker = node.net().broker();
    assert_eq!(
        broker.sent_on("maison/DOOR/log"),
        [
            "DOOR: Error: Received New Config with wrong version number.",
            "DOOR: Error: Received New Config with wrong version number.",
        ]
    );
    // Each attempt is answered with the config in force.
    let echoes = broker.sent_on("maison/DOOR/config");
    assert_eq!(echoes.len(), 2);
    assert!(echoes.iter().all(|e| e.contains(r#""version":3"#)));
}

#[test]
fn test_unparsable_config_only_logged() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[b"CONFIG:{not json"]);
    node.activate(&mut app).unwrap();

    let broker = node.net().broker();
    let logs = broker.sent_on("maison/DOOR/log");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].starts_with("DOOR: Error: unable to retrieve config"));
    assert!(broker.sent_on("maison/DOOR/config").is_empty());
}

#[test]
fn test_queries_answered() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[b"CONFIG?", b"STATE?"]);
    node.activate(&mut app).unwrap();

    let broker = node.net().broker();
    let config = broker.sent_on("maison/DOOR/config");
    assert_eq!(config.len(), 1);
    assert!(config[0].contains(r#""mqtt_server_name":"broker.local""#));

    let states = broker.sent_on("maison/DOOR/state");
    assert_eq!(states.len(), 2);
    assert!(states[0].contains(r#""msg_type":"STATE""#));
    assert!(states[0].contains(r#""ip":"192.168.1.50""#));
    assert!(states[0].contains(r#""rssi":-58"#));
    assert!(states[1].contains(r#""msg_type":"STARTUP""#));
}

#[test]
fn test_unknown_command_logged() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[b"SELF_DESTRUCT"]);
    node.activate(&mut app).unwrap();

    assert_eq!(
        node.net().broker().sent_on("maison/DOOR/log"),
        ["DOOR: Warning: unknown command."]
    );
    assert_eq!(app.seen, [State::Startup]);
}

#[test]
fn test_restart_skips_decision() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[b"RESTART!!"]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Restart { persist: true });
    assert!(app.seen.is_empty());
    assert_eq!(
        node.net().broker().sent_on("maison/DOOR/log"),
        ["DOOR: Info: Restart requested."]
    );
    assert_eq!(node.net().wifi().disconnects, 1);
}

#[test]
fn test_reboot_does_not_persist() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[b"REBOOT!", b"STATE?"]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Restart { persist: false });
    // Draining stops at the request.
    assert!(node.net().broker().sent_on("maison/DOOR/state").is_empty());
    assert_eq!(node.net().broker().inbox.len(), 1);
}

#[test]
fn test_restart_resumes_state() {
    let mut app = Scripted::new(
        &[UserResult::Completed, UserResult::NewEvent],
        UserResult::Completed,
    );
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();
    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    node.activate(&mut app).unwrap();

    let mut parts = power_cycle(node, ResetReason::DeepSleepWake);
    parts.broker.queue(&ctrl_topic(), b"RESTART!!");
    let mut node = boot(battery_options(), parts, &app);
    assert_eq!(node.activate(&mut app).unwrap(), Next::Restart { persist: true });

    let node = boot(battery_options(), power_cycle(node, ResetReason::Software), &app);
    assert_eq!(node.persistent().state, State::ProcessEvent);
    assert_eq!(node.persistent().one_hour_step_count, 3_602_000 + 3_600_000);
}

#[test]
fn test_firmware_transfer_commits_and_reboots() {
    let image: Vec<u8> = (0..100u8).collect();
    let mut app = Scripted::idle();
    let mut node = node_with(&[new_code("door").as_slice(), &image[..40], &image[40..]]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Restart { persist: false });
    assert_eq!(node.ota().status(), OtaStatus::Committed);

    let slot = node.ota().updater();
    assert_eq!(slot.size, Some(100));
    assert_eq!(slot.staged, image);
    assert!(slot.finalized);
    assert_eq!(
        node.net().broker().sent_on("maison/DOOR/log"),
        [
            "DOOR: Info: new firmware installed, rebooting.",
            "DOOR: Info: Restart requested.",
        ]
    );
}

#[test]
fn test_firmware_for_other_node_ignored() {
    let mut app = Scripted::idle();
    let mut node = node_with(&[new_code("garage").as_slice(), b"\x00\x01\x02"]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.ota().status(), OtaStatus::Idle);
    assert!(node.ota().updater().staged.is_empty());

    let logs = node.net().broker().sent_on("maison/DOOR/log");
    assert_eq!(logs.len(), 2);
    assert!(logs[0].contains("firmware targets garage"));
    assert_eq!(logs[1], "DOOR: Warning: unknown command.");
}

#[test]
fn test_bad_image_discarded() {
    let mut app = Scripted::idle();
    let garbage = [0xAAu8; 100];
    let mut node = node_with(&[new_code("door").as_slice(), &garbage]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.ota().status(), OtaStatus::Aborted);
    assert_eq!(node.ota().updater().aborts, 1);
    assert!(!node.ota().updater().finalized);
}

#[test]
fn test_stalled_transfer_abandoned() {
    let image: Vec<u8> = (0..100u8).collect();
    let mut app = Scripted::idle();
    let mut node = node_with(&[new_code("door").as_slice(), &image[..40]]);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.ota().status(), OtaStatus::Aborted);
    assert_eq!(node.ota().updater().aborts, 1);
    assert_eq!(
        node.net().broker().sent_on("maison/DOOR/log"),
        ["DOOR: Error: Wait for completion too long. Aborted."]
    );
    assert_eq!(app.seen, [State::Startup]);
}

#[test]
fn test_failing_polls_wait_between_attempts() {
    let image: Vec<u8> = (0..100u8).collect();
    let mut app = Scripted::idle();
    let mut node = node_with(&[new_code("door").as_slice(), &image[..40]]);
    node.net_mut().broker_mut().poll_errors = true;

    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.ota().status(), OtaStatus::Aborted);
    // Every failed poll waits its interval, so the transfer reaches its timeout.
    assert!(node.platform().now() >= Instant::from_secs(120));
    assert_eq!(
        node.net().broker().sent_on("maison/DOOR/log"),
        ["DOOR: Error: Wait for completion too long. Aborted."]
    );
}
