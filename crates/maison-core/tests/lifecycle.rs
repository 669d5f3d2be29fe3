mod common;

use common::*;
use embassy_time::Duration;
use maison_core::lifecycle::{Application, Context, MAX_SLEEP, MIN_SLEEP, Next, State, UserResult};
use maison_core::persistence::STATE_RECORD_LEN;
use maison_core::platform::ResetReason;
use maison_core::Features;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn test_startup_snapshot_then_power_off() {
    let mut app = Scripted::idle();
    let mut node = boot(battery_options(), hardware(), &app);
    assert_eq!(node.persistent().state, State::Startup);

    let next = node.activate(&mut app).unwrap();
    assert_eq!(
        next,
        Next::PowerOff {
            duration: HOUR,
            radio_on_wake: false
        }
    );
    assert_eq!(node.persistent().state, State::WaitForEvent);

    let broker = node.net().broker();
    assert_eq!(broker.subscriptions, [ctrl_topic()]);
    assert_eq!(broker.client_ids, ["client-DOOR"]);
    let snapshots = broker.sent_on("maison/DOOR/state");
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].contains(r#""msg_type":"STARTUP""#));
    assert!(snapshots[0].contains(r#""mac":"5C:CF:7F:01:02:03""#));
    assert!(snapshots[0].contains(r#""state":1"#));
}

#[test]
fn test_state_survives_deep_sleep() {
    let mut app = Scripted::idle();
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    let node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    let mem = node.persistent();
    assert_eq!(mem.state, State::WaitForEvent);
    assert_eq!(mem.return_state, State::WaitForEvent);
    // 2 s of message polling awake, then the hour of sleep.
    assert_eq!(mem.one_hour_step_count, 3_602_000);
    assert_eq!(mem.elapse_time, 3_602_000_000);
}

#[test]
fn test_waiting_nodes_stay_offline() {
    let mut app = Scripted::idle();
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    let connects = node.net().broker().connects;
    node.activate(&mut app).unwrap();

    assert!(!node.network_allowed());
    assert_eq!(node.net().broker().connects, connects);
    assert_eq!(node.net().wifi().begins, 0);
}

#[test]
fn test_hours_24_visited_once_per_day() {
    let options = || battery_options().with_features(Features::BATTERY_POWER | Features::WATCHDOG_24H);
    let mut app = Scripted::idle();
    let mut node = boot(options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    let mut visits = 0;
    for _ in 0..40 {
        node = boot(options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
        if node.persistent().state == State::Hours24 {
            visits += 1;
            assert_eq!(node.persistent().return_state, State::WaitForEvent);
        }
        node.activate(&mut app).unwrap();
    }

    assert_eq!(visits, 1);
    assert_eq!(node.persistent().state, State::WaitForEvent);
    assert_eq!(app.seen.iter().filter(|s| **s == State::Hours24).count(), 1);

    let watchdogs = node
        .net()
        .broker()
        .sent_on("maison/DOOR/state")
        .into_iter()
        .filter(|m| m.contains(r#""msg_type":"WATCHDOG""#))
        .count();
    assert_eq!(watchdogs, 1);
}

#[test]
fn test_event_processing_sleeps_short() {
    let mut app = Scripted::new(
        &[UserResult::Completed, UserResult::NewEvent],
        UserResult::Completed,
    );
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    // The event is seen while waiting, so that sleep is still the long one.
    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    let next = node.activate(&mut app).unwrap();
    assert_eq!(node.persistent().state, State::ProcessEvent);
    assert_eq!(
        next,
        Next::PowerOff {
            duration: HOUR,
            radio_on_wake: true
        }
    );

    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    let next = node.activate(&mut app).unwrap();
    assert_eq!(node.persistent().state, State::WaitEndEvent);
    assert_eq!(
        next,
        Next::PowerOff {
            duration: Duration::from_secs(5),
            radio_on_wake: false
        }
    );
}

#[test]
fn test_requested_sleep_kept_when_equal_to_default() {
    let mut app = Scripted::new(
        &[UserResult::Completed, UserResult::NewEvent],
        UserResult::Completed,
    );
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    app.sleep = Some(HOUR);
    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    assert_eq!(
        node.activate(&mut app).unwrap(),
        Next::PowerOff {
            duration: HOUR,
            radio_on_wake: true
        }
    );

    // Also honoured in a short-sleep state.
    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    assert_eq!(
        node.activate(&mut app).unwrap(),
        Next::PowerOff {
            duration: HOUR,
            radio_on_wake: false
        }
    );
}

#[test]
fn test_zero_sleep_wakes_almost_immediately() {
    let mut app = Scripted::idle();
    app.sleep = Some(Duration::from_ticks(0));
    let mut node = boot(battery_options(), hardware(), &app);

    let next = node.activate(&mut app).unwrap();
    assert_eq!(
        next,
        Next::PowerOff {
            duration: MIN_SLEEP,
            radio_on_wake: false
        }
    );
    assert_eq!(node.persistent().one_hour_step_count, 2_000 + 100);
}

#[test]
fn test_long_sleep_clamped() {
    let mut app = Scripted::idle();
    app.sleep = Some(Duration::from_secs(10_000));
    let mut node = boot(battery_options(), hardware(), &app);

    match node.activate(&mut app).unwrap() {
        Next::PowerOff { duration, .. } => {
            assert_eq!(duration, MAX_SLEEP);
            assert_eq!(duration.as_secs(), 4294);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_corrupt_memory_reinitialized() {
    let mut app = Scripted::new(&[UserResult::Completed, UserResult::NewEvent], UserResult::Completed);
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();
    let mut node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &app);
    node.activate(&mut app).unwrap();
    assert_eq!(node.persistent().state, State::ProcessEvent);

    let mut parts = power_cycle(node, ResetReason::DeepSleepWake);
    parts.memory.as_bytes_mut()[STATE_RECORD_LEN - 1] ^= 0x10;

    let node = boot(battery_options(), parts, &app);
    assert_eq!(node.persistent().state, State::Startup);
    assert_eq!(node.persistent().return_state, State::WaitForEvent);
    assert_eq!(node.persistent().lost_count, 0);
}

#[test]
fn test_hard_reset_starts_over() {
    let mut app = Scripted::idle();
    let mut node = boot(battery_options(), hardware(), &app);
    node.activate(&mut app).unwrap();

    let node = boot(battery_options(), power_cycle(node, ResetReason::Watchdog), &app);
    assert_eq!(node.persistent().state, State::Startup);
    assert_eq!(node.persistent().one_hour_step_count, 0);
}

#[derive(Serialize, Deserialize, Default)]
struct Wakes {
    count: u32,
}

struct WakeCounter;

impl Application for WakeCounter {
    fn process(&mut self, ctx: &mut Context<'_>, _state: State) -> UserResult {
        let mut wakes: Wakes = ctx.load_user().unwrap();
        wakes.count += 1;
        ctx.store_user(&wakes).unwrap();
        UserResult::Completed
    }
}

#[test]
fn test_user_memory_carried_over() {
    let idle = Scripted::idle();
    let mut app = WakeCounter;
    let mut node = boot(battery_options(), hardware(), &idle);
    node.activate(&mut app).unwrap();

    for _ in 0..2 {
        node = boot(battery_options(), power_cycle(node, ResetReason::DeepSleepWake), &idle);
        node.activate(&mut app).unwrap();
    }

    let wakes: Wakes = postcard::from_bytes(node.user_memory()).unwrap();
    assert_eq!(wakes.count, 3);
}

#[test]
fn test_mains_node_stays_resident() {
    let mut app = Scripted::idle();
    let mut node = boot(mains_options(), hardware(), &app);

    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.persistent().state, State::WaitForEvent);
    assert_eq!(node.persistent().one_hour_step_count, 1);

    node.platform_mut().advance(Duration::from_millis(500));
    assert_eq!(node.activate(&mut app).unwrap(), Next::Continue);
    assert_eq!(node.persistent().one_hour_step_count, 502);
    assert_eq!(node.net().broker().connects, 1);
}
