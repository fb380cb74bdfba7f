//! Gateway supervision tests on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use common::{
    IDENT_ADDRESS, Journal, MEASUREMENT_ADDRESS, Plant, RecordingBusConnector, ScriptedConnector,
    gateway, registry, since,
};
use meterlink::clock::EpochClock;
use meterlink::codec::Value;
use meterlink::gateway::{GatewayError, GatewaySupervisor};

const SERIAL_TOPIC_1: &str = "meterlink/test_meter/1001/info/serial_number";
const SERIAL_TOPIC_2: &str = "meterlink/test_meter/1002/info/serial_number";

fn supervisor(
    units: &[u8],
    connector: Arc<ScriptedConnector>,
    journal: Arc<Journal>,
) -> GatewaySupervisor<ScriptedConnector, common::RecordingBus> {
    GatewaySupervisor::new(
        gateway("garage", units),
        connector,
        Arc::new(RecordingBusConnector::bus(journal)),
        Arc::new(registry()),
    )
    .with_prefix("meterlink/")
    .with_reconnect_delay(Duration::from_secs(1))
    .with_clock(EpochClock::starting_at(0.0))
}

#[tokio::test(start_paused = true)]
async fn test_two_failed_connects_then_sessions_start() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    let connector = Arc::new(ScriptedConnector::failing(plant.clone(), 2));
    let journal = Journal::new();

    let start = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector.clone(), journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let attempts: Vec<_> = connector
        .attempts()
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);

    let identified: Vec<_> = journal
        .times(SERIAL_TOPIC_1)
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(identified, vec![2]);

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_identification_failure_leaves_sibling_running() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    plant.add_meter(2, 1002);
    // One register where the serial needs two.
    plant.set(1, 0, vec![0x0001]);

    let connector = Arc::new(ScriptedConnector::new(plant.clone()));
    let journal = Journal::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1, 2], connector.clone(), journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(journal.count(SERIAL_TOPIC_1), 0);
    assert!(plant.reads(1).iter().all(|(address, _)| *address == 0));

    assert_eq!(journal.count(SERIAL_TOPIC_2), 1);
    // Voltage at t = 0, 5 and 10.
    assert_eq!(journal.count("meterlink/test_meter/1002/voltage"), 3);

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

fn seconds(start: Instant, times: Vec<Instant>) -> Vec<u64> {
    times.into_iter().map(|at| since(start, at).as_secs()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_identification_retried_after_reconnect() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    // Short identification block on the first connection only.
    plant.script(1, IDENT_ADDRESS, vec![vec![0x0001]]);

    let connector = Arc::new(ScriptedConnector::new(plant.clone()));
    let journal = Journal::new();

    let start = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector.clone(), journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!task.is_finished());

    assert_eq!(seconds(start, connector.attempts()), vec![0, 1]);
    assert_eq!(seconds(start, journal.times(SERIAL_TOPIC_1)), vec![1]);
    assert_eq!(
        seconds(start, journal.times("meterlink/test_meter/1001/voltage")),
        vec![1]
    );

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_block_is_skipped_for_one_cycle() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    // The first measurement read is one register short.
    plant.script(1, MEASUREMENT_ADDRESS, vec![vec![1234]]);

    let connector = Arc::new(ScriptedConnector::new(plant.clone()));
    let journal = Journal::new();

    let start = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector.clone(), journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!task.is_finished());
    assert_eq!(connector.attempts().len(), 1);

    let topic = |suffix: &str| format!("meterlink/test_meter/1001/{}", suffix);
    // The other block still publishes during the skipped cycle.
    assert_eq!(seconds(start, journal.times(&topic("power"))), vec![0, 5, 10]);
    assert_eq!(seconds(start, journal.times(&topic("voltage"))), vec![5, 10]);
    assert_eq!(seconds(start, journal.times(&topic("energy/import"))), vec![5]);

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_connection_error_mid_poll_reconnects_all_sessions() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    plant.add_meter(2, 1002);
    // Reads of unit 2: identification, two blocks at t=0, first block at t=5.
    plant.fail_read_once(2, 4);

    let connector = Arc::new(ScriptedConnector::new(plant.clone()));
    let journal = Journal::new();

    let start = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1, 2], connector.clone(), journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_millis(6500)).await;

    let attempts: Vec<_> = connector
        .attempts()
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(attempts, vec![0, 6]);

    // Both sessions restarted and re-identified on the new connection.
    for topic in [SERIAL_TOPIC_1, SERIAL_TOPIC_2] {
        let times: Vec<_> = journal
            .times(topic)
            .into_iter()
            .map(|at| since(start, at).as_secs())
            .collect();
        assert_eq!(times, vec![0, 6], "{}", topic);
    }

    // Nobody polled while disconnected.
    for unit in [1, 2] {
        assert!(plant.reads(unit).iter().all(|(_, at)| {
            let at = since(start, *at);
            at < Duration::from_millis(5500) || at >= Duration::from_secs(6)
        }));
    }

    // Throttle state starts empty after reconnecting.
    let energy: Vec<_> = journal
        .times("meterlink/test_meter/1001/energy/import")
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(energy, vec![0, 6]);

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_throttled_emission() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    let connector = Arc::new(ScriptedConnector::new(plant.clone()));
    let journal = Journal::new();

    let start = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector, journal.clone()).run(stop_rx));

    tokio::time::sleep(Duration::from_secs(132)).await;

    let energy: Vec<_> = journal
        .times("meterlink/test_meter/1001/energy/import")
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(energy, vec![0, 60, 120]);

    let voltage: Vec<_> = journal
        .times("meterlink/test_meter/1001/voltage")
        .into_iter()
        .map(|at| since(start, at).as_secs())
        .collect();
    assert_eq!(voltage, (0..=130).step_by(5).collect::<Vec<u64>>());

    // Reads follow the earliest deadline, not the longest interval.
    let polls = plant
        .reads(1)
        .iter()
        .filter(|(address, _)| *address == MEASUREMENT_ADDRESS)
        .count();
    assert_eq!(polls, voltage.len());

    let messages = journal.messages();
    let serial = messages
        .iter()
        .find(|message| message.topic == SERIAL_TOPIC_1)
        .unwrap();
    assert!(serial.retain);
    assert_eq!(serial.payload, Value::Unsigned(1001));

    let first_energy = messages
        .iter()
        .find(|message| message.topic.ends_with("energy/import"))
        .unwrap();
    assert!(!first_energy.retain);
    assert_eq!(first_energy.payload, Value::Float(123.4));

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_sentinel_is_published_as_null() {
    let plant = Plant::new();
    plant.add_meter(1, 1001);
    plant.set(1, MEASUREMENT_ADDRESS, vec![0xFFFF, 2300]);
    let connector = Arc::new(ScriptedConnector::new(plant));
    let journal = Journal::new();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector, journal.clone()).run(stop_rx));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let energy = journal
        .messages()
        .into_iter()
        .find(|message| message.topic == "meterlink/test_meter/1001/energy/import")
        .unwrap();
    assert_eq!(energy.payload, Value::Null);

    stop_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_devices_exits_without_connecting() {
    let connector = Arc::new(ScriptedConnector::new(Plant::new()));
    let (_stop_tx, stop_rx) = watch::channel(false);

    let result = supervisor(&[], connector.clone(), Journal::new())
        .run(stop_rx)
        .await;

    assert_eq!(result, Ok(()));
    assert!(connector.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_driver_is_fatal() {
    let connector = Arc::new(ScriptedConnector::new(Plant::new()));
    let mut descriptor = gateway("garage", &[1]);
    descriptor.devices[0].driver = "janitza".to_string();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = GatewaySupervisor::new(
        descriptor,
        connector.clone(),
        Arc::new(RecordingBusConnector::bus(Journal::new())),
        Arc::new(registry()),
    )
    .run(stop_rx)
    .await;

    assert!(matches!(result, Err(GatewayError::Config { .. })));
    assert!(connector.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff() {
    let connector = Arc::new(ScriptedConnector::failing(Plant::new(), 100));
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor(&[1], connector.clone(), Journal::new()).run(stop_rx));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    stop_tx.send(true).unwrap();

    assert_eq!(task.await.unwrap(), Ok(()));
    assert_eq!(connector.attempts().len(), 4);
}
