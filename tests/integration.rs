//! Integration tests for the table engine.

use nettable::{
    ConnectionEvent, ConnectionId, DataLog, EngineConfig, FileDataLog, FlushOutcome,
    InboundMessage, LogRecord, MemoryDataLog, OutboundMessage, ProtocolVersion, PubSubOption,
    SyncEngine, Timestamp, TopicEvent, TopicListenerConfig, Transport, TransportError, Value,
    ValueType,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(ConnectionId, OutboundMessage)>>,
}

impl RecordingTransport {
    fn messages_for(&self, connection: ConnectionId) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, connection: ConnectionId, message: OutboundMessage) -> Result<(), TransportError> {
        self.sent.lock().push((connection, message));
        Ok(())
    }
}

fn test_engine() -> (SyncEngine, Arc<RecordingTransport>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(RecordingTransport::default());
    let engine = SyncEngine::new(EngineConfig::default(), transport.clone());
    (engine, transport)
}

fn connect(engine: &SyncEngine, version: ProtocolVersion, now: Timestamp) -> ConnectionId {
    let handshake = engine.begin_handshake("10.0.0.7", 5810);
    engine
        .complete_handshake(handshake, "dashboard", version, now)
        .unwrap()
}

fn secs(s: f64) -> Timestamp {
    Timestamp::from_secs_f64(s)
}

// --- Delivery Scenarios ---

#[test]
fn test_default_subscriber_coalesces_to_latest() {
    let (engine, _) = test_engine();
    let publisher = engine.create_publisher("T", "double", json!({})).unwrap();
    let subscriber = engine.subscribe("T", &[]);

    let queue = engine.queue(subscriber).unwrap();
    assert_eq!(queue.capacity(), 1);

    engine.publish(publisher, 1.0f64, secs(1.0)).unwrap();
    assert_eq!(queue.len(), 1);

    engine.publish(publisher, 2.0f64, secs(1.01)).unwrap();
    assert_eq!(queue.len(), 1);

    let drained = engine.read_queue(subscriber).unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(&*drained[0].name, "T");
    assert_eq!(drained[0].value, Value::Double(2.0));
    assert!(queue.is_empty());
    assert!(engine.read_queue(subscriber).unwrap().is_empty());
}

#[test]
fn test_send_all_keeps_most_recent() {
    let (engine, _) = test_engine();
    let publisher = engine.create_publisher("/log", "int64", json!({})).unwrap();
    let subscriber = engine.subscribe(
        "/log",
        &[PubSubOption::SendAll(true), PubSubOption::PollStorage(3)],
    );

    for i in 0..10i64 {
        engine.publish(publisher, i, Timestamp(100 + i as u64)).unwrap();
    }

    let values: Vec<Value> = engine
        .read_queue(subscriber)
        .unwrap()
        .into_iter()
        .map(|u| u.value)
        .collect();
    assert_eq!(values, vec![Value::Integer(7), Value::Integer(8), Value::Integer(9)]);
}

#[test]
fn test_exclude_self_entry() {
    let (engine, _) = test_engine();
    let (subscriber, own) = engine
        .create_entry(
            "/shared",
            "double",
            &[PubSubOption::ExcludeSelf(true), PubSubOption::SendAll(true)],
        )
        .unwrap();
    let other = engine.create_publisher("/shared", "double", json!({})).unwrap();

    for i in 0..5 {
        engine.publish(own, i as f64, Timestamp(10 + i)).unwrap();
        engine.publish(other, 100.0 + i as f64, Timestamp(20 + i)).unwrap();
    }

    let updates = engine.read_queue(subscriber).unwrap();
    assert_eq!(updates.len(), 5);
    assert!(updates.iter().all(|u| u.publisher == other));
}

#[test]
fn test_duplicates_suppressed_then_resumed() {
    let (engine, _) = test_engine();
    let publisher = engine.create_publisher("/dup", "double", json!({})).unwrap();
    let suppressing = engine.subscribe("/dup", &[PubSubOption::SendAll(true)]);
    let keeping = engine.subscribe(
        "/dup",
        &[PubSubOption::SendAll(true), PubSubOption::KeepDuplicates(true)],
    );

    engine.publish(publisher, 1.0f64, Timestamp(1)).unwrap();
    engine.publish(publisher, 1.0f64, Timestamp(2)).unwrap();
    engine.publish(publisher, 3.0f64, Timestamp(3)).unwrap();

    let values: Vec<Value> = engine
        .read_queue(suppressing)
        .unwrap()
        .into_iter()
        .map(|u| u.value)
        .collect();
    assert_eq!(values, vec![Value::Double(1.0), Value::Double(3.0)]);
    assert_eq!(engine.read_queue(keeping).unwrap().len(), 3);
}

#[test]
fn test_prefix_and_topics_only() {
    let (engine, _) = test_engine();
    let all_drive = engine.subscribe("/drive/", &[PubSubOption::PrefixMatch(true)]);
    let names_only = engine.subscribe(
        "/drive/",
        &[PubSubOption::PrefixMatch(true), PubSubOption::TopicsOnly(true)],
    );
    let listener = engine.listen_topics(TopicListenerConfig {
        prefix: "/drive/".into(),
        ..Default::default()
    });

    let left = engine.create_publisher("/drive/left", "double", json!({})).unwrap();
    let right = engine.create_publisher("/drive/right", "double", json!({})).unwrap();
    let arm = engine.create_publisher("/arm", "double", json!({})).unwrap();
    engine.publish(left, 0.5f64, Timestamp(1)).unwrap();
    engine.publish(right, 0.6f64, Timestamp(1)).unwrap();
    engine.publish(arm, 9.0f64, Timestamp(1)).unwrap();

    assert_eq!(engine.read_queue(all_drive).unwrap().len(), 2);
    assert!(engine.read_queue(names_only).unwrap().is_empty());

    let announced: Vec<String> = std::iter::from_fn(|| listener.try_recv().ok())
        .filter_map(|e| match e {
            TopicEvent::Announced { info } => Some(info.name),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec!["/drive/left", "/drive/right"]);
}

#[test]
fn test_prefix_poll_storage_bounds_topics() {
    let (engine, _) = test_engine();
    let subscriber = engine.subscribe(
        "/x/",
        &[PubSubOption::PrefixMatch(true), PubSubOption::PollStorage(2)],
    );

    for i in 0..5 {
        let publisher = engine
            .create_publisher(&format!("/x/{}", i), "double", json!({}))
            .unwrap();
        engine.publish(publisher, i as f64, Timestamp(1 + i)).unwrap();
    }

    let queue = engine.queue(subscriber).unwrap();
    assert_eq!(queue.capacity(), 2);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.dropped(), 3);

    let names: Vec<String> = queue.drain().iter().map(|u| u.name.to_string()).collect();
    assert_eq!(names, vec!["/x/3", "/x/4"]);
}

#[test]
fn test_subscribe_before_publisher_exists() {
    let (engine, _) = test_engine();
    let subscriber = engine.subscribe("/later", &[]);
    assert!(engine.read_queue(subscriber).unwrap().is_empty());

    let publisher = engine.create_publisher("/later", "string", json!({})).unwrap();
    engine.publish(publisher, "ready", Timestamp(5)).unwrap();
    let updates = engine.read_queue(subscriber).unwrap();
    assert_eq!(updates[0].value, Value::String("ready".into()));
}

// --- Connections ---

#[test]
fn test_stale_connection_evicted() {
    let (engine, _) = test_engine();
    let events = engine.connection_registry().listen();
    let connection = connect(&engine, ProtocolVersion::V3_0, secs(1.0));
    assert_eq!(
        engine.connection_registry().get(connection).unwrap().protocol_version,
        ProtocolVersion::V3_0
    );

    assert!(engine.evict_stale(secs(6.0)).is_empty());
    assert_eq!(engine.evict_stale(secs(6.5)), vec![connection]);
    assert!(engine.connection_registry().get(connection).is_none());
    assert!(engine.state(connection).is_none());
    assert!(engine.connections().is_empty());

    assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Connected { .. })));
    assert!(matches!(
        events.try_recv(),
        Ok(ConnectionEvent::Disconnected { id, .. }) if id == connection
    ));
}

#[test]
fn test_activity_keeps_connection_alive() {
    let (engine, _) = test_engine();
    let connection = connect(&engine, ProtocolVersion::V4_0, secs(1.0));

    engine
        .on_receive(connection, InboundMessage::KeepAlive, secs(4.0))
        .unwrap();
    assert!(engine.evict_stale(secs(9.0)).is_empty());
    assert_eq!(engine.evict_stale(secs(9.5)), vec![connection]);
}

#[test]
fn test_flush_cadence_uses_minimum_period() {
    let (engine, transport) = test_engine();
    let slow_pub = engine.create_publisher("/slow", "double", json!({})).unwrap();
    let fast_pub = engine.create_publisher("/fast", "double", json!({})).unwrap();
    let connection = connect(&engine, ProtocolVersion::V4_0, secs(1.0));

    for (subuid, topic, period) in [(1, "/slow", 0.2), (2, "/fast", 0.05)] {
        engine
            .on_receive(
                connection,
                InboundMessage::Subscribe {
                    subuid,
                    topics: vec![topic.into()],
                    options: vec![PubSubOption::Periodic(period)],
                },
                secs(1.0),
            )
            .unwrap();
    }
    assert_eq!(engine.effective_period(connection), Duration::from_millis(50));

    let t0 = secs(2.0);
    engine.publish(slow_pub, 1.0f64, t0).unwrap();
    assert!(matches!(
        engine.flush(connection, t0).unwrap(),
        FlushOutcome::Flushed { messages } if messages > 0
    ));

    let report = engine
        .publish(slow_pub, 2.0f64, Timestamp(t0.0 + 10_000))
        .unwrap();
    assert_eq!(report.flushes, vec![(connection, Duration::from_millis(40))]);

    assert!(matches!(
        engine.flush(connection, Timestamp(t0.0 + 30_000)).unwrap(),
        FlushOutcome::NotDue(_)
    ));
    assert_eq!(
        engine.flush(connection, Timestamp(t0.0 + 50_000)).unwrap(),
        FlushOutcome::Flushed { messages: 1 }
    );

    engine.publish(fast_pub, 3.0f64, Timestamp(t0.0 + 60_000)).unwrap();
    engine
        .on_receive(connection, InboundMessage::Unsubscribe { subuid: 2 }, Timestamp(t0.0 + 60_000))
        .unwrap();
    assert_eq!(engine.effective_period(connection), Duration::from_millis(200));

    let values = transport
        .messages_for(connection)
        .into_iter()
        .filter(|m| matches!(m, OutboundMessage::ValueUpdate { .. }))
        .count();
    assert_eq!(values, 2);
}

#[test]
fn test_oversized_period_is_capped() {
    let (engine, _) = test_engine();
    let publisher = engine.create_publisher("/a", "double", json!({})).unwrap();
    let connection = connect(&engine, ProtocolVersion::V4_0, secs(1.0));
    engine
        .on_receive(
            connection,
            InboundMessage::Subscribe {
                subuid: 1,
                topics: vec!["/a".into()],
                options: vec![PubSubOption::Periodic(1e300)],
            },
            secs(1.0),
        )
        .unwrap();
    assert_eq!(
        engine.effective_period(connection),
        Duration::from_secs_f64(nettable::options::MAX_PERIODIC)
    );

    let report = engine.publish(publisher, 1.0f64, secs(2.0)).unwrap();
    assert_eq!(report.flushes, vec![(connection, Duration::ZERO)]);
    assert!(matches!(
        engine.flush(connection, secs(2.0)).unwrap(),
        FlushOutcome::Flushed { messages } if messages > 0
    ));

    engine.publish(publisher, 2.0f64, secs(3.0)).unwrap();
    assert!(matches!(
        engine.flush(connection, secs(3.0)).unwrap(),
        FlushOutcome::NotDue(_)
    ));
}

#[test]
fn test_version_gates_outbound_kinds() {
    let (engine, transport) = test_engine();
    let v2 = connect(&engine, ProtocolVersion::V2_0, Timestamp(1));
    let v3 = connect(&engine, ProtocolVersion::V3_0, Timestamp(1));

    let publisher = engine.create_publisher("/x", "boolean", json!({})).unwrap();
    engine.publish(publisher, true, Timestamp(2)).unwrap();
    engine.flush(v2, Timestamp(3)).unwrap();
    engine.flush(v3, Timestamp(3)).unwrap();

    engine.release_publisher(publisher).unwrap();
    engine.flush(v2, Timestamp(1_000_000)).unwrap();
    engine.flush(v3, Timestamp(1_000_000)).unwrap();

    let unannounced = |c| {
        transport
            .messages_for(c)
            .iter()
            .any(|m| matches!(m, OutboundMessage::Unannounce { .. }))
    };
    assert!(!unannounced(v2));
    assert!(unannounced(v3));
}

#[test]
fn test_remote_publisher_type_conflict_ignored() {
    let (engine, _) = test_engine();
    let local = engine.create_publisher("/mode", "string", json!({})).unwrap();
    engine.publish(local, "auto", Timestamp(1)).unwrap();
    let connection = connect(&engine, ProtocolVersion::V4_0, Timestamp(1));

    engine
        .on_receive(
            connection,
            InboundMessage::Publish {
                pubuid: 9,
                name: "/mode".into(),
                type_str: "double".into(),
                properties: json!({}),
            },
            Timestamp(2),
        )
        .unwrap();
    engine
        .on_receive(
            connection,
            InboundMessage::ValueUpdate {
                pubuid: 9,
                value: Value::Double(1.0),
                timestamp: Timestamp(3),
            },
            Timestamp(3),
        )
        .unwrap();

    let current = engine.get_value("/mode").unwrap().unwrap();
    assert_eq!(current.value, Value::String("auto".into()));
    assert_eq!(engine.stats().publishers, 1);
}

#[test]
fn test_remote_delete_and_clear() {
    let (engine, _) = test_engine();
    let connection = connect(&engine, ProtocolVersion::V3_0, Timestamp(1));
    engine.create_publisher("/a", "double", json!({})).unwrap();
    engine.create_publisher("/b", "double", json!({})).unwrap();
    engine.create_publisher("/c", "double", json!({"persistent": true})).unwrap();
    engine
        .on_receive(
            connection,
            InboundMessage::SetFlags {
                name: "/c".into(),
                flags: nettable::TopicFlags {
                    persistent: true,
                    retained: false,
                },
            },
            Timestamp(2),
        )
        .unwrap();

    engine
        .on_receive(connection, InboundMessage::DeleteTopic { name: "/a".into() }, Timestamp(3))
        .unwrap();
    let names: Vec<String> = engine.topic_info("", &[]).into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["/b", "/c"]);

    engine
        .on_receive(connection, InboundMessage::ClearTopics, Timestamp(4))
        .unwrap();
    let names: Vec<String> = engine.topic_info("", &[]).into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["/c"]);
}

#[test]
fn test_topic_info_type_filter() {
    let (engine, _) = test_engine();
    engine.create_publisher("/a", "double", json!({})).unwrap();
    engine.create_publisher("/b", "string[]", json!({})).unwrap();
    engine.create_publisher("/c", "struct:Pose2d", json!({})).unwrap();

    let raw: Vec<String> = engine
        .topic_info("", &[ValueType::Raw])
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(raw, vec!["/c"]);
    assert_eq!(engine.topic_info("", &[ValueType::StringArray]).len(), 1);
}

// --- Data Logging ---

#[test]
fn test_data_log_mirrors_values() {
    let (engine, _) = test_engine();
    let log = Arc::new(MemoryDataLog::new());
    let publisher = engine.create_publisher("/drive/speed", "double", json!({})).unwrap();
    engine.publish(publisher, 1.0f64, Timestamp(1)).unwrap();

    let logger = engine.start_data_log(log.clone(), "/drive/", "NT:/drive/");
    engine.publish(publisher, 2.0f64, Timestamp(2)).unwrap();
    engine.delete_topic("/drive/speed").unwrap();
    assert!(engine.stop_data_log(logger));
    assert!(!engine.stop_data_log(logger));

    let records = log.records();
    assert_eq!(records.len(), 4);
    match &records[0] {
        LogRecord::Start {
            name,
            type_str,
            metadata,
            ..
        } => {
            assert_eq!(name, "NT:/drive/speed");
            assert_eq!(type_str, "double");
            assert_eq!(metadata, r#"{"source":"NT"}"#);
        }
        other => panic!("unexpected record {:?}", other),
    }
    assert!(matches!(records[3], LogRecord::Finish { .. }));
    assert_eq!(log.open_entries(), 0);
}

#[test]
fn test_file_data_log_through_engine() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("table.log");
    let (engine, _) = test_engine();
    let log = Arc::new(FileDataLog::open(&path).unwrap());
    let logger = engine.start_data_log(log.clone() as Arc<dyn DataLog>, "", "");

    let publisher = engine.create_publisher("/count", "int64", json!({})).unwrap();
    for i in 0..5i64 {
        engine.publish(publisher, i, Timestamp(1 + i as u64)).unwrap();
    }
    engine.stop_data_log(logger);
    log.sync().unwrap();

    let appended = log
        .records()
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r, LogRecord::Append { .. }))
        .count();
    assert_eq!(appended, 5);
}
