//! End-to-end synchronization tests against the in-memory store.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use relay_history::storage::HistoryStore;
use relay_history::{
    AddressFamily, AddressRole, AddressSlot, DimensionKind, InMemoryHistoryStore, NodeIdentity,
    ReferenceInstant, ReferenceSource, RelayRecord, Snapshot, SnapshotHeader, SyncEngine,
};

const MORIA: &str = "9695DFC35FFEB861329B9F1AB04C46397020CE31";
const TOR26: &str = "847B1F850344D7876491A54892F904934E4EB85D";

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

fn reference(day: u32, hour: u32) -> ReferenceInstant {
    ReferenceInstant::new(at(day, hour))
}

fn relay(fingerprint: &str) -> RelayRecord {
    RelayRecord {
        fingerprint: fingerprint.to_string(),
        nickname: Some("relay".to_string()),
        or_addresses: vec!["192.0.2.10:9001".to_string()],
        exit_addresses: vec!["198.51.100.20".to_string()],
        dir_address: Some("192.0.2.10:9030".to_string()),
        first_seen: Some(at(1, 0)),
        flags: vec!["Fast".to_string(), "Running".to_string(), "Valid".to_string()],
        country: Some("de".to_string()),
        country_name: Some("Germany".to_string()),
        region_name: Some("Hesse".to_string()),
        city_name: Some("Frankfurt am Main".to_string()),
        platform: Some("Tor 0.4.8.10 on Linux".to_string()),
        version: Some("0.4.8.10".to_string()),
        contact: Some("admin <admin AT example DOT org>".to_string()),
        exit_policy: Some(vec!["accept *:443".to_string(), "reject *:*".to_string()]),
        exit_policy_summary: Some(serde_json::json!({"accept": ["443"]})),
        ..RelayRecord::default()
    }
}

fn setup() -> (Arc<InMemoryHistoryStore>, SyncEngine) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let store = Arc::new(InMemoryHistoryStore::new());
    let engine = SyncEngine::with_defaults(store.clone());
    (store, engine)
}

fn node(fp: &str) -> NodeIdentity {
    NodeIdentity::new(fp).unwrap()
}

fn slot(role: AddressRole) -> AddressSlot {
    AddressSlot::new(role, AddressFamily::V4)
}

#[test]
fn test_same_snapshot_twice_writes_nothing() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    let records = vec![relay(MORIA), relay(TOR26)];

    let first = engine.run(&header, records.clone(), reference(1, 12)).unwrap();
    assert_eq!(first.superseded, 2);
    assert_eq!(first.presence_inserted, 6);

    let counts = store.counts();
    let before = store.stats();
    let second = engine.run(&header, records, reference(1, 12)).unwrap();

    assert_eq!(second.confirmed, 2);
    assert!(second.is_noop());
    // Only the import-log row is written.
    assert_eq!(store.stats().writes - before.writes, 1);
    assert_eq!(store.counts().node_versions, counts.node_versions);
    assert_eq!(store.counts().presence, counts.presence);
    assert_eq!(store.counts().dimensions, counts.dimensions);
}

#[test]
fn test_identical_attributes_extend_validity() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();
    let report = engine.run(&header, vec![relay(MORIA)], reference(1, 13)).unwrap();

    assert_eq!(report.extended, 1);
    assert_eq!(report.presence_extended, 3);
    assert_eq!(report.presence_inserted, 0);

    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].inserted_at, at(1, 12));
    assert_eq!(versions[0].last_confirmed_at, at(1, 13));

    let rows = store.node_presence(slot(AddressRole::Exit), &node(MORIA)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].last_confirmed_at, at(1, 13));
}

#[test]
fn test_changed_attribute_supersedes() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();

    let mut changed = relay(MORIA);
    changed.version = Some("0.4.8.11".to_string());
    let report = engine.run(&header, vec![changed], reference(1, 13)).unwrap();
    assert_eq!(report.superseded, 1);

    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].inserted_at, at(1, 12));
    assert_eq!(versions[0].last_confirmed_at, at(1, 12));
    assert_eq!(versions[1].inserted_at, at(1, 13));
    assert_eq!(versions[1].last_confirmed_at, at(1, 13));

    // A new version restarts the address trail.
    let rows = store.node_presence(slot(AddressRole::OnionRouting), &node(MORIA)).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_contact_case_change_is_not_a_change() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();

    let mut shouted = relay(MORIA);
    shouted.contact = Some("ADMIN <ADMIN AT EXAMPLE DOT ORG>".to_string());
    let report = engine.run(&header, vec![shouted], reference(1, 13)).unwrap();
    assert_eq!(report.extended, 1);
    assert_eq!(store.counts().node_versions, 1);
}

#[test]
fn test_dimension_values_deduplicated() {
    let (store, engine) = setup();
    let fingerprints: Vec<String> = (0..10).map(|i| format!("{i:040X}")).collect();
    let records: Vec<RelayRecord> = fingerprints.iter().map(|fp| relay(fp)).collect();
    let report = engine
        .run(&SnapshotHeader::default(), records, reference(1, 12))
        .unwrap();

    assert_eq!(report.superseded, 10);
    for kind in DimensionKind::ALL {
        let rows = store.load_dimensions(kind).unwrap();
        let expected = usize::from(kind != DimensionKind::ExitPolicyV6Summary);
        assert_eq!(rows.len(), expected, "{kind}");
    }
    assert_eq!(store.load_countries().unwrap().len(), 1);
    // Seven dimension rows plus one country.
    assert_eq!(report.dimension_rows_created, 8);
}

#[test]
fn test_exit_change_only_touches_exit_table() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();

    let mut moved = relay(MORIA);
    moved.exit_addresses = vec!["198.51.100.21".to_string()];
    let report = engine.run(&header, vec![moved], reference(1, 13)).unwrap();
    assert_eq!(report.extended, 1);
    assert_eq!(report.presence_inserted, 1);
    assert_eq!(report.presence_extended, 2);

    let exits = store.node_presence(slot(AddressRole::Exit), &node(MORIA)).unwrap();
    assert_eq!(exits.len(), 2);
    assert_eq!(exits[0].last_confirmed_at, at(1, 12));
    assert_eq!(exits[1].address.to_string(), "198.51.100.21");

    let onion = store.node_presence(slot(AddressRole::OnionRouting), &node(MORIA)).unwrap();
    assert_eq!(onion.len(), 1);
    assert_eq!(onion[0].last_confirmed_at, at(1, 13));
}

#[test]
fn test_port_change_inserts_presence_row() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();

    let mut moved = relay(MORIA);
    moved.or_addresses = vec!["192.0.2.10:443".to_string()];
    engine.run(&header, vec![moved], reference(1, 13)).unwrap();

    let rows = store.node_presence(slot(AddressRole::OnionRouting), &node(MORIA)).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].port, Some(9001));
    assert_eq!(rows[0].last_confirmed_at, at(1, 12));
    assert_eq!(rows[1].port, Some(443));
    assert_eq!(rows[1].inserted_at, at(1, 13));
}

#[test]
fn test_ipv6_addresses_are_canonical() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    let mut first = relay(MORIA);
    first.or_addresses = vec!["[2001:0db8:0000:0000::0001]:9001".to_string()];
    engine.run(&header, vec![first], reference(1, 12)).unwrap();

    let mut second = relay(MORIA);
    second.or_addresses = vec!["[2001:db8::1]:9001".to_string()];
    let report = engine.run(&header, vec![second], reference(1, 13)).unwrap();
    assert_eq!(report.presence_inserted, 0);

    let or6 = AddressSlot::new(AddressRole::OnionRouting, AddressFamily::V6);
    let rows = store.node_presence(or6, &node(MORIA)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].address.to_string(), "2001:db8::1");
    assert_eq!(rows[0].last_confirmed_at, at(1, 13));
}

#[test]
fn test_retroactive_import_never_regresses() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(3, 0)).unwrap();

    // An older snapshot with different attributes.
    let mut older = relay(MORIA);
    older.platform = Some("Tor 0.4.7.16 on Linux".to_string());
    let report = engine.run(&header, vec![older], reference(1, 0)).unwrap();
    assert_eq!(report.superseded, 1);

    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].inserted_at, at(1, 0));
    assert_eq!(versions[1].inserted_at, at(3, 0));
    assert_eq!(versions[1].last_confirmed_at, at(3, 0));

    // The current version is still the newest one.
    let current = store.latest_node_versions(at(4, 0)).unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].inserted_at, at(3, 0));

    // Re-importing in between extends the version valid at that instant.
    let mut older_again = relay(MORIA);
    older_again.platform = Some("Tor 0.4.7.16 on Linux".to_string());
    let report = engine.run(&header, vec![older_again], reference(2, 0)).unwrap();
    assert_eq!(report.extended, 1);
    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions[0].last_confirmed_at, at(2, 0));
    assert_eq!(versions[1].last_confirmed_at, at(3, 0));
}

#[test]
fn test_failure_mid_node_rolls_back_only_that_node() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();

    let mut quiet = relay(TOR26);
    quiet.or_addresses.clear();
    quiet.exit_addresses.clear();
    quiet.dir_address = None;

    store.arm_failpoint("insert_presence");
    let err = engine
        .run(&header, vec![quiet.clone(), relay(MORIA)], reference(1, 12))
        .unwrap_err();
    assert!(err.is_execution());
    assert!(err.is_retryable());

    assert_eq!(store.node_versions(&node(TOR26)).unwrap().len(), 1);
    assert!(store.node_versions(&node(MORIA)).unwrap().is_empty());
    assert_eq!(store.counts().presence, 0);

    // The run is idempotent, so repeating it finishes the job.
    store.disarm_failpoint("insert_presence");
    let report = engine
        .run(&header, vec![quiet, relay(MORIA)], reference(1, 12))
        .unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.superseded, 1);
    assert_eq!(store.counts().presence, 3);
}

#[test]
fn test_import_inside_validity_window_adds_parallel_version() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 1)).unwrap();
    engine.run(&header, vec![relay(MORIA)], reference(1, 3)).unwrap();

    // Nothing confirmed at or before 02:00 is visible, so the node looks new.
    let report = engine.run(&header, vec![relay(MORIA)], reference(1, 2)).unwrap();
    assert_eq!(report.superseded, 1);

    let spans: Vec<_> = store
        .node_versions(&node(MORIA))
        .unwrap()
        .iter()
        .map(|v| (v.inserted_at, v.last_confirmed_at))
        .collect();
    assert_eq!(spans, vec![(at(1, 1), at(1, 3)), (at(1, 2), at(1, 2))]);
}

#[test]
fn test_reimport_at_same_instant_with_changes_writes_nothing() {
    let (store, engine) = setup();
    let header = SnapshotHeader::default();
    engine.run(&header, vec![relay(MORIA)], reference(1, 12)).unwrap();

    // The version row for this instant already exists and is kept as is.
    let mut renamed = relay(MORIA);
    renamed.nickname = Some("renamed".to_string());
    let before = store.stats();
    let report = engine.run(&header, vec![renamed], reference(1, 12)).unwrap();

    assert_eq!(report.confirmed, 1);
    assert_eq!(report.superseded, 0);
    assert_eq!(report.presence_inserted, 0);
    assert!(report.is_noop());
    assert_eq!(store.stats().writes - before.writes, 1);
    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].nickname.as_deref(), Some("relay"));
}

#[test]
fn test_duplicate_record_in_snapshot_is_skipped() {
    let (store, engine) = setup();
    let mut second = relay(MORIA);
    second.nickname = Some("impostor".to_string());
    let report = engine
        .run(&SnapshotHeader::default(), vec![relay(MORIA), second], reference(1, 12))
        .unwrap();
    assert_eq!(report.superseded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.processed(), 2);

    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions[0].nickname.as_deref(), Some("relay"));
}

#[test]
fn test_over_long_value_is_fatal() {
    let (store, engine) = setup();
    let mut noisy = relay(MORIA);
    noisy.nickname = Some("n".repeat(40));
    let err = engine
        .run(&SnapshotHeader::default(), vec![noisy], reference(1, 12))
        .unwrap_err();
    assert!(err.is_execution());
    assert!(!err.is_retryable());
    assert_eq!(store.counts().node_versions, 0);
}

#[test]
fn test_details_document_end_to_end() {
    let (store, engine) = setup();
    let document = r#"{
        "version": "8.0",
        "build_revision": "a1b2c3d",
        "relays_published": "2024-03-01 12:00:00",
        "bridges_published": "2024-03-01 11:41:00",
        "relays": [
            {
                "nickname": "moria1",
                "fingerprint": "9695DFC35FFEB861329B9F1AB04C46397020CE31",
                "or_addresses": ["128.31.0.39:9201", "[2001:db8::39]:9201"],
                "dir_address": "128.31.0.39:9231",
                "last_seen": "2024-03-01 11:00:00",
                "first_seen": "2010-05-06 00:00:00",
                "running": true,
                "flags": ["Authority", "Running", "V2Dir"],
                "country": "us",
                "country_name": "United States of America",
                "platform": "Tor 0.4.9.0-alpha-dev on Linux",
                "consensus_weight": 20
            }
        ]
    }"#;
    let snapshot = Snapshot::from_json(document).unwrap();
    let source = ReferenceSource::FromFilename {
        filename: "/var/lib/onionoo/details-2024-03-01-12-00-00.json".to_string(),
        pattern: None,
    };
    let report = engine.run_snapshot(snapshot, &source).unwrap();
    assert_eq!(report.reference.as_datetime(), at(1, 12));
    assert_eq!(report.superseded, 1);
    assert_eq!(report.presence_inserted, 3);

    let versions = store.node_versions(&node(MORIA)).unwrap();
    assert_eq!(versions[0].payload["consensus_weight"], 20);
    assert_eq!(versions[0].payload["running"], true);
    assert!(versions[0].payload.get("platform").is_none());

    let imports = store.imports().unwrap();
    assert_eq!(imports[0].build_revision.as_deref(), Some("a1b2c3d"));
    assert_eq!(imports[0].relay_count, 1);
}
