//! Read-side queries over a synchronized history.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use relay_history::{
    HistoryQuery, InMemoryHistoryStore, NodeIdentity, ReferenceInstant, RelayRecord,
    SnapshotHeader, SyncEngine,
};

const ALPHA: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const BRAVO: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, day, 0, 0, 0).unwrap()
}

fn relay(fingerprint: &str, country: &str, or_address: &str, contact: &str) -> RelayRecord {
    RelayRecord {
        fingerprint: fingerprint.to_string(),
        nickname: Some(format!("n{}", &fingerprint[..4])),
        or_addresses: vec![or_address.to_string()],
        country: Some(country.to_string()),
        platform: Some("Tor 0.4.8.12 on FreeBSD".to_string()),
        contact: Some(contact.to_string()),
        ..RelayRecord::default()
    }
}

fn seeded() -> HistoryQuery {
    let store = Arc::new(InMemoryHistoryStore::new());
    let engine = SyncEngine::with_defaults(store.clone());
    let header = SnapshotHeader::default();

    engine
        .run(
            &header,
            vec![
                relay(ALPHA, "de", "203.0.113.1:9001", "Alice <alice@example.net>"),
                relay(BRAVO, "fr", "203.0.113.2:443", "bob@example.com"),
            ],
            ReferenceInstant::new(at(1)),
        )
        .unwrap();
    // ALPHA moves to France and to a new address.
    engine
        .run(
            &header,
            vec![
                relay(ALPHA, "fr", "203.0.113.9:9001", "Alice <alice@example.net>"),
                relay(BRAVO, "fr", "203.0.113.2:443", "bob@example.com"),
            ],
            ReferenceInstant::new(at(2)),
        )
        .unwrap();

    HistoryQuery::new(store)
}

fn fingerprints(views: &[relay_history::RelayView]) -> Vec<&str> {
    views.iter().map(|v| v.version.node.as_str()).collect()
}

#[test]
fn test_by_country_uses_current_versions() {
    let query = seeded();
    assert_eq!(fingerprints(&query.by_country("fr").unwrap()), vec![ALPHA, BRAVO]);
    assert!(query.by_country("de").unwrap().is_empty());

    let views = query.by_country("fr").unwrap();
    assert_eq!(views[0].country_name.as_deref(), Some("FR"));
    assert_eq!(views[0].attributes.platform.as_deref(), Some("Tor 0.4.8.12 on FreeBSD"));
}

#[test]
fn test_by_country_rejects_malformed_codes() {
    let query = seeded();
    assert!(query.by_country("FR").unwrap().is_empty());
    assert!(query.by_country("fra").unwrap().is_empty());
    assert!(query.by_country("").unwrap().is_empty());
}

#[test]
fn test_by_address_includes_past_addresses() {
    let query = seeded();
    let views = query.by_address("203.0.113.1").unwrap();
    assert_eq!(fingerprints(&views), vec![ALPHA]);
    // The view is the node's current version.
    assert_eq!(views[0].version.inserted_at, at(2));

    assert_eq!(fingerprints(&query.by_address("203.0.113.2").unwrap()), vec![BRAVO]);
    assert!(query.by_address("203.0.113.77").unwrap().is_empty());
    assert!(query.by_address("not an address").unwrap().is_empty());
}

#[test]
fn test_by_contact_is_case_insensitive_substring() {
    let query = seeded();
    assert_eq!(fingerprints(&query.by_contact("ALICE@").unwrap()), vec![ALPHA]);
    assert_eq!(fingerprints(&query.by_contact("example").unwrap()), vec![ALPHA, BRAVO]);
    assert!(query.by_contact("carol").unwrap().is_empty());
    assert!(query.by_contact("  ").unwrap().is_empty());
}

#[test]
fn test_as_of_and_history() {
    let query = seeded();
    let alpha = NodeIdentity::new(ALPHA).unwrap();

    let then = query.as_of(&alpha, at(1)).unwrap().unwrap();
    assert_eq!(then.attributes.country.as_ref().map(|c| c.as_str()), Some("de"));
    assert_eq!(then.addresses.len(), 1);
    assert_eq!(then.addresses[0].address.to_string(), "203.0.113.1");

    let now = query.as_of(&alpha, at(3)).unwrap().unwrap();
    assert_eq!(now.attributes.country.as_ref().map(|c| c.as_str()), Some("fr"));
    assert_eq!(now.addresses[0].address.to_string(), "203.0.113.9");

    assert!(query
        .as_of(&alpha, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        .unwrap()
        .is_none());

    let history = query.history(&alpha).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].version.inserted_at < history[1].version.inserted_at);

    let bravo = NodeIdentity::new(BRAVO).unwrap();
    let history = query.history(&bravo).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version.last_confirmed_at, at(2));
}
