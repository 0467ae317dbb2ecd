use domain::{
    CanonicalSignal, Deadband, MappingTable, Quality, TagMapping, TagSample, TagValue, ValueRange,
};

fn mapping(address: &str, signal: &str) -> TagMapping {
    TagMapping::new("press-01", address, CanonicalSignal::parse(signal).expect("signal"))
}

#[test]
fn bad_sample_never_carries_value() {
    let sample = TagSample::new("press-01", "40001", TagValue::Int(7), Quality::Bad, 1);
    assert_eq!(sample.value, TagValue::Null);
}

#[test]
fn quality_codes_round_trip_thresholds() {
    assert_eq!(Quality::from_code(192), Quality::Good);
    assert_eq!(Quality::from_code(100), Quality::Uncertain);
    assert_eq!(Quality::from_code(12), Quality::Bad);
    assert!(Quality::Bad < Quality::Uncertain);
}

#[test]
fn identity_scale_keeps_integer_type() {
    let mut m = mapping("40001", "counter.good");
    assert_eq!(m.apply(&TagValue::UInt(12)), TagValue::UInt(12));

    m.scale = 0.1;
    m.offset = -2.0;
    assert_eq!(m.apply(&TagValue::Int(250)), TagValue::Float(23.0));
}

#[test]
fn deadband_absolute_and_percent() {
    let abs = Deadband::Absolute(0.5);
    assert!(!abs.exceeded(&TagValue::Float(10.0), &TagValue::Float(10.4)));
    assert!(abs.exceeded(&TagValue::Float(10.0), &TagValue::Float(10.6)));

    let pct = Deadband::Percent(5.0);
    assert!(!pct.exceeded(&TagValue::Float(100.0), &TagValue::Float(104.0)));
    assert!(pct.exceeded(&TagValue::Float(100.0), &TagValue::Float(106.0)));
    assert!(pct.exceeded(&TagValue::Float(0.0), &TagValue::Float(0.1)));
    assert!(!pct.exceeded(&TagValue::Float(0.0), &TagValue::Float(0.0)));
}

#[test]
fn range_is_inclusive() {
    let range = ValueRange {
        min: Some(0.0),
        max: Some(100.0),
    };
    assert!(range.contains(&TagValue::Float(100.0)));
    assert!(!range.contains(&TagValue::Float(100.5)));
    assert!(range.contains(&TagValue::Text("n/a".to_string())));
}

#[test]
fn table_lookup_by_machine_and_address() {
    let table = MappingTable::new(
        vec![mapping("40001", "counter.good"), mapping("00001", "state.run")],
        3,
    );
    assert_eq!(table.version(), 3);
    assert_eq!(
        table.get("press-01", "00001").map(|m| m.signal.as_str()),
        Some("state.run")
    );
    assert!(table.get("press-02", "00001").is_none());
    assert_eq!(table.for_machine("press-01").count(), 2);
}

#[test]
fn mapping_deserializes_with_defaults() {
    let raw = r#"{"machine_id":"m1","address":"ns=2;s=Temp","signal":"pv.temperature",
        "deadband":{"mode":"absolute","value":0.5}}"#;
    let mapping: TagMapping = serde_json::from_str(raw).expect("mapping");
    assert_eq!(mapping.scale, 1.0);
    assert_eq!(mapping.min_quality, Quality::Uncertain);
    assert_eq!(mapping.deadband, Deadband::Absolute(0.5));
}
