//! # Property-Based Tests
//!
//! Identity, idempotence and round-trip invariants of the engine under
//! arbitrary keys and operation sequences, plus the identifier and
//! argument validation boundaries.

use modelgraph_core::graph::Properties;
use modelgraph_core::{
    AttributeSpec, AttributeType, ClassRegistry, ClassSpec, FieldValue, Fields, GraphDriver, MemoryGraph,
    ModelDb, ReferenceSpec, SpecRegistry, Statement, Value, relationship_type,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;

const TRANSMISSION: &str = include_str!("../../../specs/resource_transmission.xml");

fn engine() -> (ModelDb<MemoryGraph>, MemoryGraph) {
    let graph = MemoryGraph::new();
    let specs = SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification");
    (ModelDb::new(specs, graph.clone()), graph)
}

fn unit_args(key: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".to_string(), FieldValue::from(key));
    fields
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..8).prop_map(Op::Create), (0u8..8).prop_map(Op::Delete)]
}

fn is_identifier(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Mostly identifier-shaped names, with arbitrary text mixed in.
fn name() -> impl Strategy<Value = String> {
    prop_oneof!["[A-Za-z_][A-Za-z0-9_]{0,10}", "[A-Za-z0-9_ .$-]{0,8}", "\\PC{0,12}"]
}

/// A seeded store: Unit `kg` and Resource `Iron` measured in it.
fn seeded() -> MemoryGraph {
    let (mut db, graph) = engine();
    let kg = db.create_object("Unit", unit_args("kg")).expect("create");
    let mut args = Fields::new();
    args.insert("name".to_string(), FieldValue::from("Iron"));
    args.insert("density".to_string(), FieldValue::from(7.87));
    args.insert("unit_default".to_string(), FieldValue::from(kg));
    db.create_object("Resource", args).expect("create");
    graph
}

/// Gauge: key, two required attributes, one optional, a required and an optional reference.
fn gauges() -> SpecRegistry {
    SpecRegistry::from_classes([
        ClassSpec::new("Owner").with_attribute("name", AttributeSpec::key()),
        ClassSpec::new("Gauge")
            .with_attribute("code", AttributeSpec::key())
            .with_attribute("a", AttributeSpec::required(AttributeType::Int))
            .with_attribute("b", AttributeSpec::required(AttributeType::Text))
            .with_attribute("c", AttributeSpec::optional(AttributeType::Float))
            .with_reference("owner", ReferenceSpec::mono("Owner").required())
            .with_reference("peer", ReferenceSpec::mono("Gauge")),
    ])
    .expect("valid spec")
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Creating the same key twice yields the same instance and one node.
    #[test]
    fn create_is_idempotent(key in "\\PC{1,24}") {
        let (mut db, graph) = engine();
        let first = db.create_object("Unit", unit_args(&key)).expect("create");
        let second = db.create_object("Unit", unit_args(&key)).expect("create");
        prop_assert!(first.ptr_eq(&second));
        prop_assert_eq!(graph.stats().expect("stats").node_count, 1);
    }

    /// Keys are bound as parameters: any text survives a fresh-register read.
    #[test]
    fn arbitrary_keys_round_trip(key in "\\PC{1,24}", symbol in "\\PC{0,16}") {
        let (mut db, graph) = engine();
        let mut args = unit_args(&key);
        args.insert("symbol".to_string(), FieldValue::from(symbol.as_str()));
        db.create_object("Unit", args).expect("create");

        let specs = SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification");
        let mut fresh = ModelDb::new(specs, graph);
        let loaded = fresh.get_object("Unit", &key, false).expect("get").expect("exists");
        prop_assert_eq!(loaded.key(), key.as_str());
        prop_assert_eq!(loaded.field("symbol").expect("borrow"), Some(FieldValue::from(symbol.as_str())));
    }

    /// After any create/delete sequence the register and the store agree.
    #[test]
    fn register_tracks_store(ops in vec(op(), 1..40)) {
        let (mut db, graph) = engine();
        let mut live = BTreeSet::new();
        for op in ops {
            match op {
                Op::Create(n) => {
                    let key = format!("u{n}");
                    db.create_object("Unit", unit_args(&key)).expect("create");
                    live.insert(key);
                }
                Op::Delete(n) => {
                    let key = format!("u{n}");
                    let deleted = db.delete_object("Unit", &key).is_ok();
                    prop_assert_eq!(deleted, live.remove(&key));
                }
            }
        }
        prop_assert_eq!(graph.stats().expect("stats").node_count, live.len());
        for key in &live {
            prop_assert!(db.register().contains("Unit", key));
        }
        prop_assert_eq!(db.register().len(), live.len());
    }

    /// Only identifier-shaped labels reach statement text.
    #[test]
    fn labels_must_be_identifiers(label in name()) {
        let built = Statement::load_node(&label, "k", false);
        prop_assert_eq!(built.is_ok(), is_identifier(&label));
    }

    /// Property names and relationship types obey the same rule; keys never do.
    #[test]
    fn member_names_must_be_identifiers(member in name(), key in "\\PC{0,12}") {
        let valid = is_identifier(&member);
        let mut properties = Properties::new();
        properties.insert(member.clone(), Value::Int(1));
        prop_assert_eq!(Statement::set_properties("Unit", &key, &properties).is_ok(), valid);
        prop_assert_eq!(Statement::find_nodes("Unit", &properties, &[]).is_ok(), valid);
        prop_assert_eq!(Statement::delete_relationships("Unit", &key, &member, None).is_ok(), valid);
        prop_assert_eq!(
            Statement::delete_relationships("Unit", &key, "UNIT_DEFAULT", Some(&member)).is_ok(),
            valid
        );
        prop_assert!(Statement::detach_delete("Unit", &key).is_ok());
    }

    /// Strict validation passes exactly when every required member is present
    /// and well typed; lenient validation only checks the types.
    #[test]
    fn validation_boundary(mask in 0u8..32, mistyped in any::<bool>()) {
        let specs = gauges();
        let classes = ClassRegistry::from_specs(&specs);
        let owner = classes.create_reduced("Owner", "o1").expect("stub");
        let peer = classes.create_reduced("Gauge", "g0").expect("stub");

        let mut args = Fields::new();
        args.insert("code".to_string(), FieldValue::from("g1"));
        let members: [(&str, FieldValue); 5] = [
            ("a", FieldValue::from(3i64)),
            ("b", FieldValue::from("bar")),
            ("c", FieldValue::from(0.5)),
            ("owner", FieldValue::from(owner)),
            ("peer", FieldValue::from(peer)),
        ];
        for (bit, (member, value)) in members.into_iter().enumerate() {
            if mask & (1 << bit) != 0 {
                args.insert(member.to_string(), value);
            }
        }
        if mistyped {
            args.insert("c".to_string(), FieldValue::from("not a float"));
        }

        let complete = mask & 0b01011 == 0b01011;
        prop_assert_eq!(specs.validate_arguments("Gauge", &args, true), complete && !mistyped);
        prop_assert_eq!(specs.validate_arguments("Gauge", &args, false), !mistyped);
    }

    /// Once an object is full it never reverts to reduced, and its instance
    /// stays the same for every later request.
    #[test]
    fn upgrades_are_monotonic(requests in vec((any::<bool>(), any::<bool>()), 1..24)) {
        let specs = SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification");
        let mut db = ModelDb::new(specs, seeded());
        let mut seen: Vec<(&str, &str, modelgraph_core::ObjectRef)> = Vec::new();
        let mut full: BTreeSet<&str> = BTreeSet::new();

        for (unit, reduced) in requests {
            let (class, key) = if unit { ("Unit", "kg") } else { ("Resource", "Iron") };
            let object = db.get_object(class, key, reduced).expect("get").expect("exists");
            match seen.iter().find(|(c, _, _)| *c == class) {
                Some((_, _, first)) => prop_assert!(object.ptr_eq(first)),
                None => seen.push((class, key, object.clone())),
            }
            if !reduced {
                prop_assert!(!object.mini_mode().expect("borrow"));
                full.insert(class);
            }
            for (class, key, _) in &seen {
                let registered = db.register().get(class, key).expect("registered");
                prop_assert_eq!(registered.mini_mode().expect("borrow"), !full.contains(class));
            }
        }

        for (class, _, object) in &seen {
            if full.contains(class) {
                let before = object.fields().expect("borrow");
                prop_assert!(!object.upgrade(Fields::new()).expect("upgrade"));
                prop_assert_eq!(object.fields().expect("borrow"), before);
            }
        }
    }

    /// Relationship types are the upper-cased reference name.
    #[test]
    fn relationship_type_is_upper_case(name in "[a-z_][a-z0-9_]{0,16}") {
        let rel = relationship_type(&name);
        prop_assert_eq!(&rel, &name.to_uppercase());
        prop_assert_eq!(relationship_type(&rel), rel.clone());
    }

    /// Float attributes come back bit-identical.
    #[test]
    fn float_attributes_round_trip(density in -1.0e12f64..1.0e12) {
        let (mut db, graph) = engine();
        let kg = db.create_object("Unit", unit_args("kg")).expect("create");
        let mut args = Fields::new();
        args.insert("name".to_string(), FieldValue::from("Iron"));
        args.insert("density".to_string(), FieldValue::from(density));
        args.insert("unit_default".to_string(), FieldValue::from(kg));
        db.create_object("Resource", args).expect("create");

        let specs = SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification");
        let mut fresh = ModelDb::new(specs, graph);
        let loaded = fresh.get_object("Resource", "Iron", false).expect("get").expect("exists");
        prop_assert_eq!(loaded.field("density").expect("borrow"), Some(FieldValue::Value(Value::Float(density))));
    }
}
