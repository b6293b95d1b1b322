//! # Command Interpreter Tests
//!
//! Commands run through `Interpreter::process` over the resource
//! transmission model, plus a redb-backed CLI session.

#![allow(clippy::unwrap_used, clippy::panic)]

use modelgraph::cli::Session;
use modelgraph::config::{AppConfig, Backend};
use modelgraph::interpreter::{Interpreter, ScopeKind, ScopeValue};
use modelgraph_core::{GraphDriver, MemoryGraph, ModelDb, SpecRegistry};

const TRANSMISSION: &str = include_str!("../../../specs/resource_transmission.xml");

fn interpreter() -> (Interpreter<MemoryGraph>, MemoryGraph) {
    let specs = SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification");
    let graph = MemoryGraph::new();
    (Interpreter::new(ModelDb::new(specs, graph.clone())), graph)
}

fn run(interpreter: &mut Interpreter<MemoryGraph>, line: &str) -> String {
    let response = interpreter.process(line);
    assert!(response.ok, "'{}' failed: {}", line, response.result);
    response.result
}

fn fails(interpreter: &mut Interpreter<MemoryGraph>, line: &str) -> String {
    let response = interpreter.process(line);
    assert!(!response.ok, "'{}' should fail, got: {}", line, response.result);
    response.result
}

fn seed(interpreter: &mut Interpreter<MemoryGraph>) {
    run(interpreter, "create Unit name=kg symbol=kg");
    run(interpreter, "create Resource name=Iron density=7.87 unit_default=kg");
}

#[test]
fn create_and_get_bind_scope() {
    let (mut interp, graph) = interpreter();
    let created = run(&mut interp, "create Unit name=kg symbol=kg");
    assert!(created.starts_with("@Unit.kg {"), "{created}");
    run(&mut interp, "create Resource name=Iron density=7.87 unit_default=@Unit.kg");

    let message = run(&mut interp, "> get Resource unit_default=kg as metals");
    assert_eq!(message, "Object of type Resource added as metals.");
    assert!(matches!(interp.lookup("metals"), Some(ScopeValue::Object(o)) if o.key() == "Iron"));

    let shown = run(&mut interp, "show $metals");
    assert!(shown.contains("density=7.87"), "{shown}");
    assert!(shown.contains("unit_default=@Unit.kg"), "{shown}");
    assert_eq!(graph.stats().expect("stats").node_count, 2);
}

#[test]
fn unnamed_results_are_numbered() {
    let (mut interp, _) = interpreter();
    run(&mut interp, "create Unit name=kg");
    run(&mut interp, "create Unit name=t");

    assert_eq!(run(&mut interp, "get Unit"), "2 objects of type Unit added to result1.");
    assert_eq!(run(&mut interp, "get Unit key=t"), "Object of type Unit added as result2.");
    assert!(matches!(interp.lookup("result1"), Some(ScopeValue::List(list)) if list.len() == 2));
    assert_eq!(
        run(&mut interp, "get Unit name=zzz"),
        "No objects of type Unit found matching the criteria."
    );
    assert!(interp.lookup("result3").is_none());
}

#[test]
fn new_objects_persist_only_on_add() {
    let (mut interp, graph) = interpreter();
    assert_eq!(
        run(&mut interp, "new Unit name=t symbol=t as ton"),
        "Object @Unit.t stored as ton."
    );
    assert_eq!(graph.stats().expect("stats").node_count, 0);
    assert!(interp.db().register().is_empty());

    assert_eq!(run(&mut interp, "add ton"), "Object @Unit.t added successfully.");
    assert_eq!(graph.stats().expect("stats").node_count, 1);
    assert!(interp.db().register().contains("Unit", "t"));

    run(&mut interp, "create Unit name=kg");
    run(&mut interp, "get Unit as units");
    assert_eq!(run(&mut interp, "add $units"), "All 2 objects added successfully.");
    assert_eq!(graph.stats().expect("stats").node_count, 2);
}

#[test]
fn scope_variables_and_lists_as_references() {
    let (mut interp, graph) = interpreter();
    run(&mut interp, "new Region code=EU population=450000000 as eu");
    run(&mut interp, "new Region code=FR parents=[$eu] as fr");
    run(&mut interp, "add fr");

    let stats = graph.stats().expect("stats");
    assert_eq!(stats.node_count, 2);
    assert!(interp.db().register().contains("Region", "EU"));

    let message = run(&mut interp, "get Region parents=EU as children");
    assert_eq!(message, "Object of type Region added as children.");
    let shown = run(&mut interp, "show @Region.EU");
    assert!(shown.contains("direct_constituents=[@Region.FR]"), "{shown}");
}

#[test]
fn typed_scalars_and_quoted_text() {
    let (mut interp, _) = interpreter();
    seed(&mut interp);

    let unit = run(&mut interp, r#"create Unit name=m label="metre unit" active_from=2024-01-01"#);
    assert!(unit.contains("label=metre unit"), "{unit}");
    assert!(unit.contains("active_from=2024-01-01T00:00:00"), "{unit}");

    let conduit = run(
        &mut interp,
        "create Conduit code=C1 capacity=10 location=(48.1, 11.5) resource=Iron",
    );
    assert!(conduit.contains("location=(48.1, 11.5)"), "{conduit}");
    assert!(conduit.contains("resource=@Resource.Iron"), "{conduit}");

    fails(&mut interp, "create Region code=X population=many");
    fails(&mut interp, "create Resource name=Gold renewable=maybe unit_default=kg");
    let mono = fails(&mut interp, "create Conduit code=C2 capacity=1 resource=[Iron, Iron]");
    assert!(mono.contains("takes one object"), "{mono}");
}

#[test]
fn update_clone_and_delete() {
    let (mut interp, graph) = interpreter();
    seed(&mut interp);

    let updated = run(&mut interp, "update Resource Iron density=8.0 renewable=false");
    assert!(updated.starts_with("Updated @Resource.Iron"), "{updated}");
    assert!(updated.contains("density=8"), "{updated}");
    fails(&mut interp, "update Resource Iron");
    fails(&mut interp, "update Resource Gold density=1");

    let cloned = run(&mut interp, "clone Resource Iron Steel");
    assert!(cloned.contains("@Resource.Steel"), "{cloned}");
    assert!(cloned.contains("unit_default=@Unit.kg"), "{cloned}");
    fails(&mut interp, "clone Resource Iron Steel");

    assert_eq!(
        run(&mut interp, "delete Resource Iron Steel"),
        "2 objects of type Resource deleted."
    );
    fails(&mut interp, "show @Resource.Iron");
    assert_eq!(run(&mut interp, "delete Unit kg"), "Object Unit kg deleted.");
    assert_eq!(graph.stats().expect("stats").node_count, 0);
}

#[test]
fn invalid_commands_report_errors() {
    let (mut interp, graph) = interpreter();

    assert!(fails(&mut interp, "fly away").contains("Unknown command"));
    assert_eq!(fails(&mut interp, ""), "Empty command");
    assert!(fails(&mut interp, "get").contains("Please specify the class name"));
    assert_eq!(fails(&mut interp, "create Planet name=x"), "Class Planet not recognized");
    fails(&mut interp, "create Unit name=kg colour=red");
    fails(&mut interp, "new Unit name=x");
    fails(&mut interp, "add nobody");
    fails(&mut interp, "show");
    fails(&mut interp, "create Resource name=Iron unit_default=nope");
    fails(&mut interp, r#"create Unit name="kg"#);

    assert_eq!(graph.stats().expect("stats").node_count, 0);
    assert!(interp.scope().is_empty());
}

#[test]
fn help_texts() {
    let (mut interp, _) = interpreter();
    let general = run(&mut interp, "help");
    assert!(general.contains("update <Class> <key> member=value ..."), "{general}");
    assert!(run(&mut interp, "> help new").starts_with("new <Class>"));
    fails(&mut interp, "help fly");

    assert!(
        run(&mut interp, "help create").contains("An existing key returns the stored object unchanged.")
    );

    let summary = run(&mut interp, "get Resource -help");
    assert!(summary.starts_with("Resource:"), "{summary}");
    assert!(summary.contains("density : float (optional)"), "{summary}");
    assert!(
        summary.contains("unit_default : Unit (required) (mono) Inverse: resources"),
        "{summary}"
    );
    assert_eq!(run(&mut interp, "create Resource"), summary);
}

#[test]
fn responses_carry_a_snapshot() {
    let (mut interp, _) = interpreter();
    seed(&mut interp);
    let response = interp.process("get Unit name=kg as kg");
    assert!(response.ok);

    let units = &response.objects.model_objects["Unit"];
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name, "kg");
    assert!(response.objects.model_objects.contains_key("Resource"));
    assert_eq!(response.objects.scope.len(), 1);
    assert_eq!(response.objects.scope[0].kind, ScopeKind::Object);

    let json: serde_json::Value =
        serde_json::from_str(&response.to_json().expect("json")).expect("parse");
    assert_eq!(json["ok"], serde_json::Value::Bool(true));
    assert_eq!(json["objects"]["model_objects"]["Unit"][0]["name"], "kg");
    assert_eq!(json["objects"]["scope"][0]["kind"], "object");
}

#[test]
fn redb_session_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = dir.path().join("model.xml");
    std::fs::write(&spec, TRANSMISSION).expect("write spec");
    let config = AppConfig {
        spec: Some(spec),
        backend: Backend::Redb,
        database: dir.path().join("store.redb"),
        ..AppConfig::default()
    };

    {
        let mut session = Session::open(&config).expect("open");
        assert!(session.process("create Unit name=kg symbol=kg").ok);
        assert!(session.process("create Resource name=Iron unit_default=kg").ok);
        assert_eq!(session.stats().expect("stats").node_count, 2);
    }

    let mut session = Session::open(&config).expect("reopen");
    let response = session.process("show @Resource.Iron");
    assert!(response.ok, "{}", response.result);
    assert!(response.result.contains("unit_default=@Unit.kg"));

    let again = session.process("create Unit name=kg");
    assert!(again.ok, "{}", again.result);
    assert!(again.result.starts_with("@Unit.kg"), "{}", again.result);
    assert_eq!(session.stats().expect("stats").node_count, 2);
}

#[test]
fn session_requires_a_specification() {
    let config = AppConfig::default();
    assert!(Session::open(&config).is_err());
}
