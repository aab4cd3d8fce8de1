//! Incrementality and isolation properties of whole builds.

use std::sync::Arc;

use artigraph_lib::artifact::Artifact;
use artigraph_lib::execute::{ExecuteConfig, SkipReason, UnitState};
use artigraph_lib::fingerprint::Fingerprint;
use artigraph_lib::graph::{Graph, GraphBuilder, GraphError};
use artigraph_lib::ledger::Ledger;
use artigraph_lib::partition::{
  MapFn, PartitionDependencies, PartitionDims, PartitionFilter, PartitionKey, PartitionMapping,
};
use artigraph_lib::plan::{self, UnitInput, Verdict};
use artigraph_lib::producer::{BuildContext, ComputeError, Producer};
use artigraph_lib::seed::content_fingerprint;
use artigraph_lib::version::Version;
use serde_json::{Value, json};

use super::common::{Env, day, path, state, unit};

fn doubler(name: &str, version: &str) -> Producer {
  Producer::from_fn(path(name), Version::string(version), |ctx: &BuildContext| {
    let n = ctx.input("t")?.as_i64().unwrap_or(0);
    Ok(vec![json!(n * 2)])
  })
}

fn source() -> Artifact {
  Artifact::new(path("t"))
    .partitioned_by(["date"])
    .with_partitions([day("2021-10-01"), day("2021-10-02")])
}

fn seed_t(env: &Env, graph: &Graph, first: i64, second: i64) {
  env.seed(
    graph,
    &[("t", day("2021-10-01"), json!(first)), ("t", day("2021-10-02"), json!(second))],
  );
}

/// `t` feeds two independent identity producers, `double` and `triple`.
fn fan_out(double_version: &str) -> Graph {
  let triple = Producer::from_fn(path("triple"), Version::string("v1"), |ctx: &BuildContext| {
    let n = ctx.input("t")?.as_i64().unwrap_or(0);
    Ok(vec![json!(n * 3)])
  });
  GraphBuilder::new("fan-out")
    .artifact(source())
    .artifact(Artifact::new(path("doubled")).partitioned_by(["date"]))
    .artifact(Artifact::new(path("tripled")).partitioned_by(["date"]))
    .producer(doubler("double", double_version).input("t", path("t")).output(path("doubled")))
    .producer(triple.input("t", path("t")).output(path("tripled")))
    .build()
    .unwrap()
}

#[test]
fn second_build_has_nothing_stale() {
  let env = Env::new();
  let graph = Arc::new(fan_out("v1"));
  seed_t(&env, &graph, 1, 2);

  let (first, report) = env.build(&graph, &ExecuteConfig::default());
  assert_eq!(first.summary().stale, 4);
  assert_eq!(report.succeeded(), 4);

  let (second, report) = env.build(&graph, &ExecuteConfig::default());
  assert_eq!(second.summary().stale, 0);
  assert!(second.is_up_to_date());
  assert_eq!(report.current(), 4);
}

#[test]
fn version_bump_restales_only_that_producer() {
  let env = Env::new();
  seed_t(&env, &fan_out("v1"), 1, 2);
  env.build(&Arc::new(fan_out("v1")), &ExecuteConfig::default());

  let bumped = fan_out("v2");
  let snapshot = plan::plan(&bumped, env.ledger.as_ref(), &PartitionFilter::all()).unwrap();
  for unit in &snapshot.units {
    if unit.id.producer == path("double") {
      assert!(matches!(unit.verdict, Verdict::Stale { previous: Some(_) }), "{}", unit.id);
    } else {
      assert_eq!(unit.verdict, Verdict::Current, "{}", unit.id);
    }
  }
}

#[test]
fn input_change_restales_only_mapped_partitions() {
  let env = Env::new();
  let graph = Arc::new(fan_out("v1"));
  seed_t(&env, &graph, 1, 2);
  env.build(&graph, &ExecuteConfig::default());

  seed_t(&env, &graph, 1, 20);
  let snapshot = plan::plan(&graph, env.ledger.as_ref(), &PartitionFilter::all()).unwrap();
  let verdict = |producer: &str, d: &str| snapshot.unit(&unit(producer, day(d))).unwrap().verdict.clone();
  assert_eq!(verdict("double", "2021-10-01"), Verdict::Current);
  assert_eq!(verdict("triple", "2021-10-01"), Verdict::Current);
  assert!(matches!(verdict("double", "2021-10-02"), Verdict::Stale { .. }));
  assert!(matches!(verdict("triple", "2021-10-02"), Verdict::Stale { .. }));

  let (_, report) = env.build(&graph, &ExecuteConfig::default());
  assert_eq!(report.succeeded(), 2);
  assert_eq!(report.current(), 2);
  assert_eq!(env.store.get(&path("tripled"), &day("2021-10-02")), Some(json!(60)));
}

#[test]
fn failure_skips_exactly_its_downstream() {
  let env = Env::new();
  let flaky = Producer::from_fn(path("flaky"), Version::string("v1"), |ctx: &BuildContext| {
    if ctx.partition.get("date") == Some("2021-10-02") {
      return Err(ComputeError::msg("upstream API returned 500"));
    }
    Ok(vec![ctx.input("t")?.clone()])
  });
  let graph = Arc::new(
    GraphBuilder::new("branches")
      .artifact(source())
      .artifact(Artifact::new(path("a")).partitioned_by(["date"]))
      .artifact(Artifact::new(path("a2")).partitioned_by(["date"]))
      .artifact(Artifact::new(path("b")).partitioned_by(["date"]))
      .producer(flaky.input("t", path("t")).output(path("a")))
      .producer(doubler("after_a", "v1").input("t", path("a")).output(path("a2")))
      .producer(doubler("independent", "v1").input("t", path("t")).output(path("b")))
      .build()
      .unwrap(),
  );
  seed_t(&env, &graph, 1, 2);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  assert!(matches!(state(&report, "flaky", day("2021-10-02")), UnitState::Failed { .. }));
  match state(&report, "after_a", day("2021-10-02")) {
    UnitState::Skipped(SkipReason::UpstreamFailed { unit: failed }) => {
      assert_eq!(failed, &unit("flaky", day("2021-10-02")))
    }
    other => panic!("unexpected state {:?}", other),
  }
  for (producer, d) in [
    ("flaky", "2021-10-01"),
    ("after_a", "2021-10-01"),
    ("independent", "2021-10-01"),
    ("independent", "2021-10-02"),
  ] {
    assert_eq!(state(&report, producer, day(d)).name(), "succeeded", "{}[{}]", producer, d);
  }
  assert_eq!(report.failed(), 1);
  assert_eq!(report.skipped(), 1);
  assert!(env.ledger.get(&path("a"), &day("2021-10-02")).unwrap().is_none());
}

/// `t` (two dates) aggregated into unpartitioned `s` by a custom many-to-one mapping, plus an
/// identity consumer `copy` of `t`.
fn aggregation() -> Graph {
  let dims: PartitionDims = ["date".to_string()].into();
  let mapper = MapFn::new(PartitionDims::new(), |inputs| {
    let deps: PartitionDependencies = inputs.clone();
    vec![(PartitionKey::empty(), deps)]
  })
  .with_input_dims("t", dims);

  let agg = Producer::from_fn(path("agg"), Version::string("v1"), |ctx: &BuildContext| {
    let total: i64 = ctx.inputs_of("t")?.iter().filter_map(|(_, v)| v.as_i64()).sum();
    Ok(vec![json!(total)])
  });
  GraphBuilder::new("aggregation")
    .artifact(source())
    .artifact(Artifact::new(path("s")))
    .artifact(Artifact::new(path("c")).partitioned_by(["date"]))
    .producer(
      agg
        .input("t", path("t"))
        .output(path("s"))
        .with_mapping(PartitionMapping::custom(mapper)),
    )
    .producer(doubler("copy", "v1").input("t", path("t")).output(path("c")))
    .build()
    .unwrap()
}

#[test]
fn aggregation_scenario() {
  let env = Env::new();
  let graph = Arc::new(aggregation());
  let s = unit("agg", PartitionKey::empty());

  // Nothing seeded: the aggregate waits on both partitions and cannot run.
  let snapshot = plan::plan(&graph, env.ledger.as_ref(), &PartitionFilter::all()).unwrap();
  match &snapshot.unit(&s).unwrap().verdict {
    Verdict::Blocked { waiting_on } => assert_eq!(waiting_on.len(), 2),
    other => panic!("unexpected verdict {:?}", other),
  }
  let (_, report) = env.build(&graph, &ExecuteConfig::default());
  assert!(matches!(
    state(&report, "agg", PartitionKey::empty()),
    UnitState::Skipped(SkipReason::MissingInput { .. })
  ));

  // Seeded: the aggregate runs and records v1 ⊕ f(T@10-01) ⊕ f(T@10-02), each input term
  // hashed with the role and partition it was read as.
  seed_t(&env, &graph, 5, 7);
  let (snapshot, report) = env.build(&graph, &ExecuteConfig::default());
  assert!(matches!(snapshot.unit(&s).unwrap().verdict, Verdict::Stale { previous: None }));
  assert_eq!(state(&report, "agg", PartitionKey::empty()).name(), "succeeded");
  let term = |d: &str, value: i64| {
    UnitInput {
      role: "t".to_string(),
      artifact: path("t"),
      partition: day(d),
      fingerprint: Some(content_fingerprint(&json!(value), &day(d))),
    }
    .contribution()
    .unwrap()
  };
  let expected = Fingerprint::combine_all([
    Version::string("v1").fingerprint(),
    term("2021-10-01", 5),
    term("2021-10-02", 7),
  ]);
  assert_eq!(env.ledger.get(&path("s"), &PartitionKey::empty()).unwrap(), Some(expected));
  assert_eq!(env.store.get(&path("s"), &PartitionKey::empty()), Some(json!(12)));

  // No change: current.
  let (snapshot, _) = env.build(&graph, &ExecuteConfig::default());
  assert_eq!(snapshot.unit(&s).unwrap().verdict, Verdict::Current);

  // T@10-02 changes: the aggregate is stale again, the 10-01-only consumer stays current.
  seed_t(&env, &graph, 5, 8);
  let snapshot = plan::plan(&graph, env.ledger.as_ref(), &PartitionFilter::all()).unwrap();
  assert!(matches!(snapshot.unit(&s).unwrap().verdict, Verdict::Stale { previous: Some(_) }));
  assert_eq!(
    snapshot.unit(&unit("copy", day("2021-10-01"))).unwrap().verdict,
    Verdict::Current
  );
}

/// `t` -> `copy` -> `c`, then every `c` partition summed into unpartitioned `total`.
fn copy_then_sum(copy_version: &str) -> Graph {
  let sum = Producer::from_fn(path("sum"), Version::string("v1"), |ctx: &BuildContext| {
    let total: i64 = ctx.inputs_of("c")?.iter().filter_map(|(_, v)| v.as_i64()).sum();
    Ok(vec![json!(total)])
  });
  GraphBuilder::new("copy-then-sum")
    .artifact(source())
    .artifact(Artifact::new(path("c")).partitioned_by(["date"]))
    .artifact(Artifact::new(path("total")))
    .producer(doubler("copy", copy_version).input("t", path("t")).output(path("c")))
    .producer(
      sum
        .input("c", path("c"))
        .output(path("total"))
        .with_mapping(PartitionMapping::AllToOne),
    )
    .build()
    .unwrap()
}

#[test]
fn upstream_version_bump_propagates_through_aggregation() {
  let env = Env::new();
  seed_t(&env, &copy_then_sum("v1"), 1, 2);
  let (_, report) = env.build(&Arc::new(copy_then_sum("v1")), &ExecuteConfig::default());
  assert_eq!(report.succeeded(), 3);
  let before = env.ledger.get(&path("total"), &PartitionKey::empty()).unwrap();

  let (snapshot, report) = env.build(&Arc::new(copy_then_sum("v2")), &ExecuteConfig::default());
  assert!(matches!(
    snapshot.unit(&unit("sum", PartitionKey::empty())).unwrap().verdict,
    Verdict::Blocked { .. }
  ));
  assert_eq!(state(&report, "copy", day("2021-10-01")).name(), "succeeded");
  assert_eq!(state(&report, "copy", day("2021-10-02")).name(), "succeeded");
  assert_eq!(state(&report, "sum", PartitionKey::empty()).name(), "succeeded");
  assert_ne!(env.ledger.get(&path("total"), &PartitionKey::empty()).unwrap(), before);
}

#[test]
fn one_artifact_under_two_roles_restales_on_change() {
  let env = Env::new();
  let add = Producer::from_fn(path("add"), Version::string("v1"), |ctx: &BuildContext| {
    let a = ctx.input("a")?.as_i64().unwrap_or(0);
    let b = ctx.input("b")?.as_i64().unwrap_or(0);
    Ok(vec![json!(a + b)])
  });
  let graph = Arc::new(
    GraphBuilder::new("two-roles")
      .artifact(Artifact::new(path("n")))
      .artifact(Artifact::new(path("o")))
      .producer(add.input("a", path("n")).input("b", path("n")).output(path("o")))
      .build()
      .unwrap(),
  );
  env.seed(&graph, &[("n", PartitionKey::empty(), json!(1))]);
  env.build(&graph, &ExecuteConfig::default());
  assert_eq!(env.store.get(&path("o"), &PartitionKey::empty()), Some(json!(2)));

  env.seed(&graph, &[("n", PartitionKey::empty(), json!(5))]);
  let (_, report) = env.build(&graph, &ExecuteConfig::default());
  assert_eq!(state(&report, "add", PartitionKey::empty()).name(), "succeeded");
  assert_eq!(env.store.get(&path("o"), &PartitionKey::empty()), Some(json!(10)));
}

#[test]
fn cycles_are_rejected_before_planning() {
  let noop = |name: &str| {
    Producer::from_fn(path(name), Version::string("v1"), |_: &BuildContext| Ok(vec![Value::Null]))
  };
  let err = GraphBuilder::new("cycle")
    .artifact(Artifact::new(path("a")))
    .artifact(Artifact::new(path("b")))
    .producer(noop("make_b").input("a", path("a")).output(path("b")))
    .producer(noop("make_a").input("b", path("b")).output(path("a")))
    .build()
    .unwrap_err();
  assert!(matches!(err, GraphError::Cycle { .. }));
}

#[test]
fn rebuilt_upstream_with_same_target_leaves_downstream_current() {
  let env = Env::new();
  let graph = Arc::new(
    GraphBuilder::new("chain")
      .artifact(source())
      .artifact(Artifact::new(path("a")).partitioned_by(["date"]))
      .artifact(Artifact::new(path("b")).partitioned_by(["date"]))
      .producer(doubler("make_a", "v1").input("t", path("t")).output(path("a")))
      .producer(doubler("make_b", "v1").input("t", path("a")).output(path("b")))
      .build()
      .unwrap(),
  );
  seed_t(&env, &graph, 1, 2);
  env.build(&graph, &ExecuteConfig::default());

  // Lose the ledger entry of one upstream partition.
  env
    .ledger
    .record(&path("a"), &day("2021-10-01"), Fingerprint::of_str("lost"))
    .unwrap();

  let (snapshot, report) = env.build(&graph, &ExecuteConfig::default());
  assert!(matches!(
    snapshot.unit(&unit("make_b", day("2021-10-01"))).unwrap().verdict,
    Verdict::Blocked { .. }
  ));
  assert_eq!(state(&report, "make_a", day("2021-10-01")).name(), "succeeded");
  assert_eq!(state(&report, "make_b", day("2021-10-01")).name(), "current");
  assert_eq!(report.current(), 3);
}
