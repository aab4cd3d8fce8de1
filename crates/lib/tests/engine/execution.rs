//! Scheduling behavior: timeouts, resources, cancellation, hooks and output checks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use artigraph_lib::artifact::Artifact;
use artigraph_lib::descriptor::{JsonTypes, TypeSpec};
use artigraph_lib::execute::{CancelToken, ExecuteConfig, SkipReason, UnitError, UnitState};
use artigraph_lib::graph::{Graph, GraphBuilder};
use artigraph_lib::ledger::Ledger;
use artigraph_lib::partition::PartitionKey;
use artigraph_lib::producer::{BuildContext, CommandCompute, ComputeError, HookError, HookPoint, Producer};
use artigraph_lib::resource::{ResourcePool, Slot};
use artigraph_lib::version::Version;
use serde_json::{Value, json};

use super::common::{Env, day, path, state};

const DAYS: [&str; 4] = ["01", "02", "03", "04"];

fn source() -> Artifact {
  Artifact::new(path("t"))
    .partitioned_by(["date"])
    .with_partitions(DAYS.map(day))
}

fn seed_days(env: &Env, graph: &Graph) {
  let values: Vec<_> = DAYS.iter().map(|d| ("t", day(d), json!(1))).collect();
  env.seed(graph, &values);
}

/// `t` -> `producer` (identity) -> `out`.
fn single(producer: Producer) -> Graph {
  GraphBuilder::new("single")
    .artifact(source())
    .artifact(Artifact::new(path("out")).partitioned_by(["date"]))
    .producer(producer.input("t", path("t")).output(path("out")))
    .build()
    .unwrap()
}

fn identity(name: &str) -> Producer {
  Producer::from_fn(path(name), Version::string("v1"), |ctx: &BuildContext| {
    Ok(vec![ctx.input("t")?.clone()])
  })
}

#[test]
fn slow_units_time_out() {
  let env = Env::new();
  let slow = Producer::from_fn(path("slow"), Version::string("v1"), |ctx: &BuildContext| {
    if ctx.partition.get("date") == Some("01") {
      thread::sleep(Duration::from_millis(500));
    }
    Ok(vec![json!(0)])
  })
  .with_timeout(Duration::from_millis(50));
  let graph = Arc::new(single(slow));
  seed_days(&env, &graph);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  match state(&report, "slow", day("01")) {
    UnitState::Failed {
      error: UnitError::Timeout(limit),
    } => assert_eq!(*limit, Duration::from_millis(50)),
    other => panic!("unexpected state {:?}", other),
  }
  assert_eq!(report.succeeded(), 3);
  // Nothing was recorded for the timed out unit.
  assert!(env.ledger.get(&path("out"), &day("01")).unwrap().is_none());
  assert!(env.store.get(&path("out"), &day("01")).is_none());
}

#[test]
fn run_wide_timeout_applies_without_producer_override() {
  let env = Env::new();
  let slow = Producer::from_fn(path("slow"), Version::string("v1"), |_: &BuildContext| {
    thread::sleep(Duration::from_millis(300));
    Ok(vec![json!(0)])
  });
  let graph = Arc::new(single(slow));
  seed_days(&env, &graph);

  let config = ExecuteConfig {
    unit_timeout: Some(Duration::from_millis(20)),
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);
  assert_eq!(report.failed(), 4);
}

#[test]
fn capped_resource_serializes_units() {
  let env = Env::new();
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let (r, p) = (running.clone(), peak.clone());
  let producer = Producer::from_fn(path("load"), Version::string("v1"), move |ctx: &BuildContext| {
    if ctx.connection("warehouse").is_none() {
      return Err(ComputeError::msg("no warehouse connection"));
    }
    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
    p.fetch_max(now, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    r.fetch_sub(1, Ordering::SeqCst);
    Ok(vec![json!(now)])
  })
  .with_resource("warehouse");
  let graph = Arc::new(single(producer));
  seed_days(&env, &graph);

  let mut env = env;
  env.ctx = env
    .ctx
    .clone()
    .with_resources(ResourcePool::new().with("warehouse", Slot::new("warehouse"), Some(1)));
  let config = ExecuteConfig {
    parallelism: 4,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);

  assert_eq!(report.succeeded(), 4);
  assert_eq!(peak.load(Ordering::SeqCst), 1);
}

fn with_warehouse(env: Env, cancel: Option<CancelToken>) -> Env {
  let mut env = env;
  let mut ctx = env
    .ctx
    .clone()
    .with_resources(ResourcePool::new().with("warehouse", Slot::new("warehouse"), Some(1)));
  if let Some(cancel) = cancel {
    ctx = ctx.with_cancel(cancel);
  }
  env.ctx = ctx;
  env
}

#[test]
fn cancel_releases_units_waiting_on_a_resource() {
  let cancel = CancelToken::new();
  let trigger = cancel.clone();
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let producer = Producer::from_fn(path("load"), Version::string("v1"), move |ctx: &BuildContext| {
    counted.fetch_add(1, Ordering::SeqCst);
    // Let the second unit queue up on the warehouse first.
    thread::sleep(Duration::from_millis(100));
    trigger.cancel();
    thread::sleep(Duration::from_millis(50));
    Ok(vec![ctx.input("t")?.clone()])
  })
  .with_resource("warehouse");
  let graph = Arc::new(single(producer));
  let env = Env::new();
  seed_days(&env, &graph);
  let env = with_warehouse(env, Some(cancel));

  let config = ExecuteConfig {
    parallelism: 2,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);

  assert!(report.cancelled);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(report.succeeded(), 1);
  assert_eq!(report.skipped(), 3);
  for outcome in report.outcomes.iter().filter(|o| o.state.name() == "skipped") {
    assert!(matches!(outcome.state, UnitState::Skipped(SkipReason::Cancelled)));
  }
}

#[test]
fn timed_out_units_hold_their_resource_until_they_end() {
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let (r, p) = (running.clone(), peak.clone());
  let producer = Producer::from_fn(path("load"), Version::string("v1"), move |_: &BuildContext| {
    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
    p.fetch_max(now, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    r.fetch_sub(1, Ordering::SeqCst);
    Ok(vec![json!(0)])
  })
  .with_resource("warehouse")
  .with_timeout(Duration::from_millis(30));
  let graph = Arc::new(single(producer));
  let env = Env::new();
  seed_days(&env, &graph);
  let env = with_warehouse(env, None);

  let config = ExecuteConfig {
    parallelism: 4,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);

  assert_eq!(report.failed(), 4);
  assert!(report.outcomes.iter().all(|o| matches!(
    o.state,
    UnitState::Failed {
      error: UnitError::Timeout(_)
    }
  )));
  assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[cfg(unix)]
#[test]
fn command_units_stream_large_inputs() {
  let env = Env::new();
  let echo = Producer::new(path("echo"), Version::string("v1"), CommandCompute::new("cat", 1))
    .with_timeout(Duration::from_secs(20));
  let graph = Arc::new(single(echo));
  let big = "x".repeat(1 << 20);
  let values: Vec<_> = DAYS.iter().map(|d| ("t", day(d), json!(big))).collect();
  env.seed(&graph, &values);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  assert!(report.is_success(), "{:?}", report.outcomes);
  let out = env.store.get(&path("out"), &day("01")).unwrap();
  assert_eq!(out["t"][0]["value"].as_str().map(str::len), Some(1 << 20));
}

#[test]
fn cancellation_lets_running_units_finish() {
  let env = Env::new();
  let cancel = CancelToken::new();
  let trigger = cancel.clone();
  let producer = Producer::from_fn(path("p"), Version::string("v1"), move |ctx: &BuildContext| {
    trigger.cancel();
    thread::sleep(Duration::from_millis(50));
    Ok(vec![ctx.input("t")?.clone()])
  });
  let graph = Arc::new(single(producer));
  seed_days(&env, &graph);

  let mut env = env;
  env.ctx = env.ctx.clone().with_cancel(cancel);
  let config = ExecuteConfig {
    parallelism: 1,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);

  assert!(report.cancelled);
  assert_eq!(report.succeeded(), 1);
  assert_eq!(report.skipped(), 3);
  for outcome in &report.outcomes {
    if let UnitState::Skipped(reason) = &outcome.state {
      assert_eq!(reason, &SkipReason::Cancelled);
    }
  }
  // The finished unit's ledger entry stands.
  assert_eq!(env.ledger.partitions(&path("out")).unwrap().len(), 1);
}

#[test]
fn before_partition_veto_fails_only_that_unit() {
  let env = Env::new();
  let errors = Arc::new(Mutex::new(Vec::new()));
  let seen = errors.clone();
  let producer = identity("guarded")
    .with_hook(HookPoint::BeforePartition, |event| {
      if event.partition.and_then(|k| k.get("date")) == Some("02") {
        return Err(HookError::new("quarantined partition"));
      }
      Ok(())
    })
    .with_hook(HookPoint::OnPartitionError, move |event| {
      seen.lock().unwrap().push(event.error.unwrap_or_default().to_string());
      Ok(())
    });
  let graph = Arc::new(single(producer));
  seed_days(&env, &graph);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  match state(&report, "guarded", day("02")) {
    UnitState::Failed {
      error: UnitError::HookVeto { point, message },
    } => {
      assert_eq!(*point, HookPoint::BeforePartition);
      assert_eq!(message, "quarantined partition");
    }
    other => panic!("unexpected state {:?}", other),
  }
  assert_eq!(report.succeeded(), 3);
  assert_eq!(report.hook_failures.len(), 1);
  let errors = errors.lock().unwrap();
  assert_eq!(errors.len(), 1);
  assert!(errors[0].contains("quarantined partition"));
}

#[test]
fn before_producer_veto_fails_every_unit() {
  let env = Env::new();
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let producer = identity("frozen").with_hook(HookPoint::BeforeProducer, move |_| {
    counted.fetch_add(1, Ordering::SeqCst);
    Err(HookError::new("change freeze"))
  });
  let graph = Arc::new(single(producer));
  seed_days(&env, &graph);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  assert_eq!(report.failed(), 4);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(env.ledger.partitions(&path("out")).unwrap().is_empty());
}

#[test]
fn after_hook_failures_do_not_change_outcomes() {
  let env = Env::new();
  let finished = Arc::new(AtomicUsize::new(0));
  let counted = finished.clone();
  let producer = identity("noisy")
    .with_hook(HookPoint::AfterPartition, |_| Err(HookError::new("metrics endpoint down")))
    .with_hook(HookPoint::AfterProducer, move |event| {
      assert!(event.partition.is_none());
      counted.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  let graph = Arc::new(single(producer));
  seed_days(&env, &graph);

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  assert!(report.is_success());
  assert_eq!(report.succeeded(), 4);
  assert_eq!(report.hook_failures.len(), 4);
  assert!(report.hook_failures.iter().all(|f| f.point == HookPoint::AfterPartition));
  assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn fail_fast_stops_scheduling() {
  let env = Env::new();
  let broken = Producer::from_fn(path("broken"), Version::string("v1"), |_: &BuildContext| {
    thread::sleep(Duration::from_millis(50));
    Err(ComputeError::msg("boom"))
  });
  let gate = Producer::from_fn(path("gate"), Version::string("v1"), |_: &BuildContext| {
    thread::sleep(Duration::from_millis(200));
    Ok(vec![json!(1)])
  });
  let graph = Arc::new(
    GraphBuilder::new("fail-fast")
      .artifact(Artifact::new(path("x")))
      .artifact(Artifact::new(path("g")))
      .artifact(Artifact::new(path("later")))
      .producer(broken.output(path("x")))
      .producer(gate.output(path("g")))
      .producer(identity("after_gate").input("t", path("g")).output(path("later")))
      .build()
      .unwrap(),
  );

  let config = ExecuteConfig {
    parallelism: 2,
    fail_fast: true,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);

  assert_eq!(state(&report, "broken", PartitionKey::empty()).name(), "failed");
  assert_eq!(state(&report, "gate", PartitionKey::empty()).name(), "succeeded");
  assert!(matches!(
    state(&report, "after_gate", PartitionKey::empty()),
    UnitState::Skipped(SkipReason::Cancelled)
  ));
  assert!(!report.cancelled);
}

fn pair_graph(values: fn() -> Vec<Value>) -> Graph {
  let producer = Producer::from_fn(path("split"), Version::string("v1"), move |_: &BuildContext| Ok(values()));
  GraphBuilder::new("pair")
    .artifact(Artifact::new(path("left")).with_type(TypeSpec::new("number")))
    .artifact(Artifact::new(path("right")).with_type(TypeSpec::new("string")))
    .producer(producer.output(path("left")).output(path("right")))
    .seal(JsonTypes)
    .unwrap()
}

#[test]
fn multi_output_units_record_every_output() {
  let env = Env::new();
  let graph = Arc::new(pair_graph(|| vec![json!(1), json!("one")]));

  let (snapshot, report) = env.build(&graph, &ExecuteConfig::default());

  assert!(report.is_success());
  let target = snapshot.units[0].target;
  assert!(target.is_some());
  assert_eq!(env.ledger.get(&path("left"), &PartitionKey::empty()).unwrap(), target);
  assert_eq!(env.ledger.get(&path("right"), &PartitionKey::empty()).unwrap(), target);
  assert_eq!(env.store.get(&path("right"), &PartitionKey::empty()), Some(json!("one")));
}

#[test]
fn wrong_output_count_fails_the_unit() {
  let env = Env::new();
  let graph = Arc::new(pair_graph(|| vec![json!(1)]));

  let (_, report) = env.build(&graph, &ExecuteConfig::default());

  assert!(matches!(
    state(&report, "split", PartitionKey::empty()),
    UnitState::Failed {
      error: UnitError::OutputCount { expected: 2, actual: 1 }
    }
  ));
  assert!(env.store.is_empty());
}

#[test]
fn mistyped_output_is_rejected_unless_disabled() {
  let env = Env::new();
  let graph = Arc::new(pair_graph(|| vec![json!("not a number"), json!("one")]));

  let (_, report) = env.build(&graph, &ExecuteConfig::default());
  assert!(matches!(
    state(&report, "split", PartitionKey::empty()),
    UnitState::Failed {
      error: UnitError::IncompatibleOutput { .. }
    }
  ));
  assert!(env.ledger.get(&path("left"), &PartitionKey::empty()).unwrap().is_none());

  let config = ExecuteConfig {
    check_output_types: false,
    ..Default::default()
  };
  let (_, report) = env.build(&graph, &config);
  assert!(report.is_success());
}
