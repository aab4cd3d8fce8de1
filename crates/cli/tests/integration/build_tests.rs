//! Seed, plan and build integration tests.

use predicates::prelude::*;
use serde_json::json;

use super::common::{PIPELINE, TestEnv};

fn seeded_pipeline() -> TestEnv {
  let env = TestEnv::new(PIPELINE);
  env.write_source("raw", "01", &json!({"rows": 3}));
  env.write_source("raw", "02", &json!({"rows": 4}));
  env.arti_cmd().arg("seed").assert().success();
  env
}

#[test]
fn unseeded_plan_is_blocked() {
  let env = TestEnv::new(PIPELINE);

  let plan = env.json(&["plan"]);
  assert_eq!(plan["summary"], json!({"total": 3, "stale": 0, "current": 0, "blocked": 3}));
}

#[test]
fn seed_records_sources() {
  let env = TestEnv::new(PIPELINE);
  env.write_source("raw", "01", &json!(1));
  env.write_source("raw", "02", &json!(2));

  let report = env.json(&["seed"]);
  assert_eq!(report["recorded"].as_array().unwrap().len(), 2);
  assert!(report["missing"].as_array().unwrap().is_empty());

  let plan = env.json(&["plan"]);
  assert_eq!(plan["summary"]["stale"], json!(2));
  assert_eq!(plan["summary"]["blocked"], json!(1));
  assert_eq!(plan["waves"].as_array().unwrap().len(), 2);
}

#[test]
fn build_runs_every_stale_unit() {
  let env = seeded_pipeline();

  env
    .arti_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete"));

  assert_eq!(env.read_output("stamped/date=01.json"), json!("date=01"));
  assert_eq!(env.read_output("stamped/date=02.json"), json!("date=02"));
  assert_eq!(env.read_output("total.json"), json!(2));
}

#[test]
fn second_build_is_current() {
  let env = seeded_pipeline();
  env.arti_cmd().arg("build").assert().success();

  let report = env.json(&["build"]);
  assert_eq!(report["success"], json!(true));
  let states: Vec<&str> = report["report"]["outcomes"]
    .as_array()
    .unwrap()
    .iter()
    .map(|o| o["state"].as_str().unwrap())
    .collect();
  assert_eq!(states, vec!["current"; 3]);
}

#[test]
fn changed_source_rebuilds_its_partition() {
  let env = seeded_pipeline();
  env.arti_cmd().arg("build").assert().success();

  env.write_source("raw", "02", &json!({"rows": 40}));
  env.arti_cmd().arg("seed").assert().success();

  let plan = env.json(&["plan"]);
  // stamp[date=02] is stale; count waits on its new output.
  assert_eq!(plan["summary"]["stale"], json!(1));
  assert_eq!(plan["summary"]["current"], json!(1));
  assert_eq!(plan["summary"]["blocked"], json!(1));
}

#[test]
fn failing_unit_exits_non_zero() {
  let definition = PIPELINE.replace(
    "cmd = \"cat > /dev/null; printf",
    "cmd = \"cat > /dev/null; test \\\"$ARTI_PARTITION\\\" != date=02 && printf",
  );
  let env = TestEnv::new(&definition);
  env.write_source("raw", "01", &json!(1));
  env.write_source("raw", "02", &json!(2));
  env.arti_cmd().arg("seed").assert().success();

  env
    .arti_cmd()
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("Build incomplete: 1 failed, 1 skipped"));

  assert_eq!(env.read_output("stamped/date=01.json"), json!("date=01"));
  assert!(!env.state_dir().join("data/stamped/date=02.json").exists());
  assert!(!env.state_dir().join("data/total.json").exists());
}

#[test]
fn timeout_flag_bounds_units() {
  let definition = PIPELINE.replace("cat > /dev/null; echo 2", "sleep 5; echo 2");
  let env = TestEnv::new(&definition);
  env.write_source("raw", "01", &json!(1));
  env.write_source("raw", "02", &json!(2));
  env.arti_cmd().arg("seed").assert().success();

  env
    .arti_cmd()
    .args(["build", "--timeout", "200ms"])
    .assert()
    .failure()
    .stdout(predicate::str::contains("timed out after 200ms"));
}

#[test]
fn partition_filter_limits_the_build() {
  let definition = PIPELINE
    .split("[producers.count]")
    .next()
    .unwrap()
    .replace("[artifacts.total]\ntype = \"number\"\n", "");
  let env = TestEnv::new(&definition);
  env.write_source("raw", "01", &json!(1));
  env.write_source("raw", "02", &json!(2));
  env.arti_cmd().arg("seed").assert().success();

  env
    .arti_cmd()
    .args(["build", "--partition", "date=01"])
    .assert()
    .success();

  assert!(env.state_dir().join("data/stamped/date=01.json").exists());
  assert!(!env.state_dir().join("data/stamped/date=02.json").exists());
}

#[test]
fn status_shows_ledger_entries() {
  let env = seeded_pipeline();
  env.arti_cmd().arg("build").assert().success();

  let status = env.json(&["status"]);
  assert_eq!(status["graph"], json!("pipeline"));
  let artifacts = status["artifacts"].as_array().unwrap();
  let raw = artifacts.iter().find(|a| a["artifact"]["path"] == json!("raw")).unwrap();
  assert_eq!(raw["producer"], json!(null));
  assert_eq!(raw["ledger"].as_object().unwrap().len(), 2);
  let total = artifacts.iter().find(|a| a["artifact"]["path"] == json!("total")).unwrap();
  assert_eq!(total["producer"], json!("count"));
  assert_eq!(total["ledger"].as_object().unwrap().len(), 1);

  env
    .arti_cmd()
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("stamped (produced by stamp)"))
    .stdout(predicate::str::contains("owner"));
}
