//! The `release-rail` binary: exit codes and output formats

use crate::helpers::{MANIFESTS, TestWorkspace, run_release_rail, sh};
use anyhow::Result;
use serde_json::Value;
use std::process::Output;

const NATIVE: &str = r#"
[[channels]]
name = "native"
registry = "npm"
build = ["true"]

[channels.matrix]
platforms = ["linux", "darwin"]
architectures = ["x86_64", "arm64"]
exclude = [{ platform = "linux", architecture = "arm64" }]
"#;

fn stdout(output: &Output) -> String {
  String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
  String::from_utf8_lossy(&output.stderr).to_string()
}

fn json(output: &Output) -> Result<Value> {
  Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn test_check_accepts_valid_config() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("{}{}", MANIFESTS, NATIVE))?;

  let output = run_release_rail(&ws.path, &["check"])?;
  assert!(output.status.success(), "{}", stderr(&output));
  assert!(stdout(&output).contains("valid"));

  let output = run_release_rail(&ws.path, &["check", "--json"])?;
  let report = json(&output)?;
  assert_eq!(report["current_version"], "1.2.3");
  assert_eq!(report["manifests"], 4);
  assert_eq!(report["channels"], 1);
  Ok(())
}

#[test]
fn test_check_rejects_unmatched_pattern() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!(
    "{}\n[[manifests]]\nfile = \"Cargo.toml\"\npattern = 'nope = \"(\\d+)\"'\nfield = \"major\"\n",
    MANIFESTS
  ))?;

  let output = run_release_rail(&ws.path, &["check"])?;
  assert!(!output.status.success());
  assert!(stderr(&output).contains("Cargo.toml"), "{}", stderr(&output));
  Ok(())
}

#[test]
fn test_plan_is_read_only() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("{}{}", MANIFESTS, NATIVE))?;
  ws.change("fix: handle denormals")?;
  let head = ws.head()?;

  let output = run_release_rail(&ws.path, &["plan", "--json"])?;
  assert!(output.status.success(), "{}", stderr(&output));

  let plan = json(&output)?;
  assert_eq!(plan["resolution"]["next"], "1.2.4");
  assert_eq!(plan["resolution"]["bump"], "patch");
  let jobs: Vec<&str> = plan["jobs"]
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|j| j["id"].as_str())
    .collect();
  assert_eq!(jobs[0], "resolve-version");
  assert!(jobs.contains(&"aggregate:native"));
  assert!(jobs.contains(&"publish:native"));

  assert_eq!(ws.head()?, head);
  assert_eq!(ws.tags()?, vec!["v1.2.3"]);
  assert!(ws.status()?.is_empty());
  Ok(())
}

#[test]
fn test_plan_without_releasable_change() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;

  let output = run_release_rail(&ws.path, &["plan", "--json"])?;
  assert!(output.status.success(), "{}", stderr(&output));
  let plan = json(&output)?;
  assert!(plan["resolution"].is_null());
  assert!(plan["reason"].is_string());
  Ok(())
}

#[test]
fn test_matrix_expansion() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!("{}{}", MANIFESTS, NATIVE))?;

  let output = run_release_rail(&ws.path, &["matrix", "--channel", "native", "--json"])?;
  assert!(output.status.success(), "{}", stderr(&output));

  let matrices = json(&output)?;
  let shards = matrices[0]["shards"].as_array().unwrap();
  assert_eq!(shards.len(), 3);
  assert!(
    shards
      .iter()
      .all(|s| !(s["key"]["platform"] == "linux" && s["key"]["arch"] == "arm64"))
  );

  let output = run_release_rail(&ws.path, &["matrix", "--channel", "pypi"])?;
  assert!(!output.status.success());
  Ok(())
}

#[test]
fn test_missing_config_is_user_error() -> Result<()> {
  let ws = TestWorkspace::new()?;

  let output = run_release_rail(&ws.path, &["run"])?;
  assert_eq!(output.status.code(), Some(1));
  assert!(stderr(&output).contains("rail.toml"), "{}", stderr(&output));
  Ok(())
}

#[test]
fn test_stale_trigger_is_refused() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  let announced = ws.change("fix: first")?;
  ws.change("fix: second")?;

  let event = ws.path.with_file_name("event.json");
  std::fs::write(
    &event,
    format!("{{\"ref\": \"refs/heads/main\", \"after\": \"{}\"}}", announced),
  )?;

  let output = run_release_rail(&ws.path, &["run", "--event", &event.to_string_lossy()])?;
  assert_eq!(output.status.code(), Some(3), "{}", stderr(&output));
  assert_eq!(ws.tags()?, vec!["v1.2.3"]);

  // The current head is accepted
  std::fs::write(
    &event,
    format!("{{\"ref\": \"refs/heads/main\", \"after\": \"{}\"}}", ws.head()?),
  )?;
  let output = run_release_rail(&ws.path, &["run", "--event", &event.to_string_lossy()])?;
  assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
  assert!(ws.tags()?.contains(&"v1.2.4".to_string()));
  Ok(())
}

#[test]
fn test_run_refuses_other_branches() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(MANIFESTS)?;
  crate::helpers::git(&ws.path, &["checkout", "-b", "topic"])?;
  ws.change("fix: on a topic branch")?;

  let output = run_release_rail(&ws.path, &["run"])?;
  assert_eq!(output.status.code(), Some(1));
  assert_eq!(ws.tags()?, vec!["v1.2.3"]);
  Ok(())
}

#[test]
fn test_run_json_with_command_channel() -> Result<()> {
  let ws = TestWorkspace::new()?;
  ws.write_config(&format!(
    "{}\n[[channels]]\nname = \"python\"\nregistry = \"pypi\"\ncredential = \"RAIL_TEST_PYPI_TOKEN\"\nbuild = {}\n\n[channels.matrix]\nplatforms = [\"linux\"]\narchitectures = [\"x86_64\"]\n",
    MANIFESTS,
    sh("env > \"$RAIL_OUT_DIR/pkg-$RAIL_VERSION-$RAIL_PLATFORM.whl\"")
  ))?;
  ws.change("feat: wheels")?;

  let output = std::process::Command::new(env!("CARGO_BIN_EXE_release-rail"))
    .current_dir(&ws.path)
    .args(["run", "--json"])
    .env("RAIL_TEST_PYPI_TOKEN", "pypi-s3cret")
    .output()?;
  assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));

  let report = json(&output)?;
  assert_eq!(report["outcome"], "released");
  assert_eq!(report["tag"], "v1.3.0");
  assert_eq!(report["channels"][0]["published"], true);

  let wheel = ws.read_file(".rail/staging/python/pkg-1.3.0-linux.whl")?;
  assert!(wheel.contains("RAIL_CHANNEL=python"));
  assert!(!wheel.contains("pypi-s3cret"));
  Ok(())
}
