use assert_cmd::Command;
use tempfile::tempdir;

fn write_workflow(dir: &std::path::Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("workflow.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

const PASSING: &str = r#"
version: 1
matrix:
  dimensions:
    os: [linux]
    interpreter: [cp311, cp312]
steps:
  - name: build
    run: ["sh", "-c", "echo wheel > pkg-1.0-{interpreter}-{os}.whl"]
artifacts: ["*.whl"]
"#;

#[test]
fn init_validate_and_expand_a_preset() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("wheels.yaml");

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .args(["init", "--preset", "wheels", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("validate")
        .arg(&path)
        .assert()
        .success();

    let expand = Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("expand")
        .arg(&path)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&expand.get_output().stdout).to_string();
    // 3 os x 3 interpreters minus the windows/cp310 exclude.
    assert!(stdout.contains("8 job(s)"), "unexpected output: {stdout}");
}

#[test]
fn run_builds_the_matrix_and_fills_the_store() {
    let temp = tempdir().unwrap();
    let workflow = write_workflow(temp.path(), PASSING);
    let store = temp.path().join("store");

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("run")
        .arg(&workflow)
        .args(["--run-id", "run-1", "--store"])
        .arg(&store)
        .assert()
        .success();

    assert!(store.join("run-1/linux-cp311/result.json").is_file());
    assert!(store
        .join("run-1/linux-cp312/pkg-1.0-cp312-linux.whl")
        .is_file());
    assert!(store.join("run-1/run-manifest.yaml").is_file());

    let aggregate = Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("aggregate")
        .arg(&workflow)
        .args(["--run-id", "run-1", "--store"])
        .arg(&store)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&aggregate.get_output().stdout).to_string();
    assert!(stdout.contains("all-success: true"), "unexpected output: {stdout}");
}

#[test]
fn failing_job_exits_with_build_failure_code() {
    let temp = tempdir().unwrap();
    let workflow = write_workflow(
        temp.path(),
        r#"
version: 1
matrix:
  dimensions:
    os: [linux]
    interpreter: [cp312]
steps:
  - name: build
    run: ["false"]
artifacts: []
"#,
    );

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("run")
        .arg(&workflow)
        .args(["--run-id", "run-1", "--store"])
        .arg(temp.path().join("store"))
        .assert()
        .code(2);
}

#[test]
fn invalid_workflow_exits_with_config_code() {
    let temp = tempdir().unwrap();
    let workflow = write_workflow(
        temp.path(),
        r#"
version: 7
matrix:
  dimensions:
    os: [linux]
steps: []
"#,
    );

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("validate")
        .arg(&workflow)
        .assert()
        .code(1);
}

#[test]
fn run_with_tag_ref_publishes_after_green_matrix() {
    let temp = tempdir().unwrap();
    let upload_log = temp.path().join("uploads.txt");
    let workflow = write_workflow(
        temp.path(),
        &format!(
            r#"
version: 1
trigger:
  tags: ["v*"]
matrix:
  dimensions:
    os: [linux]
    interpreter: [cp312]
steps:
  - name: build
    run: ["sh", "-c", "echo wheel > pkg-1.0-{{interpreter}}-{{os}}.whl"]
artifacts: ["*.whl"]
release:
  sdist: ["sh", "-c", "echo sdist > {{dest}}/pkg-{{version}}.tar.gz"]
  upload: ["sh", "-c", "basename {{artifact}} >> {log}"]
  create_release: ["sh", "-c", "echo https://example.invalid/releases/{{tag}}"]
"#,
            log = upload_log.display()
        ),
    );

    Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("run")
        .arg(&workflow)
        .args(["--run-id", "run-1", "--ref", "refs/tags/v1.0.0", "--store"])
        .arg(temp.path().join("store"))
        .assert()
        .success();

    let uploads = std::fs::read_to_string(&upload_log).unwrap();
    let lines: Vec<&str> = uploads.lines().collect();
    assert_eq!(lines, ["pkg-1.0-cp312-linux.whl", "pkg-1.0.0.tar.gz"]);
}

#[test]
fn digest_prints_a_stable_hash() {
    let temp = tempdir().unwrap();
    let file = temp.path().join("artifact.whl");
    std::fs::write(&file, b"wheel-bytes").unwrap();

    let first = Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("digest")
        .arg(&file)
        .assert()
        .success();
    let second = Command::cargo_bin("wheelwright")
        .expect("binary present")
        .arg("digest")
        .arg(&file)
        .assert()
        .success();

    assert_eq!(first.get_output().stdout, second.get_output().stdout);
}
