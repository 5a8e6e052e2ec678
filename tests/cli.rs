use std::io::{BufRead, BufReader};
use std::process::{Command, Output, Stdio};

fn run_command(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_harvestd"))
        .args(args)
        .env_remove("HARVESTD_LOG")
        .output()
        .expect("Failed to execute process")
}

#[test]
fn help() {
    let output = run_command(&["--help"]);
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("--config"), "{stdout}");
    assert!(stdout.contains("--json-logs"), "{stdout}");
}

#[test]
fn bad_configuration_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let invalid = dir.path().join("invalid.yaml");
    testify::fs::write(&invalid, "data_dir: /tmp\nsources: {}\n");
    let missing = dir.path().join("missing.yaml");

    for path in [invalid, missing] {
        let output = run_command(&["--config", path.to_str().unwrap()]);
        assert_eq!(output.status.code(), Some(exitcode::CONFIG), "{path:?}");

        // logs go to stderr, stdout only carries records
        assert!(output.stdout.is_empty());
        let stderr = String::from_utf8(output.stderr).unwrap();
        assert!(stderr.contains("Load configuration failed"), "{stderr}");
    }
}

#[test]
fn unknown_source_directory_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvestd.yaml");
    testify::fs::write(
        &path,
        format!(
            "data_dir: {}\nsources:\n  ctdbp:\n    directory: {}\n    pattern: '*.dat'\n",
            dir.path().join("state").display(),
            dir.path().join("missing").display()
        ),
    );

    let output = run_command(&["-c", path.to_str().unwrap(), "--json-logs"]);
    assert_eq!(output.status.code(), Some(exitcode::CONFIG));

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains(r#""message":"Invalid data source""#), "{stderr}");
}

#[cfg(unix)]
#[test]
fn interrupt_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("state");
    let instrument = dir.path().join("ctdbp");
    std::fs::create_dir(&instrument).unwrap();
    testify::fs::write(&instrument.join("unit_1.dat"), "23.1,35.2\n");

    let path = dir.path().join("harvestd.yaml");
    testify::fs::write(
        &path,
        format!(
            "data_dir: {}\nsources:\n  ctdbp:\n    directory: {}\n    pattern: '*.dat'\n    \
             frequency: 0.05\n    file_mod_wait: 0\n",
            data_dir.display(),
            instrument.display()
        ),
    );

    let mut child = Command::new(env!("CARGO_BIN_EXE_harvestd"))
        .args(["-c", path.to_str().unwrap()])
        .env_remove("HARVESTD_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to execute process");

    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    assert_eq!(
        line,
        concat!(
            r#"{"key":"ctdbp","filename":"unit_1.dat","record":{"offset":0,"text":"23.1,35.2"}}"#,
            "\n"
        )
    );

    let killed = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));
    assert!(data_dir.join("state.json").is_file());
}
