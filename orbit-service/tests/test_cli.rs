use orbit_protos::{CaptureResponse, CaptureStatus, ClientCaptureEvent, ProcessState};
use std::fs;
use std::process::Command;

#[test]
fn test_capture_of_running_process_writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("capture.jsonl");

    let status = Command::new(env!("CARGO_BIN_EXE_orbit-service"))
        .args(["--pid", &std::process::id().to_string(), "--duration", "1", "-o"])
        .arg(&output)
        .status()
        .expect("Failed to run orbit-service");
    assert!(status.success());

    let contents = fs::read_to_string(&output).unwrap();
    let events: Vec<ClientCaptureEvent> = contents
        .lines()
        .map(|line| serde_json::from_str::<CaptureResponse>(line).expect("Invalid JSON line"))
        .flat_map(|response| response.capture_events)
        .collect();

    assert!(events.first().is_some_and(ClientCaptureEvent::is_capture_started));
    assert!(events.iter().any(|e| matches!(e, ClientCaptureEvent::ThreadNamesSnapshot(_))));
    let Some(ClientCaptureEvent::CaptureFinished(finished)) = events.last() else {
        panic!("capture did not end with CaptureFinished");
    };
    assert_eq!(finished.status, CaptureStatus::InterruptedByService);
    assert_eq!(finished.target_process_state, ProcessState::Running);
}

#[test]
fn test_missing_process_fails() {
    // Beyond the default pid_max.
    let output = Command::new(env!("CARGO_BIN_EXE_orbit-service"))
        .args(["--pid", "4194305"])
        .output()
        .expect("Failed to run orbit-service");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Process 4194305 not found"), "stderr: {stderr}");
}
