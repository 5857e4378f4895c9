mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

/// A record landing between detection and commit must fail the whole
/// commit; nothing from the batch may remain applied.
#[test]
fn roster_change_between_detection_and_commit_fails_atomically() {
    let workspace = temp_dir("rosterd-commit-race");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "5A" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let csv = "name,class\nPedro Rocha,5A\nQuiteria Nunes,5A\nRaul Prado,5A\n";
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.start",
        json!({ "content": csv }),
    );
    let sid = started["sessionId"].as_str().expect("sessionId").to_string();
    let detected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.mapping",
        json!({ "sessionId": sid, "mapping": { "name": "name", "class": "class_group" } }),
    );
    assert_eq!(detected["summary"]["NEW"], 3);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.resolutions",
        json!({ "sessionId": sid, "resolutions": {} }),
    );

    // Another import wins the race for the middle student.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "classId": class_id, "name": "Quiteria Nunes" }),
    );

    let failed = request(
        &mut stdin,
        &mut reader,
        "7",
        "import.commit",
        json!({ "sessionId": sid }),
    );
    assert_eq!(error_code(&failed), "commit_failed");
    assert_eq!(
        failed.pointer("/error/details/state"),
        Some(&json!("FAILED"))
    );

    // Only the racing record exists; Pedro's insert was rolled back.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "classId": class_id }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["name"], "Quiteria Nunes");

    // FAILED is terminal and keeps the diagnosis around.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "import.status",
        json!({ "sessionId": sid }),
    );
    assert_eq!(status["state"], "FAILED");
    assert_eq!(status["failedFrom"], "RESOLVED");
    let issues = status["issues"].as_array().expect("issues");
    assert!(issues
        .iter()
        .any(|i| i["reason"].as_str().unwrap_or("").contains("detection did not see")));

    let retry = request(
        &mut stdin,
        &mut reader,
        "10",
        "import.commit",
        json!({ "sessionId": sid }),
    );
    assert_eq!(error_code(&retry), "session_terminal");
}

/// Concurrent sessions over different uploads stay independent: one
/// session failing its commit does not disturb another mid-pipeline.
#[test]
fn sessions_are_independent_across_uploads() {
    let workspace = temp_dir("rosterd-independent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "5A" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.start",
        json!({ "content": "name,class\nAna Souza,5A\n" }),
    )["sessionId"]
        .as_str()
        .expect("sessionId")
        .to_string();
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.start",
        json!({ "content": "name,class\nBia Costa,5A\n" }),
    )["sessionId"]
        .as_str()
        .expect("sessionId")
        .to_string();
    assert_ne!(first, second);

    // Drive both sessions interleaved.
    for (id, sid) in [("5", &first), ("6", &second)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "import.mapping",
            json!({ "sessionId": sid, "mapping": { "name": "name", "class": "class_group" } }),
        );
    }
    for (id, sid) in [("7", &first), ("8", &second)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "import.resolutions",
            json!({ "sessionId": sid, "resolutions": {} }),
        );
    }

    let committed_first = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "import.commit",
        json!({ "sessionId": first }),
    );
    assert_eq!(committed_first["created"], 1);

    // The first commit changed the roster under the second session, but
    // Bia has no collision, so the second commit still lands.
    let committed_second = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "import.commit",
        json!({ "sessionId": second }),
    );
    assert_eq!(committed_second["created"], 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["students"].as_array().expect("students").len(), 2);
}
