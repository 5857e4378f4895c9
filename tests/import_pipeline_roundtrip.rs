mod test_support;

use serde_json::json;
use test_support::{request_ok, spawn_sidecar, temp_dir};

/// Full pipeline against a seeded roster: upload → mapping/detection →
/// resolutions → commit, ending with the roster reflecting every decision.
#[test]
fn import_pipeline_upload_to_commit() {
    let workspace = temp_dir("rosterd-pipeline");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "5A" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();

    // Seed the records the upload will collide with.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "classId": class_id,
            "name": "Maria Silva",
            "studentNo": "200",
            "birthDate": "2012-01-01"
        }),
    );
    let merged_target = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "classId": class_id,
            "name": "Carlos Lima",
            "studentNo": "300",
            "birthDate": "2011-07-07"
        }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let csv = "\u{feff}NOME,TURMA,RA,NASCIMENTO\n\
               Pedro Rocha,5A,100,2012-03-03\n\
               maria silva,5A,200,2012-01-01\n\
               Carlos Lima,5A,300,2011-12-31\n";
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.start",
        json!({ "content": csv, "filename": "alunos.csv", "owner": "secretaria" }),
    );
    let sid = started["sessionId"].as_str().expect("sessionId").to_string();
    assert_eq!(started["state"], "UPLOADED");
    assert_eq!(started["totalRows"], 3);
    assert_eq!(started["headers"][0], "NOME");
    assert_eq!(started["preview"].as_array().expect("preview").len(), 3);

    let detected = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "import.mapping",
        json!({
            "sessionId": sid,
            "mapping": {
                "NOME": "name",
                "TURMA": "class_group",
                "RA": "student_no",
                "NASCIMENTO": "birth_date"
            }
        }),
    );
    assert_eq!(detected["state"], "CONFLICTS_DETECTED");
    assert_eq!(detected["summary"]["NEW"], 1);
    assert_eq!(detected["summary"]["EXACT_MATCH"], 1);
    assert_eq!(detected["summary"]["CONFLICT"], 1);

    let conflicts = detected["conflicts"].as_array().expect("conflicts");
    assert_eq!(conflicts[0]["classification"], "NEW");
    assert_eq!(conflicts[1]["classification"], "EXACT_MATCH");
    assert_eq!(conflicts[2]["classification"], "CONFLICT");
    assert_eq!(conflicts[2]["candidates"][0]["differing"][0], "birth_date");
    assert_eq!(
        conflicts[2]["candidates"][0]["id"].as_str(),
        Some(merged_target.as_str())
    );

    // Keep the exact match as-is, take the incoming birth date for Carlos.
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "import.resolutions",
        json!({
            "sessionId": sid,
            "resolutions": {
                "1": { "action": "skip" },
                "2": { "action": "merge_with", "existingId": merged_target }
            }
        }),
    );
    assert_eq!(resolved["state"], "RESOLVED");
    assert_eq!(resolved["rowsToImport"], 2);

    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "import.commit",
        json!({ "sessionId": sid }),
    );
    assert_eq!(committed["state"], "IMPORTED");
    assert_eq!(committed["created"], 1);
    assert_eq!(committed["merged"], 1);
    assert_eq!(committed["skipped"], 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "classId": class_id }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 3);
    assert!(students
        .iter()
        .any(|s| s["name"] == "Pedro Rocha" && s["studentNo"] == "100"));
    let carlos = students
        .iter()
        .find(|s| s["name"] == "Carlos Lima")
        .expect("Carlos stays");
    assert_eq!(carlos["birthDate"], "2011-12-31");

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "import.status",
        json!({ "sessionId": sid }),
    );
    assert_eq!(status["state"], "IMPORTED");
    assert_eq!(status["owner"], "secretaria");
    assert_eq!(status["result"]["created"], 1);
}

/// The ambiguous path: near-identical stored names rank as candidates and
/// the caller's create-new decision goes through.
#[test]
fn ambiguous_rows_list_ranked_candidates() {
    let workspace = temp_dir("rosterd-ambiguous");
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "name": "Ana Souza" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "name": "Anna Souza" }),
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.start",
        json!({ "content": "name,class\nAna Souza,5A\n" }),
    );
    let sid = started["sessionId"].as_str().expect("sessionId").to_string();

    let detected = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "import.mapping",
        json!({
            "sessionId": sid,
            "mapping": { "name": "name", "class": "class_group" }
        }),
    );
    let entry = &detected["conflicts"][0];
    assert_eq!(entry["classification"], "AMBIGUOUS");
    let candidates = entry["candidates"].as_array().expect("candidates");
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0]["name"], "Ana Souza");
    assert_eq!(candidates[0]["score"], 1.0);
    assert!(candidates[1]["score"].as_f64().expect("score") < 1.0);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "import.resolutions",
        json!({
            "sessionId": sid,
            "resolutions": { "0": { "action": "create_new" } }
        }),
    );
    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "import.commit",
        json!({ "sessionId": sid }),
    );
    assert_eq!(committed["created"], 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["students"].as_array().expect("students").len(), 3);
}
