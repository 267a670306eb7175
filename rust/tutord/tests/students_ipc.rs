use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_tutord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tutord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded",
        method
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn create_params(first: &str, board: &str, grade: serde_json::Value) -> serde_json::Value {
    json!({
        "firstName": first,
        "lastName": "Patil",
        "board": board,
        "branch": "Goregoan West",
        "grade": grade,
        "subjects": [
            { "name": "Mathematics", "startDate": "2024-01-01", "endDate": "2024-01-30" }
        ]
    })
}

#[test]
fn students_create_assigns_sequential_codes_per_board_and_grade() {
    let workspace = temp_dir("tutord-students-codes");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let a = request_ok(&mut stdin, &mut reader, "2", "students.create", create_params("Asha", "CBSE", json!("5")));
    assert_eq!(a["studentCode"], json!("CBSE-05-001"));
    assert_eq!(a["fees"]["finalTotal"], json!(1171));
    assert_eq!(a["fees"]["installments"][0]["amount"], json!(391));
    assert_eq!(a["fees"]["installments"][2]["amount"], json!(389));

    let b = request_ok(&mut stdin, &mut reader, "3", "students.create", create_params("Bela", "cbse", json!(5)));
    assert_eq!(b["studentCode"], json!("CBSE-05-002"));

    let c = request_ok(&mut stdin, &mut reader, "4", "students.create", create_params("Chirag", "IGCSE", json!("5")));
    assert_eq!(c["studentCode"], json!("IGCSE-05-001"));

    let next = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.nextCode",
        json!({ "board": "CBSE", "grade": "5" }),
    );
    assert_eq!(next["studentCode"], json!("CBSE-05-003"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.list",
        json!({ "board": "cbse" }),
    );
    let codes: Vec<&str> = listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["studentCode"].as_str())
        .collect();
    assert_eq!(codes, vec!["CBSE-05-001", "CBSE-05-002"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_update_recomputes_fees_and_keeps_payments() {
    let workspace = temp_dir("tutord-students-update");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(&mut stdin, &mut reader, "2", "students.create", create_params("Asha", "CBSE", json!("5")));
    let student_id = created["studentId"].as_str().expect("studentId").to_string();

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.markInstallmentPaid",
        json!({ "studentId": student_id, "index": 0 }),
    );
    assert_eq!(paid["balanceDue"], json!(780));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({
            "studentId": student_id,
            "patch": {
                "subjects": [
                    { "name": "Mathematics", "startDate": "2024-01-01", "endDate": "2024-01-30" },
                    { "name": "Science", "startDate": "2024-01-01", "endDate": "2024-01-30" }
                ]
            }
        }),
    );
    assert_eq!(updated["feesRecomputed"], json!(true));
    assert_eq!(updated["fees"]["finalTotal"], json!(2343));
    assert_eq!(updated["fees"]["installments"][0]["paid"], json!(true));
    assert_eq!(updated["fees"]["installments"][1]["paid"], json!(false));

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": student_id, "patch": { "phone": "98200 00000" } }),
    );
    assert_eq!(renamed["feesRecomputed"], json!(false));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": student_id, "patch": { "studentCode": "CBSE-05-999" } }),
    );
    assert_eq!(code, "bad_params");

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(got["student"]["studentCode"], json!("CBSE-05-001"));
    assert_eq!(got["student"]["phone"], json!("98200 00000"));
    assert_eq!(got["student"]["balanceDue"], json!(1562));

    let bad_index = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "students.markInstallmentPaid",
        json!({ "studentId": student_id, "index": 3 }),
    );
    assert_eq!(bad_index, "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "tests.submit",
        json!({ "studentId": student_id, "subject": "Science", "testDate": "2024-02-01", "marks": 17, "outOf": 25 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let missing = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(missing, "not_found");
    let tests = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "tests.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(tests["tests"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_create_validates_toggles_and_subjects() {
    let workspace = temp_dir("tutord-students-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut params = create_params("Asha", "CBSE", json!("5"));
    params["feeToggles"] = json!({ "scholarshipApplied": true, "scholarshipPercentage": 15 });
    let code = request_err(&mut stdin, &mut reader, "2", "students.create", params);
    assert_eq!(code, "bad_params");

    let mut params = create_params("Asha", "CBSE", json!("5"));
    params["subjects"] = json!([{ "name": "Math", "startDate": "2024-02-01", "endDate": "2024-01-01" }]);
    let code = request_err(&mut stdin, &mut reader, "3", "students.create", params);
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "lastName": "Patil", "board": "CBSE", "grade": "5" }),
    );
    assert_eq!(code, "bad_params");

    let mut params = create_params("Asha", "CBSE", json!("500"));
    params["feeToggles"] = json!({ "gstApplied": true });
    let code = request_err(&mut stdin, &mut reader, "4b", "students.create", params);
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4c",
        "fees.compute",
        json!({
            "board": "CBSE",
            "branch": "Andheri",
            "grade": 500,
            "subjects": [{ "name": "Math", "startDate": "2024-01-01", "endDate": "2024-01-30" }],
            "toggles": { "gstApplied": true }
        }),
    );
    assert_eq!(code, "bad_params");

    // A rejected create must not consume a code.
    let next = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.nextCode",
        json!({ "board": "CBSE", "grade": 5 }),
    );
    assert_eq!(next["studentCode"], json!("CBSE-05-001"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
