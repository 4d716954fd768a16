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

fn spawn_sidecar(today: &str) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_certd");
    let mut child = Command::new(exe)
        .env("CERTD_TODAY", today)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn certd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn result_of(value: &serde_json::Value) -> serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response: {}",
        value
    );
    value.get("result").expect("result").clone()
}

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected error response: {}",
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

struct Ctx {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: u32,
}

impl Ctx {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.seq.to_string(),
            method,
            params,
        )
    }

    fn sync_user(&mut self, email: &str, name: &str) -> String {
        let synced = result_of(&self.call(
            "users.syncProfile",
            json!({ "email": email, "name": name }),
        ));
        synced["user"]["id"].as_str().expect("user id").to_string()
    }

    fn track_by_cadence(&mut self, cadence: &str) -> String {
        let tracks = result_of(&self.call("tracks.list", json!({})));
        tracks["tracks"]
            .as_array()
            .expect("tracks array")
            .iter()
            .find(|t| t["cadence"].as_str() == Some(cadence))
            .and_then(|t| t["id"].as_str())
            .expect("track by cadence")
            .to_string()
    }

    fn submit(&mut self, user: &str, track: &str, date: &str) {
        let resp = self.call(
            "certifications.submit",
            json!({
                "userId": user,
                "trackId": track,
                "certificationDate": date,
                "url": format!("https://blog.example.com/{}", date)
            }),
        );
        let _ = result_of(&resp);
    }

    fn all_certs(&mut self, admin: &str) -> Vec<serde_json::Value> {
        let listed = result_of(&self.call(
            "certifications.list",
            json!({ "requesterId": admin }),
        ));
        listed["certifications"].as_array().expect("array").clone()
    }
}

#[test]
fn reset_backs_up_deletes_deactivates_and_opens_next_term() {
    let workspace = temp_dir("certd-reset");
    let (mut child, stdin, reader) = spawn_sidecar("2025-01-15");
    let mut ctx = Ctx {
        stdin,
        reader,
        seq: 0,
    };
    let _ = ctx.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = ctx.sync_user("admin@example.com", "Admin");
    let member = ctx.sync_user("member@example.com", "Member");
    let _ = ctx.call(
        "periods.create",
        json!({
            "userId": admin,
            "startDate": "2025-01-01",
            "endDate": "2025-01-31"
        }),
    );
    let track = ctx.track_by_cadence("daily-weekday");
    for user in [&admin, &member] {
        let _ = ctx.call(
            "tracks.enroll",
            json!({ "userId": user, "trackId": track }),
        );
    }
    ctx.submit(&admin, &track, "2025-01-10");
    ctx.submit(&member, &track, "2025-01-13");
    ctx.submit(&member, &track, "2025-01-14");
    assert_eq!(ctx.all_certs(&admin).len(), 3);

    // Non-admin and anonymous callers are refused outright.
    let forbidden = ctx.call(
        "admin.resetPeriod",
        json!({
            "userId": member,
            "beforeDate": "2025-01-16",
            "nextPeriodStart": "2025-02-01",
            "nextPeriodEnd": "2025-02-28"
        }),
    );
    assert_eq!(error_code(&forbidden), "forbidden");
    let anonymous = ctx.call(
        "admin.resetPeriod",
        json!({
            "beforeDate": "2025-01-16",
            "nextPeriodStart": "2025-02-01",
            "nextPeriodEnd": "2025-02-28"
        }),
    );
    assert_eq!(error_code(&anonymous), "unauthenticated");

    // A validation failure must leave everything untouched.
    let inverted = ctx.call(
        "admin.resetPeriod",
        json!({
            "userId": admin,
            "beforeDate": "2025-01-16",
            "nextPeriodStart": "2025-03-01",
            "nextPeriodEnd": "2025-02-01"
        }),
    );
    assert_eq!(error_code(&inverted), "bad_params");
    assert_eq!(ctx.all_certs(&admin).len(), 3);
    let periods = result_of(&ctx.call("periods.list", json!({})));
    assert_eq!(periods["periods"].as_array().expect("periods").len(), 1);

    let reset = result_of(&ctx.call(
        "admin.resetPeriod",
        json!({
            "userId": admin,
            "beforeDate": "2025-01-16",
            "nextPeriodStart": "2025-02-01",
            "nextPeriodEnd": "2025-02-28",
            "reason": "term rollover"
        }),
    ));
    assert_eq!(reset["backedUp"].as_u64(), Some(3));
    assert_eq!(reset["deleted"].as_u64(), Some(3));
    assert_eq!(reset["enrollmentsDeactivated"].as_u64(), Some(2));
    assert_eq!(reset["newPeriod"]["termNumber"].as_i64(), Some(2));

    // Live table emptied, backups carry the core fields.
    assert_eq!(ctx.all_certs(&admin).len(), 0);
    let backups = result_of(&ctx.call("admin.listBackups", json!({ "userId": admin })));
    let backups = backups["backups"].as_array().expect("backups");
    assert_eq!(backups.len(), 3);
    let member_days: Vec<&str> = backups
        .iter()
        .filter(|b| b["userId"].as_str() == Some(member.as_str()))
        .map(|b| b["certificationDate"].as_str().expect("date"))
        .collect();
    assert_eq!(member_days.len(), 2);
    assert!(member_days.contains(&"2025-01-13"));
    assert!(member_days.contains(&"2025-01-14"));
    for b in backups {
        assert_eq!(b["deletedBy"].as_str(), Some(admin.as_str()));
        assert_eq!(b["deleteReason"].as_str(), Some("term rollover"));
        assert!(b["originalId"].as_str().is_some());
    }

    // Everyone is unenrolled, and the new term is the active period.
    for user in [&admin, &member] {
        let enrollments = result_of(&ctx.call(
            "tracks.enrollments",
            json!({ "userId": user }),
        ));
        assert_eq!(
            enrollments["enrollments"].as_array().expect("array").len(),
            0
        );
    }
    let active = result_of(&ctx.call("periods.getActive", json!({})));
    assert_eq!(active["period"]["termNumber"].as_i64(), Some(2));
    let periods = result_of(&ctx.call("periods.list", json!({})));
    assert_eq!(periods["periods"].as_array().expect("periods").len(), 2);

    drop(ctx.stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_delete_scopes_to_track_and_date() {
    let workspace = temp_dir("certd-bulk-delete");
    let (mut child, stdin, reader) = spawn_sidecar("2025-01-15");
    let mut ctx = Ctx {
        stdin,
        reader,
        seq: 0,
    };
    let _ = ctx.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = ctx.sync_user("admin@example.com", "Admin");
    let _ = ctx.call(
        "periods.create",
        json!({
            "userId": admin,
            "startDate": "2025-01-01",
            "endDate": "2025-01-31"
        }),
    );
    let daily = ctx.track_by_cadence("daily-weekday");
    let weekly = ctx.track_by_cadence("weekly-sunday");
    for track in [&daily, &weekly] {
        let _ = ctx.call(
            "tracks.enroll",
            json!({ "userId": admin, "trackId": track }),
        );
    }
    ctx.submit(&admin, &daily, "2025-01-08");
    ctx.submit(&admin, &daily, "2025-01-13");
    ctx.submit(&admin, &weekly, "2025-01-05");
    ctx.submit(&admin, &weekly, "2025-01-12");

    // Scoped to the weekly track: the daily rows survive, as does the weekly
    // row on the cutoff date itself (strictly-before semantics).
    let out = result_of(&ctx.call(
        "admin.bulkDeleteCertifications",
        json!({
            "userId": admin,
            "beforeDate": "2025-01-12",
            "trackId": weekly
        }),
    ));
    assert_eq!(out["deleted"].as_u64(), Some(1));

    let remaining = ctx.all_certs(&admin);
    assert_eq!(remaining.len(), 3);
    assert!(remaining
        .iter()
        .all(|c| c["certificationDate"].as_str() != Some("2025-01-05")));

    let backups = result_of(&ctx.call("admin.listBackups", json!({ "userId": admin })));
    let backups = backups["backups"].as_array().expect("backups");
    assert_eq!(backups.len(), 1);
    assert_eq!(
        backups[0]["certificationDate"].as_str(),
        Some("2025-01-05")
    );
    assert_eq!(backups[0]["trackId"].as_str(), Some(weekly.as_str()));

    drop(ctx.stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
