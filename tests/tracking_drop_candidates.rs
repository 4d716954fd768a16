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
}

fn overview_row<'a>(
    rows: &'a [serde_json::Value],
    track_id: &str,
) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| r["trackId"].as_str() == Some(track_id))
        .expect("overview row for track")
}

#[test]
fn trailing_window_misses_flag_drop_candidates_and_bump_warnings() {
    let workspace = temp_dir("certd-drop-candidates");
    // Friday Jan 17: the daily trailing window is Mon 13th .. Fri 17th.
    let (mut child, stdin, reader) = spawn_sidecar("2025-01-17");
    let mut ctx = Ctx {
        stdin,
        reader,
        seq: 0,
    };
    let _ = ctx.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let synced = result_of(&ctx.call(
        "users.syncProfile",
        json!({ "email": "admin@example.com", "name": "Admin" }),
    ));
    let admin = synced["user"]["id"].as_str().expect("user id").to_string();
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

    // No submissions at all: five weekday misses and the one Sunday miss.
    let overview = result_of(&ctx.call(
        "admin.trackingOverview",
        json!({ "userId": admin, "year": 2025, "month": 1 }),
    ));
    let rows = overview["rows"].as_array().expect("rows").clone();
    assert_eq!(rows.len(), 2);

    let daily_row = overview_row(&rows, &daily);
    assert_eq!(daily_row["dropCheck"]["windowMissing"].as_u64(), Some(5));
    assert_eq!(daily_row["dropCheck"]["isCandidate"].as_bool(), Some(true));
    assert_eq!(daily_row["warningCount"].as_i64(), Some(5));

    let weekly_row = overview_row(&rows, &weekly);
    assert_eq!(weekly_row["dropCheck"]["windowMissing"].as_u64(), Some(1));
    assert_eq!(weekly_row["dropCheck"]["isCandidate"].as_bool(), Some(true));

    // Catch up: today's daily proof and last Sunday's weekly proof.
    for (track, date) in [(&daily, "2025-01-17"), (&weekly, "2025-01-12")] {
        let resp = ctx.call(
            "certifications.submit",
            json!({
                "userId": admin,
                "trackId": track,
                "certificationDate": date,
                "url": format!("https://blog.example.com/{}", date)
            }),
        );
        let _ = result_of(&resp);
    }

    let overview = result_of(&ctx.call(
        "admin.trackingOverview",
        json!({ "userId": admin, "year": 2025, "month": 1 }),
    ));
    let rows = overview["rows"].as_array().expect("rows").clone();

    let daily_row = overview_row(&rows, &daily);
    assert_eq!(daily_row["dropCheck"]["windowMissing"].as_u64(), Some(4));
    assert_eq!(daily_row["dropCheck"]["isCandidate"].as_bool(), Some(false));
    // warning_count only ever ratchets up.
    assert_eq!(daily_row["warningCount"].as_i64(), Some(5));

    let weekly_row = overview_row(&rows, &weekly);
    assert_eq!(weekly_row["dropCheck"]["windowMissing"].as_u64(), Some(0));
    assert_eq!(weekly_row["dropCheck"]["isCandidate"].as_bool(), Some(false));

    // The participant dashboard carries the same drop check.
    let dashboard = result_of(&ctx.call(
        "dashboard.open",
        json!({ "userId": admin, "year": 2025, "month": 1 }),
    ));
    let cards = dashboard["tracks"].as_array().expect("cards");
    let daily_card = cards
        .iter()
        .find(|c| c["trackId"].as_str() == Some(daily.as_str()))
        .expect("daily card");
    assert_eq!(daily_card["dropCheck"]["isCandidate"].as_bool(), Some(false));
    assert_eq!(daily_card["summary"]["currentStreak"].as_u64(), Some(1));

    drop(ctx.stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn track_filter_narrows_overview() {
    let workspace = temp_dir("certd-tracking-filter");
    let (mut child, stdin, reader) = spawn_sidecar("2025-01-17");
    let mut ctx = Ctx {
        stdin,
        reader,
        seq: 0,
    };
    let _ = ctx.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let synced = result_of(&ctx.call(
        "users.syncProfile",
        json!({ "email": "admin@example.com", "name": "Admin" }),
    ));
    let admin = synced["user"]["id"].as_str().expect("user id").to_string();
    let _ = ctx.call(
        "periods.create",
        json!({
            "userId": admin,
            "startDate": "2025-01-01",
            "endDate": "2025-01-31"
        }),
    );
    let daily = ctx.track_by_cadence("daily-weekday");
    let weekly = ctx.track_by_cadence("weekly-tuesday");
    for track in [&daily, &weekly] {
        let _ = ctx.call(
            "tracks.enroll",
            json!({ "userId": admin, "trackId": track }),
        );
    }

    let overview = result_of(&ctx.call(
        "admin.trackingOverview",
        json!({
            "userId": admin,
            "year": 2025,
            "month": 1,
            "trackId": daily
        }),
    ));
    let rows = overview["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["trackId"].as_str(), Some(daily.as_str()));

    drop(ctx.stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
