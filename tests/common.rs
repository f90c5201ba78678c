#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rollcall::{
    Attendance, Config, MemoryLedger, MemoryStore, ParticipantId, ParticipantProfile, StaticRoster,
};

pub const ROSTER_JSON: &str = r#"{
    "D1":   { "name": "Ada Lovelace",  "committee": "UNSC",  "portfolio": "France" },
    "D2":   { "name": "Grace Hopper",  "committee": "UNSC",  "portfolio": "Kenya" },
    "D100": { "name": "Alan Turing",   "committee": "DISEC", "portfolio": "Brazil" },
    "D101": { "name": "Edsger Dijkstra", "committee": "DISEC", "portfolio": "" }
}"#;

pub fn roster() -> StaticRoster {
    StaticRoster::from_json_str(ROSTER_JSON).expect("parse roster fixture")
}

/// Roster of `n` generated participants `P0000..`.
pub fn numbered_roster(n: usize) -> StaticRoster {
    (0..n)
        .map(|i| {
            (
                ParticipantId::new(participant(i)),
                ParticipantProfile::new(format!("Participant {i}"), "GA"),
            )
        })
        .collect()
}

pub fn participant(i: usize) -> String {
    format!("P{i:04}")
}

pub struct Harness {
    pub attendance: Attendance,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MemoryLedger>,
}

pub fn memory_attendance(roster: StaticRoster, config: &Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let attendance = Attendance::new(store.clone(), ledger.clone(), Arc::new(roster), config)
        .expect("build attendance");
    Harness {
        attendance,
        store,
        ledger,
    }
}

/// Config whose background triggers stay out of the way of a short test.
pub fn quiet_config() -> Config {
    Config {
        batch_threshold: 10_000,
        flush_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
