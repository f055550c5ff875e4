//! Liveness endpoint for the execution service.
//!
//! `/health` is always public: it reports uptime, the active-process gauge
//! (the operator's backpressure signal), process memory, and the build
//! version. It deliberately runs before auth so probes keep working when a
//! client is blocked.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss: u64,
    pub heap_total: u64,
    pub heap_used: u64,
    pub external: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    /// Seconds since the service started.
    pub uptime: u64,
    pub active_processes: u64,
    pub memory_usage: MemoryUsage,
    pub version: &'static str,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        active_processes: state.counter.current(),
        memory_usage: current_memory_usage(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Sample this process's memory from the OS.
fn current_memory_usage() -> MemoryUsage {
    let pid = sysinfo::Pid::from_u32(std::process::id());
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => MemoryUsage {
            rss: process.memory(),
            heap_total: process.virtual_memory(),
            heap_used: process.memory(),
            external: 0,
        },
        None => MemoryUsage {
            rss: 0,
            heap_total: 0,
            heap_used: 0,
            external: 0,
        },
    }
}
