//! Startup singleton enforcement and port selection.
//!
//! One server per workdir: a second startup against a workdir whose
//! `status.json` names a live PID in a running state must abort without
//! touching the file. A dead PID in a running state is rewritten as
//! `crashed` so clients can distinguish crash from clean stop.

use std::net::TcpListener;

use anyhow::{bail, Result};
use serde_json::Value;

use super::status::{ServerStatus, StatusManager};
use super::Project;

/// How many consecutive ports to probe before giving up.
const MAX_PORT_PROBE: u16 = 200;

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Enforce the per-workdir singleton and choose a listen port.
///
/// On success, `status.json` holds `server_status = "starting"` with our PID
/// and the chosen port. Returns the port.
pub fn ensure_singleton_and_select_port(
    project: &Project,
    status: &StatusManager,
    host: &str,
    base_port: u16,
) -> Result<u16> {
    let existing = status.get_status();
    let existing_pid = existing
        .get("server_pid")
        .and_then(Value::as_u64)
        .map(|p| p as u32);
    let existing_status = existing
        .get("server_status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let was_running = matches!(existing_status.as_str(), "starting" | "ready" | "stopping");

    if let Some(pid) = existing_pid {
        if was_running && pid_alive(pid) {
            bail!(
                "Server already running for project {} at port {:?} (pid {}, status {})",
                project.name(),
                existing.get("port").and_then(Value::as_u64),
                pid,
                existing_status
            );
        }
        if was_running {
            // Running state with a dead PID: previous server crashed.
            status.update_server_status(
                ServerStatus::Crashed,
                None,
                None,
                Some(&format!(
                    "Server process (pid {pid}) terminated unexpectedly while in '{existing_status}' state"
                )),
            );
        }
    }

    let mut chosen = base_port;
    let mut found = false;
    for _ in 0..MAX_PORT_PROBE {
        if port_free(host, chosen) {
            found = true;
            break;
        }
        chosen += 1;
    }
    if !found {
        bail!("Could not find a free port starting at {base_port}");
    }

    status.update_server_status(
        ServerStatus::Starting,
        Some(std::process::id()),
        Some(chosen),
        None,
    );
    Ok(chosen)
}
