use std::process::Stdio;

use nix::{
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::types::{MonitorConfig, MonitorError};

/// Spawn one instance of the configured command.
pub(crate) fn spawn_child(config: &MonitorConfig) -> Result<Child, MonitorError> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if config.kill_tree {
        // New group whose id equals the child's pid.
        cmd.process_group(0);
    }

    cmd.spawn().map_err(|source| MonitorError::Spawn {
        program: config.program.clone(),
        source,
    })
}

/// SIGTERM the child (or its whole group), escalating to SIGKILL after the grace period.
pub(crate) async fn terminate(child: &mut Child, config: &MonitorConfig) -> Option<i32> {
    let pid = child.id();
    if let Some(pid) = pid {
        send_signal(pid, config.kill_tree, Signal::SIGTERM);
    }

    match tokio::time::timeout(config.stop_grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!("Failed to reap detector process: {err}");
            None
        }
        Err(_) => {
            warn!(
                "Detector process ignored SIGTERM for {:?}; killing",
                config.stop_grace
            );
            if let Some(pid) = pid {
                send_signal(pid, config.kill_tree, Signal::SIGKILL);
            }
            if let Err(err) = child.kill().await {
                debug!("kill after SIGKILL: {err}");
            }
            child.wait().await.ok().and_then(|status| status.code())
        }
    }
}

fn send_signal(pid: u32, whole_group: bool, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    let result = if whole_group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    if let Err(err) = result {
        debug!(pid, ?signal, "signal delivery failed: {err}");
    }
}
