//! Lifecycle of the optionally spawned target application process.

use std::collections::HashMap;

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{info, warn};

pub struct TargetProcess {
	child: Child,
}

impl TargetProcess {
	/// Start the configured command through the shell. `PORT` is set last so
	/// the target always binds where the proxy forwards, whatever the
	/// configured env map says.
	pub fn spawn(
		command: &str,
		env: &HashMap<String, String>,
		target_port: u16,
	) -> anyhow::Result<TargetProcess> {
		let mut cmd = shell_command(command);
		cmd
			.envs(env)
			.env("PORT", target_port.to_string())
			.kill_on_drop(true);
		let child = cmd
			.spawn()
			.with_context(|| format!("starting target process `{command}`"))?;
		info!(pid = child.id(), command, "started target process");
		Ok(TargetProcess { child })
	}

	pub async fn shutdown(mut self) {
		match self.child.kill().await {
			Ok(()) => info!("target process terminated"),
			Err(err) => warn!("failed to terminate target process: {err}"),
		}
	}
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
	let mut cmd = Command::new("sh");
	cmd.arg("-c").arg(command);
	cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
	let mut cmd = Command::new("cmd");
	cmd.arg("/C").arg(command);
	cmd
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn spawns_and_terminates_a_shell_command() {
		let target =
			TargetProcess::spawn("sleep 30", &HashMap::new(), 3000).expect("spawn sleep");
		target.shutdown().await;
	}

	#[tokio::test]
	async fn spawn_failure_is_an_error() {
		// An unspawnable shell would be required to make `sh -c` itself fail,
		// so exercise the error path through a bogus program name instead.
		let mut cmd = Command::new("/nonexistent/definitely-not-a-binary");
		assert!(cmd.spawn().is_err());
	}
}
