use std::collections::HashSet;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::tree;

/// Escalating shutdown of process trees: `SIGTERM` to every descendant,
/// a bounded liveness poll, then `SIGKILL` for whatever is left.
#[derive(Debug, Clone, Copy)]
pub struct Termination {
	pub grace: Duration,
	pub poll: Duration,
}

impl Default for Termination {
	fn default() -> Self {
		Self { grace: Duration::from_secs(5), poll: Duration::from_secs(1) }
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
	pub signaled: Vec<u32>,
	pub exited: Vec<u32>,
	pub killed: Vec<u32>,
}

impl Termination {
	pub async fn terminate(&self, pids: &[u32]) -> TerminationReport {
		let table = tree::process_table();
		let targets: HashSet<u32> = pids
			.iter()
			.flat_map(|&pid| tree::descendants_in(&table, pid))
			.filter(|&pid| addressable(pid) && pid != std::process::id())
			.collect();

		let mut report = TerminationReport::default();
		if targets.is_empty() {
			return report;
		}

		for &pid in &targets {
			match send(pid, Signal::SIGTERM) {
				Ok(()) => report.signaled.push(pid),
				Err(Errno::ESRCH) => tracing::debug!("pid {} already gone", pid),
				Err(e) => tracing::warn!("SIGTERM to {} failed: {}", pid, e),
			}
		}

		let started = Instant::now();
		let mut remaining: Vec<u32> = targets.iter().copied().collect();
		loop {
			remaining.retain(|&pid| is_alive(pid));
			if remaining.is_empty() || started.elapsed() >= self.grace {
				break;
			}
			let left = self.grace.saturating_sub(started.elapsed());
			tokio::time::sleep(self.poll.min(left)).await;
		}

		for &pid in &remaining {
			tracing::warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, self.grace);
			match send(pid, Signal::SIGKILL) {
				Ok(()) | Err(Errno::ESRCH) => {}
				Err(e) => tracing::warn!("SIGKILL to {} failed: {}", pid, e),
			}
		}

		report.exited = targets.iter().copied().filter(|pid| !remaining.contains(pid)).collect();
		report.killed = remaining;
		report
	}
}

/// Zero-signal probe. `EPERM` means the pid exists but belongs to someone else.
pub fn is_alive(pid: u32) -> bool {
	if !addressable(pid) {
		return false;
	}
	match kill(Pid::from_raw(pid as i32), None) {
		Ok(()) => true,
		Err(Errno::EPERM) => true,
		Err(_) => false,
	}
}

fn send(pid: u32, signal: Signal) -> Result<(), Errno> {
	kill(Pid::from_raw(pid as i32), signal)
}

// pid 0 and negative values address process groups, pid 1 is init.
fn addressable(pid: u32) -> bool {
	pid > 1 && pid <= i32::MAX as u32
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn refuses_group_and_init_pids() {
		assert!(!is_alive(0));
		assert!(!is_alive(1));
		assert!(!is_alive(u32::MAX));
	}

	#[test]
	fn current_process_is_alive() {
		assert!(is_alive(std::process::id()));
	}

	#[tokio::test]
	async fn terminate_of_nothing_returns_immediately() {
		let report = Termination::default().terminate(&[]).await;
		assert_eq!(report, TerminationReport::default());
	}
}
