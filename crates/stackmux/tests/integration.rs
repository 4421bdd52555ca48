use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stackmux::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("stackmux-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn quick() -> Termination {
	Termination { grace: Duration::from_millis(800), poll: Duration::from_millis(100) }
}

fn node(name: &str, project: &str, run: &[&str]) -> Node {
	Node {
		name: name.to_string(),
		projects: vec![ProjectBundle {
			name: project.to_string(),
			run: run.iter().map(|s| s.to_string()).collect(),
			..Default::default()
		}],
	}
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
	let started = Instant::now();
	while started.elapsed() < timeout {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	check()
}

async fn read_until(output: &UnitOutput, needle: &str) -> bool {
	let started = Instant::now();
	while started.elapsed() < Duration::from_secs(5) {
		match output.try_read_line() {
			ReadOutcome::Line(line) if line.contains(needle) => return true,
			ReadOutcome::Line(_) => {}
			_ => tokio::time::sleep(Duration::from_millis(20)).await,
		}
	}
	false
}

// --- Termination ---

#[tokio::test]
async fn terminate_signals_whole_tree() {
	let mut child = std::process::Command::new("sh")
		.args(["-c", "sleep 60 & sleep 60 & wait"])
		.spawn()
		.unwrap();
	let root = child.id();
	tokio::time::sleep(Duration::from_millis(300)).await;

	let tree = tree::descendants(root);
	assert!(tree.len() >= 3, "tree was {:?}", tree);

	let waiter = std::thread::spawn(move || child.wait());
	let started = Instant::now();
	let report = Termination { grace: Duration::from_secs(2), poll: Duration::from_millis(100) }
		.terminate(&[root])
		.await;
	assert!(started.elapsed() < Duration::from_secs(4));
	for pid in &tree {
		assert!(report.signaled.contains(pid), "{} was not signaled", pid);
	}

	let status = waiter.join().unwrap().unwrap();
	assert!(!status.success());
	assert!(!is_alive(root));
}

#[tokio::test]
async fn terminate_escalates_to_sigkill() {
	let mut child = std::process::Command::new("sh")
		.args(["-c", "trap '' TERM; sleep 60"])
		.spawn()
		.unwrap();
	let root = child.id();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let waiter = std::thread::spawn(move || child.wait());
	let started = Instant::now();
	let report = quick().terminate(&[root]).await;
	let elapsed = started.elapsed();

	assert!(report.killed.contains(&root), "report: {:?}", report);
	assert!(elapsed >= Duration::from_millis(800));
	assert!(elapsed < Duration::from_secs(3));

	waiter.join().unwrap().unwrap();
	assert!(!is_alive(root));
}

#[tokio::test]
async fn terminate_tolerates_exited_pids() {
	let mut child = std::process::Command::new("true").spawn().unwrap();
	let pid = child.id();
	child.wait().unwrap();

	let report = quick().terminate(&[pid]).await;
	assert!(report.killed.is_empty());
}

// --- RunUnit ---

#[tokio::test]
async fn unit_spawn_read_and_stop() {
	let dir = temp_dir("unit");
	let mut unit = RunUnit::new("api", "echo hello-stackmux; sleep 30", &dir, false, "dev");
	let pid = unit.spawn(&Shell::sh()).unwrap();
	assert_eq!(unit.pid(), Some(pid));
	assert!(unit.is_alive());

	let output = unit.output().unwrap();
	assert_eq!(output.project, "api");
	assert!(read_until(&output, "hello-stackmux").await);

	let report = unit.stop(&quick()).await.unwrap();
	assert!(report.signaled.contains(&pid));
	assert!(wait_until(Duration::from_secs(2), || !unit.is_alive()).await);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unit_runs_in_project_dir() {
	let dir = temp_dir("cwd");
	let mut unit = RunUnit::new("api", "pwd; sleep 30", &dir, false, "dev");
	unit.spawn(&Shell::sh()).unwrap();

	let output = unit.output().unwrap();
	let name = dir.file_name().unwrap().to_string_lossy().to_string();
	assert!(read_until(&output, &name).await);

	unit.stop(&quick()).await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unit_restart_keeps_seq_and_replaces_pid() {
	let dir = temp_dir("restart");
	let mut unit = RunUnit::new("api", "sleep 30", &dir, false, "dev");
	unit.seq = 7;
	let first = unit.spawn(&Shell::sh()).unwrap();

	let second = unit.restart(&Shell::sh(), &quick()).await.unwrap();
	assert_ne!(first, second);
	assert_eq!(unit.seq, 7);
	assert!(unit.is_alive());
	assert!(wait_until(Duration::from_secs(2), || !is_alive(first)).await);

	unit.stop(&quick()).await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unit_not_alive_after_forced_kill() {
	let dir = temp_dir("stubborn");
	let mut unit = RunUnit::new("api", "trap '' TERM; sleep 60", &dir, false, "dev");
	let pid = unit.spawn(&Shell::sh()).unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let report = unit.stop(&quick()).await.unwrap();
	assert!(!report.killed.is_empty(), "report: {:?}", report);
	assert!(wait_until(Duration::from_secs(2), || !unit.is_alive()).await);
	assert!(wait_until(Duration::from_secs(2), || !is_alive(pid)).await);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_on_unspawned_unit_is_noop() {
	let mut unit = RunUnit::new("api", "sleep 30", &std::env::temp_dir(), false, "dev");
	assert!(unit.stop(&quick()).await.is_none());
}

#[tokio::test]
async fn stop_on_exited_unit_is_noop() {
	let dir = temp_dir("exited");
	let mut unit = RunUnit::new("api", "exit 0", &dir, false, "dev");
	unit.spawn(&Shell::sh()).unwrap();
	assert!(wait_until(Duration::from_secs(3), || !unit.is_alive()).await);

	assert!(unit.stop(&quick()).await.is_none());
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn output_closes_after_last_line() {
	let dir = temp_dir("closed");
	let mut unit = RunUnit::new("api", "echo last-words", &dir, false, "dev");
	unit.spawn(&Shell::sh()).unwrap();
	let output = unit.output().unwrap();
	assert!(wait_until(Duration::from_secs(3), || !output.is_alive()).await);
	assert!(output.has_more());

	assert!(read_until(&output, "last-words").await);
	let closed = wait_until(Duration::from_secs(3), || {
		matches!(output.try_read_line(), ReadOutcome::Closed)
	})
	.await;
	assert!(closed);
	assert!(!output.has_more());
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Configuration + multiplexer ---

#[tokio::test]
async fn multiplexer_feeds_sink_while_silent() {
	let root = temp_dir("mux");
	std::fs::create_dir_all(root.join("web")).unwrap();
	let options = AssemblyOptions { projects_dir: root.clone(), ..Default::default() };
	let mut live = RunConfiguration::assemble(
		&[node("dev", "web", &["echo web-ready; sleep 30", "echo ERROR boom; sleep 30"])],
		&options,
	);
	for unit in live.units_mut() {
		unit.spawn(&Shell::sh()).unwrap();
	}

	let log = root.join("out.log");
	let mut mux = Multiplexer::new(live.snapshot(), Arc::new(Plain));
	mux.set_silent(true).await;
	mux.set_sink(Some(LineSink::open(&log).unwrap())).await;
	mux.set_filter(Filter::new("ERROR/", false).unwrap()).await;
	mux.start();

	let found = wait_until(Duration::from_secs(5), || {
		std::fs::read_to_string(&log).map(|s| s.contains("[web] - ERROR boom")).unwrap_or(false)
	})
	.await;
	mux.stop().await;
	assert!(found);
	let text = std::fs::read_to_string(&log).unwrap();
	assert!(!text.contains("web-ready"), "filtered line leaked: {}", text);

	quick().terminate(&live.alive_pids()).await;
	let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn multiplexer_keeps_lines_of_exited_unit() {
	let root = temp_dir("crash");
	std::fs::create_dir_all(root.join("api")).unwrap();
	let options = AssemblyOptions { projects_dir: root.clone(), ..Default::default() };
	let mut live = RunConfiguration::assemble(&[node("dev", "api", &["echo FATAL port in use; exit 1"])], &options);
	for unit in live.units_mut() {
		unit.spawn(&Shell::sh()).unwrap();
	}
	assert!(wait_until(Duration::from_secs(3), || live.alive_pids().is_empty()).await);

	let log = root.join("out.log");
	let mut mux = Multiplexer::new(live.snapshot(), Arc::new(Plain));
	mux.set_silent(true).await;
	mux.set_sink(Some(LineSink::open(&log).unwrap())).await;
	mux.start();

	let found = wait_until(Duration::from_secs(5), || {
		std::fs::read_to_string(&log).map(|s| s.contains("[api] - FATAL port in use")).unwrap_or(false)
	})
	.await;
	mux.stop().await;
	assert!(found, "last line of the exited unit never reached the sink");
	let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn activating_shared_project_spawns_only_new_units() {
	let root = temp_dir("activate");
	std::fs::create_dir_all(root.join("api")).unwrap();
	let options = AssemblyOptions { projects_dir: root.clone(), ..Default::default() };

	let mut live = RunConfiguration::assemble(&[node("base", "api", &["sleep 30"])], &options);
	for unit in live.units_mut() {
		unit.spawn(&Shell::sh()).unwrap();
	}
	let original = live.units().next().and_then(|u| u.pid()).unwrap();

	let incoming = RunConfiguration::assemble(
		&[node("extra", "api", &["sleep 30", "sleep 31"])],
		&AssemblyOptions { first_seq: live.next_seq(), ..options.clone() },
	);
	let absorbed = live.absorb(incoming);
	assert!(absorbed.new_projects.is_empty());
	assert_eq!(absorbed.new_units, vec![3]);
	for seq in &absorbed.new_units {
		live.unit_mut(*seq).unwrap().spawn(&Shell::sh()).unwrap();
	}

	assert_eq!(live.units().count(), 2);
	assert_eq!(live.units().next().and_then(|u| u.pid()), Some(original));
	assert_eq!(live.alive_pids().len(), 2);

	// deactivating "extra" stops only the unit it alone asked for
	let doomed: Vec<u32> = live
		.units_owned_by("extra")
		.iter()
		.filter_map(|seq| live.units().find(|u| u.seq == *seq).and_then(|u| u.pid()))
		.collect();
	assert_eq!(doomed.len(), 1);
	quick().terminate(&doomed).await;
	let removed = live.detach_node("extra");
	assert_eq!(removed.len(), 1);
	assert!(wait_until(Duration::from_secs(2), || !removed[0].is_alive()).await);
	assert_eq!(live.alive_pids(), vec![original]);

	quick().terminate(&live.alive_pids()).await;
	let _ = std::fs::remove_dir_all(&root);
}
