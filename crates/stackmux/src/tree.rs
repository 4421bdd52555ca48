use std::collections::{HashMap, HashSet};

use sysinfo::System;

/// Every `(pid, ppid)` pair currently known to the OS.
pub fn process_table() -> Vec<(u32, u32)> {
	let mut system = System::new();
	system.refresh_processes();
	system
		.processes()
		.iter()
		.filter_map(|(pid, process)| process.parent().map(|parent| (pid.as_u32(), parent.as_u32())))
		.collect()
}

/// `root` plus all of its transitive children in the live process table.
pub fn descendants(root: u32) -> HashSet<u32> {
	descendants_in(&process_table(), root)
}

/// Reachability walk from `root` over a `(pid, ppid)` listing. `root` is
/// always part of the result, even if it has already exited.
pub fn descendants_in(table: &[(u32, u32)], root: u32) -> HashSet<u32> {
	let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
	for &(pid, ppid) in table {
		if pid != ppid {
			children.entry(ppid).or_default().push(pid);
		}
	}

	let mut found = HashSet::from([root]);
	let mut pending = vec![root];
	while let Some(pid) = pending.pop() {
		if let Some(kids) = children.get(&pid) {
			for &kid in kids {
				if found.insert(kid) {
					pending.push(kid);
				}
			}
		}
	}
	found
}
