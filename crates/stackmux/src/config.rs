use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::group::{Node, ProcessGroup, SetupPolicy};
use crate::unit::{RunUnit, UnitOutput};

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
	pub projects_dir: PathBuf,
	pub except: HashSet<String>,
	pub vars: HashMap<String, String>,
	pub test_mode: bool,
	pub setup_policy: SetupPolicy,
	pub first_seq: u32,
}

impl Default for AssemblyOptions {
	fn default() -> Self {
		Self {
			projects_dir: PathBuf::from("."),
			except: HashSet::new(),
			vars: HashMap::new(),
			test_mode: false,
			setup_policy: SetupPolicy::default(),
			first_seq: 1,
		}
	}
}

/// Replaces `$KEY` tokens. Longer keys go first so `$PORT_API` survives a
/// `PORT` entry.
pub fn substitute(command: &str, vars: &HashMap<String, String>) -> String {
	let mut keys: Vec<&String> = vars.keys().collect();
	keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
	let mut out = command.to_string();
	for key in keys {
		out = out.replace(&format!("${}", key), &vars[key]);
	}
	out
}

/// Read-only view of the live configuration handed to the multiplexer.
pub struct Snapshot {
	pub groups: Vec<GroupSnapshot>,
}

pub struct GroupSnapshot {
	pub project: String,
	pub outputs: Vec<Arc<UnitOutput>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Absorbed {
	pub new_projects: Vec<String>,
	pub new_units: Vec<u32>,
}

/// The live set of process groups, at most one per project.
#[derive(Default)]
pub struct RunConfiguration {
	pub groups: Vec<ProcessGroup>,
	nodes: Vec<String>,
}

impl RunConfiguration {
	pub fn assemble(nodes: &[Node], options: &AssemblyOptions) -> Self {
		let mut groups: Vec<ProcessGroup> = Vec::new();
		for node in nodes {
			for bundle in &node.projects {
				if options.except.contains(&bundle.name) {
					tracing::debug!("{}: excluded, skipping", bundle.name);
					continue;
				}
				let dir = options.projects_dir.join(&bundle.name);
				let existing = groups.iter().position(|g| g.project == bundle.name);
				// skip_setup is decided by the first occurrence only
				let skip_setup = existing.is_none() && options.setup_policy.skip_setup(&dir);
				let group = ProcessGroup::new(
					&node.name,
					bundle,
					&dir,
					options.test_mode,
					skip_setup,
					|cmd| substitute(cmd, &options.vars),
				);
				match existing {
					Some(index) => {
						groups[index].merge(group);
					}
					None => groups.push(group),
				}
			}
		}

		let mut config = Self {
			groups,
			nodes: nodes.iter().map(|n| n.name.clone()).collect(),
		};
		config.number_from(options.first_seq);
		config
	}

	/// Numbers every unit in group order starting at `start`; returns the
	/// next free number.
	pub fn number_from(&mut self, start: u32) -> u32 {
		let mut seq = start;
		for unit in self.groups.iter_mut().flat_map(|g| g.units.iter_mut()) {
			unit.seq = seq;
			seq += 1;
		}
		seq
	}

	pub fn next_seq(&self) -> u32 {
		self.units().map(|u| u.seq).max().map_or(1, |max| max + 1)
	}

	/// Merges a configuration assembled from `next_seq()` into this one.
	/// Units that already exist keep running; the returned sequence numbers
	/// are the ones that still need spawning.
	pub fn absorb(&mut self, incoming: RunConfiguration) -> Absorbed {
		let mut absorbed = Absorbed::default();
		for group in incoming.groups {
			match self.groups.iter().position(|g| g.project == group.project) {
				Some(index) => absorbed.new_units.extend(self.groups[index].merge(group)),
				None => {
					absorbed.new_projects.push(group.project.clone());
					absorbed.new_units.extend(group.units.iter().map(|u| u.seq));
					self.groups.push(group);
				}
			}
		}
		for node in incoming.nodes {
			if !self.nodes.contains(&node) {
				self.nodes.push(node);
			}
		}
		absorbed
	}

	/// Units that no other active node asked for.
	pub fn units_owned_by(&self, node: &str) -> Vec<u32> {
		self.units()
			.filter(|u| u.nodes.iter().all(|n| n == node))
			.map(|u| u.seq)
			.collect()
	}

	/// Removes `node` and every unit only it contributed. Callers stop those
	/// units first.
	pub fn detach_node(&mut self, node: &str) -> Vec<RunUnit> {
		let mut removed = Vec::new();
		for group in &mut self.groups {
			let (gone, kept): (Vec<RunUnit>, Vec<RunUnit>) = group
				.units
				.drain(..)
				.partition(|u| u.nodes.iter().all(|n| n == node));
			group.units = kept;
			for unit in &mut group.units {
				unit.nodes.retain(|n| n != node);
			}
			removed.extend(gone);
		}
		self.groups.retain(|g| !g.units.is_empty());
		self.nodes.retain(|n| n != node);
		removed
	}

	pub fn active_nodes(&self) -> &[String] {
		&self.nodes
	}

	pub fn units(&self) -> impl Iterator<Item = &RunUnit> {
		self.groups.iter().flat_map(|g| g.units.iter())
	}

	pub fn units_mut(&mut self) -> impl Iterator<Item = &mut RunUnit> {
		self.groups.iter_mut().flat_map(|g| g.units.iter_mut())
	}

	pub fn unit_mut(&mut self, seq: u32) -> Option<&mut RunUnit> {
		self.units_mut().find(|u| u.seq == seq)
	}

	pub fn alive_pids(&self) -> Vec<u32> {
		self.units().filter(|u| u.is_alive()).filter_map(|u| u.pid()).collect()
	}

	pub fn snapshot(&self) -> Arc<Snapshot> {
		Arc::new(Snapshot {
			groups: self
				.groups
				.iter()
				.map(|g| GroupSnapshot {
					project: g.project.clone(),
					outputs: g.units.iter().filter_map(|u| u.output()).collect(),
				})
				.collect(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::group::ProjectBundle;

	fn node(name: &str, projects: Vec<(&str, Vec<&str>)>) -> Node {
		Node {
			name: name.into(),
			projects: projects
				.into_iter()
				.map(|(project, run)| ProjectBundle {
					name: project.to_string(),
					run: run.iter().map(|s| s.to_string()).collect(),
					..Default::default()
				})
				.collect(),
		}
	}

	fn layout(config: &RunConfiguration) -> Vec<(String, Vec<(u32, String)>)> {
		config
			.groups
			.iter()
			.map(|g| {
				(g.project.clone(), g.units.iter().map(|u| (u.seq, u.command.clone())).collect())
			})
			.collect()
	}

	#[test]
	fn assemble_merges_and_numbers_globally() {
		let nodes = [
			node("base", vec![("A", vec!["cmd1", "cmd2"]), ("B", vec!["cmd1"])]),
			node("extra", vec![("A", vec!["cmd1", "cmd3"])]),
		];
		let config = RunConfiguration::assemble(&nodes, &AssemblyOptions::default());
		assert_eq!(
			layout(&config),
			vec![
				("A".to_string(), vec![(1, "cmd1".into()), (2, "cmd2".into()), (3, "cmd3".into())]),
				("B".to_string(), vec![(4, "cmd1".into())]),
			]
		);
		assert_eq!(config.active_nodes(), ["base", "extra"]);
	}

	#[test]
	fn assemble_skips_excluded_projects() {
		let nodes = [node("base", vec![("A", vec!["cmd1"]), ("B", vec!["cmd2"])])];
		let options = AssemblyOptions {
			except: HashSet::from(["A".to_string()]),
			..Default::default()
		};
		let config = RunConfiguration::assemble(&nodes, &options);
		assert_eq!(layout(&config), vec![("B".to_string(), vec![(1, "cmd2".into())])]);
	}

	#[test]
	fn assemble_substitutes_placeholders() {
		let nodes = [node("base", vec![("A", vec!["serve --port $PORT_API --host $HOST"])])];
		let options = AssemblyOptions {
			vars: HashMap::from([
				("PORT".to_string(), "1".to_string()),
				("PORT_API".to_string(), "3001".to_string()),
				("HOST".to_string(), "localhost".to_string()),
			]),
			..Default::default()
		};
		let config = RunConfiguration::assemble(&nodes, &options);
		assert_eq!(config.groups[0].units[0].command, "serve --port 3001 --host localhost");
	}

	#[test]
	fn assemble_places_projects_under_projects_dir() {
		let nodes = [node("base", vec![("api", vec!["run"])])];
		let options = AssemblyOptions { projects_dir: "/srv".into(), ..Default::default() };
		let config = RunConfiguration::assemble(&nodes, &options);
		assert_eq!(config.groups[0].dir, PathBuf::from("/srv/api"));
		assert_eq!(config.groups[0].units[0].dir, PathBuf::from("/srv/api"));
	}

	#[test]
	fn numbering_continues_from_start() {
		let nodes = [node("base", vec![("A", vec!["x", "y"])])];
		let options = AssemblyOptions { first_seq: 10, ..Default::default() };
		let mut config = RunConfiguration::assemble(&nodes, &options);
		assert_eq!(config.next_seq(), 12);
		assert_eq!(config.number_from(1), 3);
		assert_eq!(config.next_seq(), 3);
	}

	#[test]
	fn absorb_only_reports_new_units() {
		let mut live = RunConfiguration::assemble(
			&[node("base", vec![("A", vec!["cmd1", "cmd2"]), ("B", vec!["cmd1"])])],
			&AssemblyOptions::default(),
		);
		let incoming = RunConfiguration::assemble(
			&[node("extra", vec![("A", vec!["cmd1", "cmd3"]), ("C", vec!["worker"])])],
			&AssemblyOptions { first_seq: live.next_seq(), ..Default::default() },
		);
		let absorbed = live.absorb(incoming);
		assert_eq!(absorbed.new_projects, vec!["C"]);
		assert_eq!(absorbed.new_units, vec![5, 6]);
		assert_eq!(
			layout(&live),
			vec![
				("A".to_string(), vec![(1, "cmd1".into()), (2, "cmd2".into()), (5, "cmd3".into())]),
				("B".to_string(), vec![(3, "cmd1".into())]),
				("C".to_string(), vec![(6, "worker".into())]),
			]
		);
		assert_eq!(live.active_nodes(), ["base", "extra"]);
	}

	#[test]
	fn detach_keeps_shared_units() {
		let mut live = RunConfiguration::assemble(
			&[node("base", vec![("A", vec!["cmd1"])]), node("extra", vec![("A", vec!["cmd1", "cmd3"]), ("C", vec!["w"])])],
			&AssemblyOptions::default(),
		);
		assert_eq!(live.units_owned_by("extra"), vec![2, 3]);

		let removed = live.detach_node("extra");
		assert_eq!(removed.iter().map(|u| u.seq).collect::<Vec<_>>(), vec![2, 3]);
		assert_eq!(layout(&live), vec![("A".to_string(), vec![(1, "cmd1".into())])]);
		assert_eq!(live.groups[0].units[0].nodes, vec!["base"]);
		assert_eq!(live.active_nodes(), ["base"]);
	}

	#[test]
	fn unspawned_units_have_no_outputs() {
		let live = RunConfiguration::assemble(&[node("base", vec![("A", vec!["cmd1"])])], &AssemblyOptions::default());
		let snapshot = live.snapshot();
		assert_eq!(snapshot.groups.len(), 1);
		assert!(snapshot.groups[0].outputs.is_empty());
		assert!(live.alive_pids().is_empty());
	}
}
