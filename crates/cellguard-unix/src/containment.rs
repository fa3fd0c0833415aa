use crate::unix_process_manager::{find_children_recursive, kill_pid, process_alive};
use async_trait::async_trait;
use cellguard_core::{ContainmentGroup, ProcessError, ProcessId, TerminationResult};
use parking_lot::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long `terminate_all` waits for the group to drain
const TERMINATE_DEADLINE: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn validate_group_name(name: &str) -> Result<(), ProcessError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ProcessError::Containment(format!(
            "invalid containment group name '{name}'"
        )));
    }
    Ok(())
}

/// Containment by process ancestry.
///
/// Members are the registered roots plus every live descendant found by walking the
/// process table. Descendants that re-parent away from a root (double fork) escape it,
/// which is why cgroups are preferred where available.
pub struct ProcessTreeContainment {
    name: String,
    roots: Mutex<Vec<ProcessId>>,
    system: Mutex<System>,
}

impl ProcessTreeContainment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roots: Mutex::new(Vec::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// A group that already contains `pid`, used by a worker to see its own tree
    pub fn rooted_at(name: impl Into<String>, pid: ProcessId) -> Self {
        let group = Self::new(name);
        group.roots.lock().push(pid);
        group
    }

    fn members(&self) -> Vec<ProcessId> {
        let roots = self.roots.lock().clone();
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::default(),
        );

        let mut members = Vec::new();
        for root in roots {
            let alive = system
                .process(Pid::from_u32(root))
                .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie);
            if !alive {
                continue;
            }
            find_children_recursive(&system, root, &mut members);
            if !members.contains(&root) {
                members.push(root);
            }
        }
        members
    }
}

#[async_trait]
impl ContainmentGroup for ProcessTreeContainment {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_process(&self, pid: ProcessId) -> Result<(), ProcessError> {
        if !process_alive(pid) {
            return Err(ProcessError::ProcessNotFound(pid));
        }
        let mut roots = self.roots.lock();
        if !roots.contains(&pid) {
            roots.push(pid);
        }
        debug!(pid, group = %self.name, "Assigned process to tree containment");
        Ok(())
    }

    fn process_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
        Ok(self.members())
    }

    async fn terminate_all(&self) -> Result<(), ProcessError> {
        let deadline = Instant::now() + TERMINATE_DEADLINE;
        loop {
            let members = self.members();
            if members.is_empty() {
                info!(group = %self.name, "Containment group is empty");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::Containment(format!(
                    "{} processes survived termination of group '{}'",
                    members.len(),
                    self.name
                )));
            }
            // deepest first, so parents cannot respawn children that were already killed
            for pid in &members {
                if let TerminationResult::AccessDenied = kill_pid(*pid) {
                    return Err(ProcessError::PermissionDenied(format!(
                        "cannot kill process {pid} in group '{}'",
                        self.name
                    )));
                }
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(target_os = "linux")]
mod cgroup {
    use super::*;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    /// Default parent directory for per-sandbox cgroups
    pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/cellguard";

    /// Containment backed by a cgroup v2 directory.
    ///
    /// Children forked by a member land in the same cgroup automatically, so membership
    /// is transitive without any bookkeeping here.
    pub struct CgroupContainment {
        name: String,
        path: PathBuf,
    }

    impl CgroupContainment {
        /// Create (or reuse) `<root>/<name>`
        pub fn create(root: &Path, name: &str) -> Result<Self, ProcessError> {
            validate_group_name(name)?;
            let path = root.join(name);
            fs::create_dir_all(&path).map_err(|e| {
                ProcessError::Containment(format!("cannot create cgroup {}: {e}", path.display()))
            })?;
            Self::open_path(name, path)
        }

        /// Open an existing `<root>/<name>`
        pub fn open(root: &Path, name: &str) -> Result<Self, ProcessError> {
            validate_group_name(name)?;
            Self::open_path(name, root.join(name))
        }

        fn open_path(name: &str, path: PathBuf) -> Result<Self, ProcessError> {
            if !path.join("cgroup.procs").is_file() {
                return Err(ProcessError::Containment(format!(
                    "{} is not a cgroup v2 directory",
                    path.display()
                )));
            }
            Ok(Self {
                name: name.to_string(),
                path,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn collect_procs(dir: &Path, members: &mut Vec<ProcessId>) -> io::Result<()> {
            let procs = fs::read_to_string(dir.join("cgroup.procs"))?;
            members.extend(procs.lines().filter_map(|line| line.trim().parse::<ProcessId>().ok()));
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    Self::collect_procs(&entry.path(), members)?;
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContainmentGroup for CgroupContainment {
        fn name(&self) -> &str {
            &self.name
        }

        fn assign_process(&self, pid: ProcessId) -> Result<(), ProcessError> {
            fs::write(self.path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
                ProcessError::Containment(format!(
                    "cannot move process {pid} into {}: {e}",
                    self.path.display()
                ))
            })?;
            debug!(pid, cgroup = %self.path.display(), "Assigned process to cgroup");
            Ok(())
        }

        fn process_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
            let mut members = Vec::new();
            Self::collect_procs(&self.path, &mut members)?;
            Ok(members)
        }

        async fn terminate_all(&self) -> Result<(), ProcessError> {
            match fs::write(self.path.join("cgroup.kill"), "1") {
                Ok(()) => debug!(cgroup = %self.path.display(), "Wrote cgroup.kill"),
                Err(e) => {
                    debug!("cgroup.kill unavailable ({e}), signalling members");
                    for pid in self.process_ids()? {
                        kill_pid(pid);
                    }
                }
            }

            let deadline = Instant::now() + TERMINATE_DEADLINE;
            loop {
                let remaining = self.process_ids()?;
                if remaining.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ProcessError::Containment(format!(
                        "{} processes survived termination of {}",
                        remaining.len(),
                        self.path.display()
                    )));
                }
                for pid in remaining {
                    kill_pid(pid);
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }

            if let Err(e) = fs::remove_dir(&self.path) {
                warn!(cgroup = %self.path.display(), "Could not remove cgroup: {e}");
            }
            info!(group = %self.name, "Cgroup is empty");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_open_requires_cgroup_directory() {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir(root.path().join("plain")).unwrap();

            assert!(matches!(
                CgroupContainment::open(root.path(), "plain"),
                Err(ProcessError::Containment(_))
            ));
            assert!(CgroupContainment::open(root.path(), "missing").is_err());
            assert!(CgroupContainment::open(root.path(), "../escape").is_err());
        }

        #[test]
        fn test_members_are_read_transitively() {
            let root = tempfile::tempdir().unwrap();
            let group = root.path().join("sandbox");
            fs::create_dir_all(group.join("nested")).unwrap();
            fs::write(group.join("cgroup.procs"), "10\n11\n").unwrap();
            fs::write(group.join("nested").join("cgroup.procs"), "12\n").unwrap();

            let containment = CgroupContainment::open(root.path(), "sandbox").unwrap();
            assert_eq!(containment.name(), "sandbox");
            let mut members = containment.process_ids().unwrap();
            members.sort_unstable();
            assert_eq!(members, vec![10, 11, 12]);
        }
    }
}

#[cfg(target_os = "linux")]
pub use cgroup::{CgroupContainment, DEFAULT_CGROUP_ROOT};
