use cellguard_core::{ContainmentGroup, ProcessError, ProcessId, ProcessManager};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
#[cfg(target_os = "linux")]
use tracing::warn;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformFactory;

impl PlatformFactory {
    pub fn process_manager() -> Arc<dyn ProcessManager> {
        #[cfg(unix)]
        return Arc::new(cellguard_unix::UnixProcessManagerFactory::create_process_manager());

        #[cfg(windows)]
        return Arc::new(cellguard_windows::WindowsProcessManagerFactory::create_process_manager());
    }

    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return cellguard_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return cellguard_windows::WindowsProcessManagerFactory::platform_name();
    }

    /// Containment group for a new sandbox, created by the orchestrator.
    ///
    /// Linux prefers a cgroup under `cgroup_root` and falls back to process-tree
    /// tracking when cgroups cannot be created; Windows uses a named Job Object.
    pub fn create_containment(
        name: &str,
        cgroup_root: Option<&Path>,
    ) -> Result<Arc<dyn ContainmentGroup>, ProcessError> {
        #[cfg(target_os = "linux")]
        {
            let root = cgroup_root.unwrap_or(Path::new(cellguard_unix::DEFAULT_CGROUP_ROOT));
            match cellguard_unix::CgroupContainment::create(root, name) {
                Ok(group) => {
                    info!(group = name, path = %group.path().display(), "Using cgroup containment");
                    return Ok(Arc::new(group));
                }
                Err(e) => warn!(group = name, "Cgroup containment unavailable, tracking the process tree instead: {e}"),
            }
        }

        #[cfg(unix)]
        {
            let _ = cgroup_root;
            info!(group = name, "Using process tree containment");
            return Ok(Arc::new(cellguard_unix::ProcessTreeContainment::new(name)));
        }

        #[cfg(windows)]
        {
            let _ = cgroup_root;
            info!(group = name, "Using job object containment");
            return Ok(Arc::new(cellguard_windows::JobObjectContainment::create(name)?));
        }
    }

    /// The same containment group as seen from inside the worker `own_pid`
    pub fn open_containment(
        name: &str,
        cgroup_root: Option<&Path>,
        own_pid: ProcessId,
    ) -> Result<Arc<dyn ContainmentGroup>, ProcessError> {
        #[cfg(target_os = "linux")]
        {
            let root = cgroup_root.unwrap_or(Path::new(cellguard_unix::DEFAULT_CGROUP_ROOT));
            if let Ok(group) = cellguard_unix::CgroupContainment::open(root, name) {
                return Ok(Arc::new(group));
            }
        }

        #[cfg(unix)]
        {
            let _ = cgroup_root;
            return Ok(Arc::new(cellguard_unix::ProcessTreeContainment::rooted_at(
                name, own_pid,
            )));
        }

        #[cfg(windows)]
        {
            let _ = (cgroup_root, own_pid);
            return Ok(Arc::new(cellguard_windows::JobObjectContainment::open(name)?));
        }
    }
}
