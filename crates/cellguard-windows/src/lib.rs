//! Windows-specific process management and Job Object containment

#[cfg(windows)]
mod job_object;
#[cfg(windows)]
mod windows_process_manager;

#[cfg(windows)]
pub use job_object::JobObjectContainment;
#[cfg(windows)]
pub use windows_process_manager::{WindowsProcessHandle, WindowsProcessManager};

/// Windows-specific process manager factory
#[cfg(windows)]
pub struct WindowsProcessManagerFactory;

#[cfg(windows)]
impl WindowsProcessManagerFactory {
    pub fn create_process_manager() -> WindowsProcessManager {
        WindowsProcessManager::new()
    }

    pub fn platform_name() -> &'static str {
        "Windows"
    }
}
