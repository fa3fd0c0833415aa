use async_trait::async_trait;
use cellguard_core::{ContainmentGroup, ProcessError, ProcessId};
use std::ffi::c_void;
use std::mem::size_of;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_ALL_ACCESS,
    JOBOBJECT_BASIC_PROCESS_ID_LIST, JobObjectBasicProcessIdList, OpenJobObjectW,
    QueryInformationJobObject, TerminateJobObject,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};
use windows::core::HSTRING;

const TERMINATE_DEADLINE: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on members listed in one query
const MAX_LISTED_PROCESSES: usize = 4096;

/// Owned kernel handle, closed on drop
struct OwnedHandle(HANDLE);

// Kernel handles are process-wide and may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            warn!("Failed to close handle: {e}");
        }
    }
}

fn windows_error(context: &str, error: windows::core::Error) -> ProcessError {
    ProcessError::Containment(format!("{context}: {error}"))
}

/// Containment backed by a named Job Object.
///
/// Processes created by a member join the job automatically.
pub struct JobObjectContainment {
    name: String,
    job: OwnedHandle,
}

impl JobObjectContainment {
    /// Create (or open, if it already exists) the job object `name`
    pub fn create(name: &str) -> Result<Self, ProcessError> {
        let job = unsafe { CreateJobObjectW(None, &HSTRING::from(name)) }
            .map_err(|e| windows_error("CreateJobObjectW", e))?;
        info!(job = name, "Created job object");
        Ok(Self {
            name: name.to_string(),
            job: OwnedHandle(job),
        })
    }

    /// Open an existing job object by name
    pub fn open(name: &str) -> Result<Self, ProcessError> {
        let job = unsafe { OpenJobObjectW(JOB_OBJECT_ALL_ACCESS.0, false, &HSTRING::from(name)) }
            .map_err(|e| windows_error("OpenJobObjectW", e))?;
        Ok(Self {
            name: name.to_string(),
            job: OwnedHandle(job),
        })
    }
}

#[async_trait]
impl ContainmentGroup for JobObjectContainment {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_process(&self, pid: ProcessId) -> Result<(), ProcessError> {
        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid) }
            .map(OwnedHandle)
            .map_err(|e| windows_error("OpenProcess", e))?;
        unsafe { AssignProcessToJobObject(self.job.0, process.0) }
            .map_err(|e| windows_error("AssignProcessToJobObject", e))?;
        debug!(pid, job = %self.name, "Assigned process to job object");
        Ok(())
    }

    fn process_ids(&self) -> Result<Vec<ProcessId>, ProcessError> {
        // header (two u32 counters) followed by the id list, laid out as usize slots
        let header_slots = size_of::<JOBOBJECT_BASIC_PROCESS_ID_LIST>() / size_of::<usize>();
        let mut buffer = vec![0usize; header_slots + MAX_LISTED_PROCESSES];
        let byte_len = u32::try_from(buffer.len() * size_of::<usize>())
            .map_err(|_| ProcessError::Other("job query buffer too large".into()))?;

        unsafe {
            QueryInformationJobObject(
                Some(self.job.0),
                JobObjectBasicProcessIdList,
                buffer.as_mut_ptr() as *mut c_void,
                byte_len,
                None,
            )
        }
        .map_err(|e| windows_error("QueryInformationJobObject", e))?;

        let list = buffer.as_ptr() as *const JOBOBJECT_BASIC_PROCESS_ID_LIST;
        let (count, ids) = unsafe {
            (
                (*list).NumberOfProcessIdsInList as usize,
                (*list).ProcessIdList.as_ptr(),
            )
        };
        let ids = unsafe { std::slice::from_raw_parts(ids, count.min(MAX_LISTED_PROCESSES)) };
        Ok(ids
            .iter()
            .filter_map(|id| ProcessId::try_from(*id).ok())
            .collect())
    }

    async fn terminate_all(&self) -> Result<(), ProcessError> {
        unsafe { TerminateJobObject(self.job.0, 1) }
            .map_err(|e| windows_error("TerminateJobObject", e))?;

        let deadline = Instant::now() + TERMINATE_DEADLINE;
        loop {
            let remaining = self.process_ids()?;
            if remaining.is_empty() {
                info!(job = %self.name, "Job object is empty");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::Containment(format!(
                    "{} processes survived termination of job '{}'",
                    remaining.len(),
                    self.name
                )));
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
