use crate::process::ProcessId;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Caller-chosen key identifying one managed process across the channel
pub type CorrelationKey = Uuid;

/// A named remote method with typed params and result.
///
/// Each method is a zero-sized marker type so the dispatcher and the client agree on
/// the name and on both payload shapes at compile time.
pub trait RpcMethod: Send + Sync + 'static {
    const NAME: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Params of a method that takes none; whatever the peer sends is ignored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoParams;

impl Serialize for NoParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for NoParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(NoParams)
    }
}

/// Liveness probe, answered with `true`
pub struct Ping;

impl RpcMethod for Ping {
    const NAME: &'static str = "Container.Ping";
    type Params = NoParams;
    type Output = bool;
}

pub struct CreateProcess;

impl RpcMethod for CreateProcess {
    const NAME: &'static str = "Container.CreateProcess";
    type Params = CreateProcessParams;
    type Output = CreateProcessResult;
}

pub struct StopProcess;

impl RpcMethod for StopProcess {
    const NAME: &'static str = "Container.StopProcess";
    type Params = StopProcessParams;
    type Output = ();
}

pub struct StopAllProcesses;

impl RpcMethod for StopAllProcesses {
    const NAME: &'static str = "Container.StopAllProcesses";
    type Params = StopAllProcessesParams;
    type Output = ();
}

pub struct WaitForProcessExit;

impl RpcMethod for WaitForProcessExit {
    const NAME: &'static str = "Container.WaitForProcessExit";
    type Params = WaitForProcessExitParams;
    type Output = WaitForProcessExitResult;
}

pub struct FindProcessById;

impl RpcMethod for FindProcessById {
    const NAME: &'static str = "Container.FindProcessById";
    type Params = FindProcessByIdParams;
    type Output = Option<FindProcessByIdResult>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessParams {
    pub key: CorrelationKey,
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Complete environment of the child; when empty the worker's own is used
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl CreateProcessParams {
    pub fn new(key: CorrelationKey, executable_path: impl Into<String>) -> Self {
        Self {
            key,
            executable_path: executable_path.into(),
            arguments: Vec::new(),
            environment: HashMap::new(),
            working_directory: None,
        }
    }

    pub fn with_arguments<S: ToString, I: IntoIterator<Item = S>>(mut self, arguments: I) -> Self {
        self.arguments = arguments.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_env<T: ToString>(mut self, key: T, value: T) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProcessResult {
    pub id: ProcessId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopProcessParams {
    pub key: CorrelationKey,
    /// Grace period in milliseconds before the process is killed
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAllProcessesParams {
    /// Grace period in milliseconds before each process is killed
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForProcessExitParams {
    pub key: CorrelationKey,
    /// How long to wait, in milliseconds
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForProcessExitResult {
    pub exited: bool,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindProcessByIdParams {
    pub id: ProcessId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindProcessByIdResult {
    pub process_key: CorrelationKey,
    pub id: ProcessId,
    pub environment: HashMap<String, String>,
}

/// Millisecond timeouts carried by the stop and wait params
pub trait TimeoutParam {
    fn timeout_ms(&self) -> u64;

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms())
    }
}

impl TimeoutParam for StopProcessParams {
    fn timeout_ms(&self) -> u64 {
        self.timeout
    }
}

impl TimeoutParam for StopAllProcessesParams {
    fn timeout_ms(&self) -> u64 {
        self.timeout
    }
}

impl TimeoutParam for WaitForProcessExitParams {
    fn timeout_ms(&self) -> u64 {
        self.timeout
    }
}

/// Saturating conversion used when building params from a [`Duration`]
pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessDataType {
    #[serde(rename = "STDOUT")]
    Stdout,
    #[serde(rename = "STDERR")]
    Stderr,
}

/// One line of output from a managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDataEvent {
    pub key: CorrelationKey,
    pub data_type: ProcessDataType,
    pub data: String,
}

impl ProcessDataEvent {
    pub const TOPIC: &'static str = "processData";
}
