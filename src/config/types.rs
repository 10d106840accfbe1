/// Core types and configuration structures for labbox
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How run-commands and template files share parameter draws within one lab start
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterMode {
    /// Every parameter is drawn once per lab start and reused for files and commands
    Pinned,
    /// File substitution and each run-command draw their own values
    Independent,
}

/// Which terminal backend a connection gets
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalMode {
    /// Interactive shell behind a pseudo-terminal
    Pty,
    /// Line-buffered console with command admission
    Fallback,
}

/// Isolation strategy used to materialize principals
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// One dedicated OS account per student (useradd/userdel)
    OsUser,
    /// Per-student home directories under the service account (development only)
    SharedAccount,
}

/// One configured network lease
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LeaseSpec {
    pub subnet: String,
    pub mask: String,
    pub gateway: String,
}

/// Command admission settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Leading tokens accepted by the console
    pub allowed_commands: Vec<String>,
    /// Deployment toggle for the allow-list check
    pub enforce_allow_list: bool,
    /// Commands whose arguments are checked against accessible resources
    pub path_commands: Vec<String>,
    /// Wall clock limit for one console command
    pub command_timeout_secs: u64,
    /// Per-stream output cap in bytes
    pub output_limit_bytes: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "ls", "dir", "cd", "cat", "type", "grep", "find", "findstr", "pwd", "echo",
                "whoami", "python", "python3", "gcc", "make", "javac", "java", "node", "npm",
                "git",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            enforce_allow_list: true,
            path_commands: ["cd", "cat", "grep", "find", "type"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            command_timeout_secs: 30,
            output_limit_bytes: 1024 * 1024,
        }
    }
}

impl AdmissionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Terminal session settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub mode: TerminalMode,
    /// Interactive shell executed inside the pty
    pub shell: PathBuf,
    pub shell_args: Vec<String>,
    pub term: String,
    /// PATH handed to every student process
    pub secure_path: String,
    /// Poll interval of the per-session reader
    pub poll_interval_ms: u64,
    /// Bytes read from the master per iteration
    pub read_chunk_bytes: usize,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Grace period between SIGHUP and SIGKILL on teardown
    pub kill_grace_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            mode: TerminalMode::Pty,
            shell: PathBuf::from("/bin/bash"),
            shell_args: vec!["-i".to_string()],
            term: "xterm-256color".to_string(),
            secure_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            poll_interval_ms: 100,
            read_chunk_bytes: 1024,
            default_rows: 24,
            default_cols: 80,
            kill_grace_ms: 200,
        }
    }
}

impl TerminalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Principal materialization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PrincipalConfig {
    pub isolation: IsolationKind,
    /// Parent directory of student homes
    pub home_root: PathBuf,
    /// Login shell recorded for new accounts
    pub login_shell: PathBuf,
    /// Refuse uid/gid 0 and system uids for student principals
    pub strict_mode: bool,
    /// Lowest uid an isolated student account may have
    pub min_uid: u32,
    /// Timeout for account management commands
    pub command_timeout_secs: u64,
}

impl Default for PrincipalConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationKind::OsUser,
            home_root: PathBuf::from("/home"),
            login_shell: PathBuf::from("/bin/bash"),
            strict_mode: true,
            min_uid: 1000,
            command_timeout_secs: 30,
        }
    }
}

/// Lab provisioning settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub templates_root: PathBuf,
    pub student_labs_root: PathBuf,
    pub parameter_mode: ParameterMode,
    /// Upper bound for each run-command during lab start
    pub run_command_timeout_secs: u64,
    /// Upper bound for the lab's build step
    pub build_timeout_secs: u64,
    /// Working directory of the external orchestration tooling
    pub orchestrator_dir: PathBuf,
    /// Lab lifecycle tool (`<tool> start|stop|status|exec <folder>`)
    pub orchestrator_program: String,
    /// Image rebuild tool (`<tool> <folder>`)
    pub rebuild_program: String,
    pub leases: Vec<LeaseSpec>,
    /// Mark leases used on checkout instead of sharing them
    pub exclusive_leases: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            templates_root: PathBuf::from("./lab-templates"),
            student_labs_root: PathBuf::from("./student-labs"),
            parameter_mode: ParameterMode::Pinned,
            run_command_timeout_secs: 300,
            build_timeout_secs: 300,
            orchestrator_dir: PathBuf::from("."),
            orchestrator_program: "labtainer".to_string(),
            rebuild_program: "rebuild".to_string(),
            leases: Vec::new(),
            exclusive_leases: false,
        }
    }
}

impl ProvisioningConfig {
    pub fn run_command_timeout(&self) -> Duration {
        Duration::from_secs(self.run_command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// Full labbox configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabboxConfig {
    pub admission: AdmissionConfig,
    pub terminal: TerminalConfig,
    pub principal: PrincipalConfig,
    pub provisioning: ProvisioningConfig,
    /// Audit trail location; a temp-dir default is used when absent
    pub audit_log: Option<PathBuf>,
}

/// Custom error types for labbox
#[derive(Error, Debug)]
pub enum LabError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command blocked: {0}")]
    AdmissionDenied(String),

    #[error("Command timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Provisioning failure: {0}")]
    ProvisioningFailure(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Principal error: {0}")]
    Principal(String),

    #[error("Privilege error: {0}")]
    Privilege(String),
}

impl LabError {
    /// Process exit code used by the CLI for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            LabError::AdmissionDenied(_) => 2,
            LabError::ExecutionTimeout(_) => 124,
            LabError::ResourceExhausted(_) => 75,
            LabError::ProvisioningFailure(_) => 73,
            LabError::Decode(_) | LabError::InvalidSubmission(_) => 65,
            LabError::SessionExpired(_) => 3,
            LabError::Config(_) => 78,
            LabError::Privilege(_) | LabError::Principal(_) => 77,
            LabError::Io(_) => 74,
            LabError::Process(_) => 1,
        }
    }
}

impl From<nix::Error> for LabError {
    fn from(err: nix::Error) -> Self {
        LabError::Io(std::io::Error::from(err))
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::Config(err.to_string())
    }
}

/// Result type alias for labbox operations
pub type Result<T> = std::result::Result<T, LabError>;
