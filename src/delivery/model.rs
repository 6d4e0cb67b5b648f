use std::collections::BTreeSet;
use uuid::Uuid;

pub type ModuleId = String;
pub type SessionId = Uuid;

/// Error code published when the backend rejects a request before any session exists.
/// Never produced by a backend itself.
pub const SUBMISSION_FAILED: i32 = -1;

pub mod error_code {
    pub const MODULE_UNAVAILABLE: i32 = -2;
    pub const INVALID_REQUEST: i32 = -3;
    pub const NETWORK_ERROR: i32 = -6;
    pub const INTERNAL_ERROR: i32 = -100;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Pending,
    Downloading(u8),
    Installing,
    Installed(BTreeSet<ModuleId>),
    Failed(i32),
    Cancelled,
    AlreadyInstalled,
}

impl DownloadState {
    /// A session is in flight and further backend updates are expected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloading(_) | Self::Installing)
    }

    /// Shown for a moment, then reverted to `Idle` by the engine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed(_) | Self::Failed(_) | Self::Cancelled)
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub display_name: String,
    pub description: String,
    pub size_label: String,
    pub installed: bool,
}

/// Session status codes reported by a split-install backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unknown,
    Pending,
    RequiresUserConfirmation,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Failed,
    Canceling,
    Canceled,
}

impl SessionStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::Downloading => 2,
            Self::Downloaded => 3,
            Self::Installing => 4,
            Self::Installed => 5,
            Self::Failed => 6,
            Self::Canceled => 7,
            Self::RequiresUserConfirmation => 8,
            Self::Canceling => 9,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Downloading,
            3 => Self::Downloaded,
            4 => Self::Installing,
            5 => Self::Installed,
            6 => Self::Failed,
            7 => Self::Canceled,
            8 => Self::RequiresUserConfirmation,
            9 => Self::Canceling,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub module_names: Vec<ModuleId>,
    pub bytes_downloaded: u64,
    pub total_bytes_to_download: u64,
    pub error_code: i32,
}

impl SessionUpdate {
    pub fn new(session_id: SessionId, status: SessionStatus, module: &str) -> Self {
        Self {
            session_id,
            status,
            module_names: vec![module.to_string()],
            bytes_downloaded: 0,
            total_bytes_to_download: 0,
            error_code: 0,
        }
    }

    pub fn downloading(session_id: SessionId, module: &str, downloaded: u64, total: u64) -> Self {
        Self {
            bytes_downloaded: downloaded,
            total_bytes_to_download: total,
            ..Self::new(session_id, SessionStatus::Downloading, module)
        }
    }

    pub fn failed(session_id: SessionId, module: &str, error_code: i32) -> Self {
        Self {
            error_code,
            ..Self::new(session_id, SessionStatus::Failed, module)
        }
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.bytes_downloaded, self.total_bytes_to_download)
    }
}

/// `floor(downloaded * 100 / total)`, 0 for an unknown total, never above 100.
pub fn progress_percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (downloaded as u128 * 100) / total as u128;
    pct.min(100) as u8
}
