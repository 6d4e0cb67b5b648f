/// Simple localization support for the feature CLI.
/// Locale can be selected via the `--locale` CLI flag (e.g. `--locale vi`).
use crate::delivery::model::DownloadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Vi,
}

impl Locale {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "vi" | "vi-vn" | "vi_vn" => Self::Vi,
            _ => Self::En,
        }
    }
}

pub struct Messages {
    pub idle: &'static str,
    pub pending: &'static str,
    pub downloading: &'static str,
    pub installing: &'static str,
    pub installed: &'static str,
    pub failed: &'static str,
    pub cancelled: &'static str,
    pub already_installed: &'static str,
    pub status_installed: &'static str,
    pub status_not_installed: &'static str,
    pub not_installed_hint: &'static str,
    pub uninstalled: &'static str,
    pub cancelling: &'static str,
}

pub static EN: Messages = Messages {
    idle: "Idle",
    pending: "Preparing download...",
    downloading: "Downloading",
    installing: "Installing...",
    installed: "Installed",
    failed: "Install failed, error code",
    cancelled: "Install cancelled",
    already_installed: "Module already installed",
    status_installed: "installed",
    status_not_installed: "not installed",
    not_installed_hint: "is not installed; run `install` first",
    uninstalled: "Module removed",
    cancelling: "Cancelling...",
};

pub static VI: Messages = Messages {
    idle: "Sẵn sàng",
    pending: "Đang chuẩn bị tải...",
    downloading: "Đang tải",
    installing: "Đang cài đặt...",
    installed: "Đã cài đặt",
    failed: "Cài đặt thất bại, mã lỗi",
    cancelled: "Đã hủy cài đặt",
    already_installed: "Module đã được cài đặt",
    status_installed: "đã cài",
    status_not_installed: "chưa cài",
    not_installed_hint: "chưa được cài đặt; hãy chạy `install` trước",
    uninstalled: "Đã gỡ module",
    cancelling: "Đang hủy...",
};

pub fn get_messages(locale: Locale) -> &'static Messages {
    match locale {
        Locale::En => &EN,
        Locale::Vi => &VI,
    }
}

pub fn render_state(state: &DownloadState, msgs: &Messages) -> String {
    match state {
        DownloadState::Idle => msgs.idle.to_string(),
        DownloadState::Pending => msgs.pending.to_string(),
        DownloadState::Downloading(pct) => format!("{} {}%", msgs.downloading, pct),
        DownloadState::Installing => msgs.installing.to_string(),
        DownloadState::Installed(modules) => {
            let names: Vec<&str> = modules.iter().map(String::as_str).collect();
            format!("{}: {}", msgs.installed, names.join(", "))
        }
        DownloadState::Failed(code) => format!("{} {}", msgs.failed, code),
        DownloadState::Cancelled => msgs.cancelled.to_string(),
        DownloadState::AlreadyInstalled => msgs.already_installed.to_string(),
    }
}
