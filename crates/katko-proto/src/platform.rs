use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

/// IPC endpoint for the mpv instance playing track `index`.  The process id
/// keeps two daemons on the same host from fighting over sockets.
#[cfg(unix)]
pub fn mpv_socket_name(index: usize) -> String {
    format!(
        "{}/katko-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        index
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(index: usize) -> String {
    format!("katko-mpv-{}-{}", std::process::id(), index)
}

#[cfg(unix)]
pub fn mpv_socket_arg(index: usize) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(index))
}

#[cfg(windows)]
pub fn mpv_socket_arg(index: usize) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(index))
}

pub fn data_dir() -> PathBuf {
    // XDG layout on every unix, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("katko")
    }
    #[cfg(windows)]
    {
        if let Some(dir) = portable_dir("data") {
            return dir;
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("katko")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("katko")
    }

    #[cfg(windows)]
    {
        if let Some(exe_dir) = exe_dir() {
            if exe_dir.join("config.toml").exists() {
                return exe_dir;
            }
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("katko")
    }
}

#[cfg(windows)]
fn exe_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(|p| p.to_path_buf())
}

#[cfg(windows)]
fn portable_dir(name: &str) -> Option<PathBuf> {
    let dir = exe_dir()?.join(name);
    dir.exists().then_some(dir)
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Find the mpv binary: beside the current executable first, then PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}
