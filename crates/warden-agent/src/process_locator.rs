use std::path::{Path, PathBuf};

/// A located server process. Carries just enough to drive the shutdown
/// escalation: the pid and the resolved executable path.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: i32,
    pub exe: PathBuf,
}

pub(crate) fn eq_path_ci(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

/// Finds the OS process whose main executable matches the expected install
/// path. Candidates are pre-filtered by base name (case-insensitive), then
/// disambiguated by full-path comparison so two installations of the same
/// game never match each other. Not-found is `Ok(None)`, never an error;
/// `Err` means the process table itself could not be read.
#[cfg(target_os = "linux")]
pub fn find(expected_exe: &Path) -> anyhow::Result<Option<ProcessHandle>> {
    use anyhow::Context;

    let expected_name = expected_exe
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if expected_name.is_empty() {
        return Ok(None);
    }

    let proc_dir = std::fs::read_dir("/proc").context("read /proc")?;
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };

        // Unreadable exe links (permissions, kernel threads, races with
        // exiting processes) are skipped, not fatal.
        let Ok(exe) = std::fs::read_link(entry.path().join("exe")) else {
            continue;
        };

        let base = exe
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if base != expected_name {
            continue;
        }
        if eq_path_ci(&exe, expected_exe) {
            return Ok(Some(ProcessHandle { pid, exe }));
        }
    }
    Ok(None)
}

#[cfg(not(target_os = "linux"))]
pub fn find(_expected_exe: &Path) -> anyhow::Result<Option<ProcessHandle>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_comparison_is_case_insensitive() {
        assert!(eq_path_ci(
            Path::new("/Srv/Game/ShooterGameServer"),
            Path::new("/srv/game/shootergameserver"),
        ));
        assert!(!eq_path_ci(
            Path::new("/srv/a/server"),
            Path::new("/srv/b/server"),
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_own_process_by_exe_path() {
        let me = std::env::current_exe().unwrap();
        let found = find(&me).unwrap().expect("should find the test binary");
        assert!(eq_path_ci(&found.exe, &me));
        assert!(found.pid > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn not_found_is_none_not_error() {
        let missing = Path::new("/definitely/not/a/real/server-binary");
        assert!(find(missing).unwrap().is_none());
    }
}
