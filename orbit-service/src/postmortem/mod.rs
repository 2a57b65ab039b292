//! Target process state after a capture.
//!
//! ```text
//! before capture:  snapshot *.N.core.dmp in core_dir
//! after capture:   /proc/<pid> exists?      ── yes ─▶ Running
//!                        │ no
//!                  new <pid> minidump?      ── no ──▶ Ended
//!                        │ yes
//!                  extract signal           ─────────▶ Crashed(signal)
//! ```

mod minidump;

pub use minidump::{extract_signal_from_minidump, extract_signal_from_minidump_bytes};

use crate::domain::{ErrorMessage, Pid};
use crate::procfs::{self, DEFAULT_PROC_ROOT};
use log::error;
use orbit_protos::{ProcessState, TerminationSignal};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory where the platform's crash handler writes minidumps
pub const DEFAULT_CORE_DIR: &str = "/usr/local/cloudcast/core";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMortemConfig {
    pub core_dir: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for PostMortemConfig {
    fn default() -> Self {
        Self { core_dir: PathBuf::from(DEFAULT_CORE_DIR), proc_root: PathBuf::from(DEFAULT_PROC_ROOT) }
    }
}

/// State and termination signal reported in `CaptureFinished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProcessStateAfterCapture {
    pub process_state: ProcessState,
    pub termination_signal: TerminationSignal,
}

impl TargetProcessStateAfterCapture {
    const INTERNAL_ERROR: Self = Self {
        process_state: ProcessState::InternalError,
        termination_signal: TerminationSignal::InternalError,
    };
}

/// Minidumps present before the capture started.
///
/// A pid may be reused, so only files created during the capture count as
/// crashes of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreFileSnapshot {
    paths: HashSet<PathBuf>,
}

impl CoreFileSnapshot {
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, ErrorMessage> {
    let entries = fs::read_dir(dir)
        .map_err(|e| ErrorMessage::new(format!("Unable to list \"{}\": {e}", dir.display())))?;
    Ok(entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect())
}

fn is_match(regex: &Regex, path: &Path) -> bool {
    regex.is_match(&path.to_string_lossy())
}

pub struct PostMortem {
    config: PostMortemConfig,
    any_minidump: Regex,
}

impl PostMortem {
    /// # Errors
    /// Returns an [`ErrorMessage`] if the minidump file pattern fails to compile.
    pub fn new(config: PostMortemConfig) -> Result<Self, ErrorMessage> {
        let any_minidump = Regex::new(r"^.*\.[0-9]+\.core\.dmp$")
            .map_err(|e| ErrorMessage::new(e.to_string()))?;
        Ok(Self { config, any_minidump })
    }

    #[must_use]
    pub fn config(&self) -> &PostMortemConfig {
        &self.config
    }

    /// Minidumps currently in the core directory. Empty if it cannot be listed.
    #[must_use]
    pub fn snapshot_core_files(&self) -> CoreFileSnapshot {
        let paths = list_dir(&self.config.core_dir)
            .map(|paths| {
                paths.into_iter().filter(|p| is_match(&self.any_minidump, p)).collect()
            })
            .unwrap_or_default();
        CoreFileSnapshot { paths }
    }

    /// Classify `pid` after a capture, ignoring the minidumps in `old_core_files`.
    #[must_use]
    pub fn target_process_state(
        &self,
        pid: Pid,
        old_core_files: &CoreFileSnapshot,
    ) -> TargetProcessStateAfterCapture {
        match procfs::process_exists(&self.config.proc_root, pid) {
            Err(e) => {
                error!("{e}");
                return TargetProcessStateAfterCapture::INTERNAL_ERROR;
            }
            Ok(true) => {
                return TargetProcessStateAfterCapture {
                    process_state: ProcessState::Running,
                    termination_signal: TerminationSignal::Unspecified,
                };
            }
            Ok(false) => {}
        }

        let core_files = match list_dir(&self.config.core_dir) {
            Ok(files) => files,
            Err(e) => {
                error!("{e}");
                return TargetProcessStateAfterCapture::INTERNAL_ERROR;
            }
        };

        let Ok(pid_minidump) = Regex::new(&format!(r"^.*\.{}\.[0-9]+\.core\.dmp$", pid.0)) else {
            return TargetProcessStateAfterCapture::INTERNAL_ERROR;
        };
        let new_minidump = core_files
            .iter()
            .filter(|path| !old_core_files.contains(path))
            .find(|path| is_match(&pid_minidump, path));

        let Some(path) = new_minidump else {
            return TargetProcessStateAfterCapture {
                process_state: ProcessState::Ended,
                termination_signal: TerminationSignal::Unspecified,
            };
        };

        let termination_signal = match extract_signal_from_minidump(path) {
            Ok(signal) => TerminationSignal::Signal(signal),
            Err(e) => {
                error!("Error extracting termination signal from minidump: {e}");
                TerminationSignal::InternalError
            }
        };
        TargetProcessStateAfterCapture { process_state: ProcessState::Crashed, termination_signal }
    }
}

#[cfg(test)]
mod tests {
    use super::minidump::tests::build_minidump;
    use super::*;

    struct Dirs {
        _root: tempfile::TempDir,
        post_mortem: PostMortem,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let core_dir = root.path().join("core");
        let proc_root = root.path().join("proc");
        fs::create_dir(&core_dir).unwrap();
        fs::create_dir(&proc_root).unwrap();
        let post_mortem = PostMortem::new(PostMortemConfig { core_dir, proc_root }).unwrap();
        Dirs { _root: root, post_mortem }
    }

    fn write_core(dirs: &Dirs, name: &str, signal: u32) {
        fs::write(dirs.post_mortem.config().core_dir.join(name), build_minidump(&[(6, signal)]))
            .unwrap();
    }

    #[test]
    fn test_running_process() {
        let dirs = dirs();
        fs::create_dir(dirs.post_mortem.config().proc_root.join("42")).unwrap();
        let state = dirs.post_mortem.target_process_state(Pid(42), &CoreFileSnapshot::default());
        assert_eq!(state.process_state, ProcessState::Running);
        assert_eq!(state.termination_signal, TerminationSignal::Unspecified);
    }

    #[test]
    fn test_clean_exit() {
        let dirs = dirs();
        write_core(&dirs, "other.43.1657182631.core.dmp", 11);
        let state = dirs.post_mortem.target_process_state(Pid(42), &CoreFileSnapshot::default());
        assert_eq!(state.process_state, ProcessState::Ended);
        assert_eq!(state.termination_signal, TerminationSignal::Unspecified);
    }

    #[test]
    fn test_crash_with_new_minidump() {
        let dirs = dirs();
        write_core(&dirs, "hello.42.1657182000.core.dmp", 11);
        let snapshot = dirs.post_mortem.snapshot_core_files();
        assert_eq!(snapshot.len(), 1);

        write_core(&dirs, "hello.42.1657182631.core.dmp", 4);
        write_core(&dirs, "notes.txt", 9);
        let state = dirs.post_mortem.target_process_state(Pid(42), &snapshot);
        assert_eq!(state.process_state, ProcessState::Crashed);
        assert_eq!(state.termination_signal, TerminationSignal::Signal(4));
    }

    #[test]
    fn test_old_minidump_is_ignored() {
        let dirs = dirs();
        write_core(&dirs, "hello.42.1657182000.core.dmp", 11);
        let snapshot = dirs.post_mortem.snapshot_core_files();
        let state = dirs.post_mortem.target_process_state(Pid(42), &snapshot);
        assert_eq!(state.process_state, ProcessState::Ended);
    }

    #[test]
    fn test_pid_must_match_exactly() {
        let dirs = dirs();
        write_core(&dirs, "hello.142.1657182631.core.dmp", 11);
        let state = dirs.post_mortem.target_process_state(Pid(42), &CoreFileSnapshot::default());
        assert_eq!(state.process_state, ProcessState::Ended);
    }

    #[test]
    fn test_unparseable_minidump() {
        let dirs = dirs();
        fs::write(dirs.post_mortem.config().core_dir.join("a.42.1.core.dmp"), b"MDMP").unwrap();
        let state = dirs.post_mortem.target_process_state(Pid(42), &CoreFileSnapshot::default());
        assert_eq!(state.process_state, ProcessState::Crashed);
        assert_eq!(state.termination_signal, TerminationSignal::InternalError);
    }

    #[test]
    fn test_missing_core_dir() {
        let root = tempfile::tempdir().unwrap();
        let post_mortem = PostMortem::new(PostMortemConfig {
            core_dir: root.path().join("missing"),
            proc_root: root.path().to_path_buf(),
        })
        .unwrap();
        assert!(post_mortem.snapshot_core_files().is_empty());
        let state = post_mortem.target_process_state(Pid(42), &CoreFileSnapshot::default());
        assert_eq!(state, TargetProcessStateAfterCapture::INTERNAL_ERROR);
    }
}
