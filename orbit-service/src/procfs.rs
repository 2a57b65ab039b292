//! `/proc` parsing shared by the watchdog, the memory sampler, the procfs
//! tracer and the post-mortem.
//!
//! Every reader takes the proc root as a parameter so tests can point it at a
//! synthetic tree.

#![allow(unsafe_code)] // sysconf() requires unsafe

use crate::domain::{ErrorMessage, Pid};
use log::debug;
use orbit_protos::ModuleInfo;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Zero-based index of the RSS field in `/proc/<pid>/stat`
const RSS_FIELD_INDEX: usize = 23;

/// Fields that precede the first token after the parenthesised process name
const FIELDS_BEFORE_STATE: usize = 2;

// ============================================================================
// stat
// ============================================================================

/// Extract the resident set size, in pages, from the contents of `/proc/<pid>/stat`.
///
/// The process name is skipped by looking for the last `)`, since it may contain
/// spaces and parentheses itself.
#[must_use]
pub fn extract_rss_in_pages_from_proc_pid_stat(stat: &str) -> Option<u64> {
    let after_name = &stat[stat.rfind(')')? + 1..];
    after_name
        .split_whitespace()
        .nth(RSS_FIELD_INDEX - FIELDS_BEFORE_STATE)?
        .parse()
        .ok()
}

/// Memory page size of this host.
#[must_use]
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}

/// RSS in bytes of `process`, which is a pid or `self`.
#[must_use]
pub fn read_rss_in_bytes(proc_root: &Path, process: &str) -> Option<u64> {
    let stat = fs::read_to_string(proc_root.join(process).join("stat")).ok()?;
    extract_rss_in_pages_from_proc_pid_stat(&stat).and_then(|pages| pages.checked_mul(page_size()))
}

/// Whether `/proc/<pid>` exists.
///
/// # Errors
/// Returns an [`ErrorMessage`] if existence cannot be determined.
pub fn process_exists(proc_root: &Path, pid: Pid) -> Result<bool, ErrorMessage> {
    let dir = proc_root.join(pid.0.to_string());
    dir.try_exists().map_err(|e| {
        ErrorMessage::new(format!("Unable to check for existence of \"{}\": {e}", dir.display()))
    })
}

// ============================================================================
// meminfo
// ============================================================================

/// The `/proc/meminfo` counters the capture service reports, in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
}

impl MemInfo {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_kb * 1024
    }
}

/// Parse `/proc/meminfo`. Only `MemTotal` is required.
#[must_use]
pub fn parse_meminfo(contents: &str) -> Option<MemInfo> {
    let mut info = MemInfo::default();
    let mut has_total = false;
    for line in contents.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) else {
            continue;
        };
        match key {
            "MemTotal" => {
                info.total_kb = value;
                has_total = true;
            }
            "MemFree" => info.free_kb = value,
            "MemAvailable" => info.available_kb = value,
            "Buffers" => info.buffers_kb = value,
            "Cached" => info.cached_kb = value,
            _ => {}
        }
    }
    has_total.then_some(info)
}

/// Read and parse `<proc_root>/meminfo`.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the file is unreadable or lacks `MemTotal`.
pub fn read_meminfo(proc_root: &Path) -> Result<MemInfo, ErrorMessage> {
    let path = proc_root.join("meminfo");
    let contents = fs::read_to_string(&path)
        .map_err(|e| ErrorMessage::new(format!("Failed to read {}: {e}", path.display())))?;
    parse_meminfo(&contents)
        .ok_or_else(|| ErrorMessage::new(format!("No MemTotal in {}", path.display())))
}

// ============================================================================
// Threads
// ============================================================================

/// Names of all threads of `pid`, from `/proc/<pid>/task/*/comm`, sorted by tid.
///
/// Threads that exit while the directory is being read are skipped.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the task directory cannot be read.
pub fn read_thread_names(proc_root: &Path, pid: Pid) -> Result<Vec<(u32, String)>, ErrorMessage> {
    let task_dir = proc_root.join(pid.0.to_string()).join("task");
    let entries = fs::read_dir(&task_dir)
        .map_err(|e| ErrorMessage::new(format!("Failed to read {}: {e}", task_dir.display())))?;

    let mut names: Vec<(u32, String)> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
            let comm = fs::read_to_string(entry.path().join("comm")).ok()?;
            Some((tid, comm.trim_end().to_string()))
        })
        .collect();
    names.sort_unstable_by_key(|(tid, _)| *tid);
    Ok(names)
}

// ============================================================================
// Memory maps
// ============================================================================

/// One executable, file-backed line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: PathBuf,
}

/// Parse the executable, file-backed mappings of a maps file.
///
/// Line format: `start-end perms offset dev inode pathname`.
#[must_use]
pub fn parse_executable_mappings(maps: &str) -> Vec<ExecutableMapping> {
    maps.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<ExecutableMapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let path = parts.nth(2)?;
    if !perms.contains('x') || !path.starts_with('/') {
        return None;
    }
    Some(ExecutableMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: PathBuf::from(path),
    })
}

/// Modules mapped executable into `pid`, one per file, ordered by path.
///
/// Build ids are filled in where the file can be parsed.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the maps file cannot be read.
pub fn read_modules(proc_root: &Path, pid: Pid) -> Result<Vec<ModuleInfo>, ErrorMessage> {
    let maps_path = proc_root.join(pid.0.to_string()).join("maps");
    let maps = fs::read_to_string(&maps_path)
        .map_err(|e| ErrorMessage::new(format!("Failed to read {}: {e}", maps_path.display())))?;
    Ok(modules_from_mappings(parse_executable_mappings(&maps)))
}

fn modules_from_mappings(mappings: Vec<ExecutableMapping>) -> Vec<ModuleInfo> {
    let mut by_path: BTreeMap<PathBuf, ModuleInfo> = BTreeMap::new();
    for mapping in mappings {
        if let Some(module) = by_path.get_mut(&mapping.path) {
            module.address_start = module.address_start.min(mapping.start);
            module.address_end = module.address_end.max(mapping.end);
            continue;
        }
        let file_size = fs::metadata(&mapping.path).map_or(0, |m| m.len());
        let build_id = crate::process::build_id_for(&mapping.path).unwrap_or_else(|e| {
            debug!("No build id for {}: {e}", mapping.path.display());
            String::new()
        });
        let module = ModuleInfo {
            name: mapping
                .path
                .file_name()
                .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
            file_path: mapping.path.to_string_lossy().into_owned(),
            file_size,
            address_start: mapping.start,
            address_end: mapping.end,
            build_id,
            load_bias: mapping.start.wrapping_sub(mapping.offset),
        };
        by_path.insert(mapping.path, module);
    }
    by_path.into_values().collect()
}
