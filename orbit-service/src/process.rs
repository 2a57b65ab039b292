//! Target process queries reported in `CaptureStarted`.

use crate::domain::{ErrorMessage, Pid};
use crate::procfs::DEFAULT_PROC_ROOT;
use object::{Object, ObjectKind};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolves the executable of a running process.
pub trait ExecutablePathQuery: Send + Sync {
    /// # Errors
    /// Returns an [`ErrorMessage`] if the process is gone or not accessible.
    fn executable_path(&self, pid: Pid) -> Result<PathBuf, ErrorMessage>;
}

/// Computes the build id of an executable file.
pub trait BuildIdQuery: Send + Sync {
    /// # Errors
    /// Returns an [`ErrorMessage`] if the file cannot be read or carries no build id.
    fn build_id_for(&self, path: &Path) -> Result<String, ErrorMessage>;
}

/// Reads `/proc/<pid>/exe`.
#[derive(Debug, Clone)]
pub struct ProcfsExecutablePathQuery {
    proc_root: PathBuf,
}

impl ProcfsExecutablePathQuery {
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self { proc_root: proc_root.into() }
    }
}

impl Default for ProcfsExecutablePathQuery {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ExecutablePathQuery for ProcfsExecutablePathQuery {
    fn executable_path(&self, pid: Pid) -> Result<PathBuf, ErrorMessage> {
        let exe_link = self.proc_root.join(pid.0.to_string()).join("exe");
        fs::read_link(&exe_link)
            .map_err(|e| ErrorMessage::new(format!("Cannot read {}: {e}", exe_link.display())))
    }
}

/// Reads build ids with the `object` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectFileBuildIdQuery;

impl BuildIdQuery for ObjectFileBuildIdQuery {
    fn build_id_for(&self, path: &Path) -> Result<String, ErrorMessage> {
        build_id_for(path)
    }
}

/// Build id of the file at `path`.
///
/// Files ending in `.exe` are read as PE/COFF and identified by their CodeView
/// GUID and age; everything else is read as ELF and identified by the GNU
/// build-id note.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the file cannot be read or parsed, or has no id.
pub fn build_id_for(path: &Path) -> Result<String, ErrorMessage> {
    let data = fs::read(path)
        .map_err(|e| ErrorMessage::new(format!("Unable to read \"{}\": {e}", path.display())))?;
    let obj = object::File::parse(&*data)
        .map_err(|e| ErrorMessage::new(format!("Unable to parse \"{}\": {e}", path.display())))?;

    let is_pe = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));
    if is_pe {
        pe_build_id(&obj, path)
    } else {
        elf_build_id(&obj, path)
    }
}

fn elf_build_id(obj: &object::File<'_>, path: &Path) -> Result<String, ErrorMessage> {
    if obj.kind() == ObjectKind::Unknown {
        return Err(ErrorMessage::new(format!("\"{}\" is not an object file", path.display())));
    }
    match obj.build_id() {
        Ok(Some(id)) if !id.is_empty() => Ok(to_hex(id)),
        Ok(_) => Err(ErrorMessage::new(format!("\"{}\" has no build id", path.display()))),
        Err(e) => Err(ErrorMessage::new(format!(
            "Unable to read build id of \"{}\": {e}",
            path.display()
        ))),
    }
}

fn pe_build_id(obj: &object::File<'_>, path: &Path) -> Result<String, ErrorMessage> {
    match obj.pdb_info() {
        Ok(Some(info)) => Ok(format!("{}-{}", to_hex(&info.guid()), info.age())),
        Ok(None) => {
            Err(ErrorMessage::new(format!("\"{}\" has no CodeView record", path.display())))
        }
        Err(e) => Err(ErrorMessage::new(format!(
            "Unable to read debug directory of \"{}\": {e}",
            path.display()
        ))),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
