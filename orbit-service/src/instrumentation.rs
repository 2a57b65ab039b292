//! User-space dynamic instrumentation glue
//!
//! The installer itself lives outside the capture core behind
//! [`InstrumentationManager`]. This module holds what the core needs around
//! it: the trampoline address ranges consulted while unwinding, the report
//! returned on success, and the bookkeeping that keeps uprobes and
//! trampolines from instrumenting the same function twice.

use crate::domain::{ErrorMessage, Pid};
use orbit_protos::{
    CallstackType, CaptureOptions, FunctionThatFailedToBeInstrumented,
    WarningInstrumentingWithUserSpaceInstrumentationEvent,
};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Check if an address falls within this range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Where the trampolines of one capture live in the target's address space.
///
/// Built once at capture start and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpaceInstrumentationAddresses {
    /// Sorted by start, non-overlapping
    entry_trampoline_ranges: Vec<AddressRange>,
    return_trampoline_range: AddressRange,
    injected_library_map_name: String,
}

impl UserSpaceInstrumentationAddresses {
    /// # Errors
    /// Returns an [`ErrorMessage`] if two entry trampoline ranges overlap.
    pub fn new(
        mut entry_trampoline_ranges: Vec<AddressRange>,
        return_trampoline_range: AddressRange,
        injected_library_map_name: impl Into<String>,
    ) -> Result<Self, ErrorMessage> {
        entry_trampoline_ranges.sort_unstable();
        if let Some(w) = entry_trampoline_ranges.windows(2).find(|w| w[0].end > w[1].start) {
            return Err(ErrorMessage::new(format!(
                "Entry trampoline ranges overlap: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                w[0].start, w[0].end, w[1].start, w[1].end
            )));
        }
        Ok(Self {
            entry_trampoline_ranges,
            return_trampoline_range,
            injected_library_map_name: injected_library_map_name.into(),
        })
    }

    #[must_use]
    pub fn is_in_entry_trampoline(&self, addr: u64) -> bool {
        // Index of the first range starting after addr; only its predecessor can contain addr.
        let idx = self.entry_trampoline_ranges.partition_point(|r| r.start <= addr);
        idx > 0 && self.entry_trampoline_ranges[idx - 1].contains(addr)
    }

    #[must_use]
    pub fn is_in_return_trampoline(&self, addr: u64) -> bool {
        self.return_trampoline_range.contains(addr)
    }

    #[must_use]
    pub fn injected_library_map_name(&self) -> &str {
        &self.injected_library_map_name
    }

    /// Classify an unwound callstack, innermost frame first.
    ///
    /// A sample taken while executing trampoline code cannot be unwound
    /// reliably; a return trampoline further up the stack means the real
    /// return address was not patched back in.
    #[must_use]
    pub fn classify_callstack(&self, pcs: &[u64]) -> CallstackType {
        let Some((&innermost, outer)) = pcs.split_first() else {
            return CallstackType::Complete;
        };
        if self.is_in_entry_trampoline(innermost) || self.is_in_return_trampoline(innermost) {
            return CallstackType::InUserSpaceInstrumentation;
        }
        if outer.iter().any(|&pc| self.is_in_return_trampoline(pc)) {
            return CallstackType::CallstackPatchingFailed;
        }
        CallstackType::Complete
    }
}

/// Outcome of instrumenting a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationReport {
    pub instrumented_function_ids: HashSet<u64>,
    /// Recoverable per-function failures
    pub function_ids_to_error_messages: BTreeMap<u64, String>,
    pub entry_trampoline_address_ranges: Vec<AddressRange>,
    pub return_trampoline_address_range: AddressRange,
    pub injected_library_path: PathBuf,
}

impl InstrumentationReport {
    /// # Errors
    /// Returns an [`ErrorMessage`] if the reported entry trampoline ranges overlap.
    pub fn addresses(&self) -> Result<UserSpaceInstrumentationAddresses, ErrorMessage> {
        UserSpaceInstrumentationAddresses::new(
            self.entry_trampoline_address_ranges.clone(),
            self.return_trampoline_address_range,
            self.injected_library_path.to_string_lossy(),
        )
    }
}

/// Installs and removes trampolines in a target process.
///
/// Not re-entrant: uninstrumenting a process completes before the next
/// instrumentation of it begins.
pub trait InstrumentationManager: Send + Sync {
    /// # Errors
    /// Returns an [`ErrorMessage`] if no function could be instrumented at all.
    fn instrument_process(&self, options: &CaptureOptions)
        -> Result<InstrumentationReport, ErrorMessage>;

    /// # Errors
    /// Returns an [`ErrorMessage`] if the trampolines could not be removed.
    fn uninstrument_process(&self, pid: Pid) -> Result<(), ErrorMessage>;
}

/// Remove the functions in `instrumented_function_ids` from `options`.
///
/// The relative order of the remaining functions is kept.
pub fn filter_out_instrumented_functions(
    instrumented_function_ids: &HashSet<u64>,
    options: &mut CaptureOptions,
) {
    options
        .instrumented_functions
        .retain(|f| !instrumented_function_ids.contains(&f.function_id));
}

/// Warning listing every function that failed, ordered by function id.
#[must_use]
pub fn create_warning_instrumenting_with_user_space_instrumentation_event(
    timestamp_ns: u64,
    function_ids_to_error_messages: &BTreeMap<u64, String>,
) -> WarningInstrumentingWithUserSpaceInstrumentationEvent {
    WarningInstrumentingWithUserSpaceInstrumentationEvent {
        timestamp_ns,
        functions_that_failed_to_instrument: function_ids_to_error_messages
            .iter()
            .map(|(&function_id, message)| FunctionThatFailedToBeInstrumented {
                function_id,
                error_message: message.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_protos::InstrumentedFunction;

    fn addresses() -> UserSpaceInstrumentationAddresses {
        UserSpaceInstrumentationAddresses::new(
            vec![AddressRange::new(15, 20), AddressRange::new(5, 10)],
            AddressRange::new(42, 84),
            "/path/to/library.so",
        )
        .unwrap()
    }

    #[test]
    fn test_address_range_contains() {
        let range = AddressRange::new(0x1000, 0x2000);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_entry_trampoline_queries() {
        let addrs = addresses();
        let expected = [
            (4, false),
            (5, true),
            (9, true),
            (10, false),
            (12, false),
            (15, true),
            (19, true),
            (20, false),
        ];
        for (addr, inside) in expected {
            assert_eq!(addrs.is_in_entry_trampoline(addr), inside, "addr {addr}");
        }
    }

    #[test]
    fn test_return_trampoline_queries() {
        let addrs = addresses();
        assert!(!addrs.is_in_return_trampoline(41));
        assert!(addrs.is_in_return_trampoline(42));
        assert!(addrs.is_in_return_trampoline(83));
        assert!(!addrs.is_in_return_trampoline(84));
        assert_eq!(addrs.injected_library_map_name(), "/path/to/library.so");
    }

    #[test]
    fn test_overlapping_entry_ranges_rejected() {
        let err = UserSpaceInstrumentationAddresses::new(
            vec![AddressRange::new(9, 12), AddressRange::new(5, 10)],
            AddressRange::new(42, 84),
            "lib.so",
        )
        .unwrap_err();
        assert_eq!(err.message(), "Entry trampoline ranges overlap: [0x5, 0xa) and [0x9, 0xc)");
    }

    #[test]
    fn test_default_report_has_empty_ranges() {
        let report = InstrumentationReport::default();
        assert!(report.instrumented_function_ids.is_empty());
        assert_eq!(report.return_trampoline_address_range, AddressRange::new(0, 0));
        let addrs = report.addresses().unwrap();
        assert!(!addrs.is_in_entry_trampoline(0));
        assert!(!addrs.is_in_return_trampoline(0));
    }

    #[test]
    fn test_classify_callstack() {
        let addrs = addresses();
        assert_eq!(addrs.classify_callstack(&[]), CallstackType::Complete);
        assert_eq!(addrs.classify_callstack(&[100, 200]), CallstackType::Complete);
        assert_eq!(addrs.classify_callstack(&[6, 200]), CallstackType::InUserSpaceInstrumentation);
        assert_eq!(addrs.classify_callstack(&[50]), CallstackType::InUserSpaceInstrumentation);
        assert_eq!(
            addrs.classify_callstack(&[100, 50, 200]),
            CallstackType::CallstackPatchingFailed
        );
        // Entry trampolines further out are not a patching failure.
        assert_eq!(addrs.classify_callstack(&[100, 6]), CallstackType::Complete);
    }

    #[test]
    fn test_filter_keeps_order_of_remaining_functions() {
        let mut options = CaptureOptions::for_pid(1);
        options.instrumented_functions = (1..=5)
            .map(|id| InstrumentedFunction {
                function_id: id,
                absolute_address_or_offset: id * 16,
                module_path: "/bin/app".into(),
                function_name: format!("f{id}"),
            })
            .collect();
        filter_out_instrumented_functions(&HashSet::from([2, 4]), &mut options);
        let ids: Vec<u64> = options.instrumented_functions.iter().map(|f| f.function_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_warning_sorted_by_function_id() {
        let failures = BTreeMap::from([(9, "b".to_string()), (3, "a".to_string())]);
        let warning = create_warning_instrumenting_with_user_space_instrumentation_event(77, &failures);
        assert_eq!(warning.timestamp_ns, 77);
        let ids: Vec<u64> =
            warning.functions_that_failed_to_instrument.iter().map(|f| f.function_id).collect();
        assert_eq!(ids, vec![3, 9]);
    }
}
