//! Termination signal extraction from Breakpad minidumps.
//!
//! ```text
//! header      +8  u32 stream count
//!             +12 u32 stream directory rva
//! directory   count × { u32 stream_type, u32 data_size, u32 rva }
//! exception   rva +0 u32 thread_id, +4 u32 align, +8 u32 exception_code
//! ```
//!
//! All fields are little-endian. Every read is bounds-checked.

use crate::domain::ErrorMessage;
use std::fs;
use std::path::Path;

const STREAM_COUNT_OFFSET: usize = 8;
const STREAM_DIRECTORY_RVA_OFFSET: usize = 12;
const DIRECTORY_ENTRY_SIZE: usize = 12;
const EXCEPTION_STREAM_TYPE: u32 = 6;
/// Offset of `exception_code` inside the exception stream
const EXCEPTION_CODE_OFFSET: usize = 8;

const MAX_SIGNAL: u32 = 31;

fn unexpected_end_of_data() -> ErrorMessage {
    ErrorMessage::new("Unexpected end of data.")
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ErrorMessage> {
    let end = offset.checked_add(4).ok_or_else(unexpected_end_of_data)?;
    let bytes = data.get(offset..end).ok_or_else(unexpected_end_of_data)?;
    let mut le = [0u8; 4];
    le.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(le))
}

fn to_offset(value: u32) -> Result<usize, ErrorMessage> {
    usize::try_from(value).map_err(|_| unexpected_end_of_data())
}

/// Extract the termination signal from minidump bytes.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the data is truncated, has no exception
/// stream, or records an exception code outside the POSIX signal range.
pub fn extract_signal_from_minidump_bytes(data: &[u8]) -> Result<i32, ErrorMessage> {
    let stream_count = to_offset(read_u32(data, STREAM_COUNT_OFFSET)?)?;
    let directory = to_offset(read_u32(data, STREAM_DIRECTORY_RVA_OFFSET)?)?;

    for index in 0..stream_count {
        let entry = index
            .checked_mul(DIRECTORY_ENTRY_SIZE)
            .and_then(|o| o.checked_add(directory))
            .ok_or_else(unexpected_end_of_data)?;
        if read_u32(data, entry)? != EXCEPTION_STREAM_TYPE {
            continue;
        }
        let rva = to_offset(read_u32(data, entry + 8)?)?;
        let code_offset =
            rva.checked_add(EXCEPTION_CODE_OFFSET).ok_or_else(unexpected_end_of_data)?;
        let code = read_u32(data, code_offset)?;
        if code == 0 || code > MAX_SIGNAL {
            return Err(ErrorMessage::new(format!(
                "Invalid termination signal in core file: {code}."
            )));
        }
        // Bounded by MAX_SIGNAL.
        return Ok(i32::try_from(code).unwrap_or_default());
    }

    Err(ErrorMessage::new("No termination signal found in core file."))
}

/// Read the minidump at `path` and extract its termination signal.
///
/// # Errors
/// Returns an [`ErrorMessage`] if the file cannot be read or parsed.
pub fn extract_signal_from_minidump(path: &Path) -> Result<i32, ErrorMessage> {
    let data = fs::read(path)?;
    extract_signal_from_minidump_bytes(&data)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal minidump with the given directory entries and trailing payload.
    pub(crate) fn build_minidump(streams: &[(u32, u32)]) -> Vec<u8> {
        // Header is 32 bytes; directory follows; each stream's payload after it.
        let directory_rva = 32u32;
        let payload_base = directory_rva + 12 * streams.len() as u32;
        let mut data = Vec::new();
        data.extend_from_slice(b"MDMP");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(streams.len() as u32).to_le_bytes());
        data.extend_from_slice(&directory_rva.to_le_bytes());
        data.resize(32, 0);
        for (i, (stream_type, _)) in streams.iter().enumerate() {
            data.extend_from_slice(&stream_type.to_le_bytes());
            data.extend_from_slice(&12u32.to_le_bytes());
            data.extend_from_slice(&(payload_base + 12 * i as u32).to_le_bytes());
        }
        for (_, code) in streams {
            data.extend_from_slice(&1234u32.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&code.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_extracts_exception_code() {
        let data = build_minidump(&[(3, 0), (EXCEPTION_STREAM_TYPE, 4)]);
        assert_eq!(extract_signal_from_minidump_bytes(&data), Ok(4));
    }

    #[test]
    fn test_truncated_data() {
        let data = build_minidump(&[(EXCEPTION_STREAM_TYPE, 11)]);
        let err = extract_signal_from_minidump_bytes(&data[..data.len() - 2]).unwrap_err();
        assert_eq!(err.message(), "Unexpected end of data.");
        let err = extract_signal_from_minidump_bytes(&[0; 10]).unwrap_err();
        assert_eq!(err.message(), "Unexpected end of data.");
    }

    #[test]
    fn test_no_exception_stream() {
        let data = build_minidump(&[(3, 0), (4, 0)]);
        let err = extract_signal_from_minidump_bytes(&data).unwrap_err();
        assert_eq!(err.message(), "No termination signal found in core file.");
    }

    #[test]
    fn test_exception_code_out_of_signal_range() {
        let data = build_minidump(&[(EXCEPTION_STREAM_TYPE, 0xC000_0005)]);
        let err = extract_signal_from_minidump_bytes(&data).unwrap_err();
        assert!(err.message().starts_with("Invalid termination signal"));
        let data = build_minidump(&[(EXCEPTION_STREAM_TYPE, 0)]);
        assert!(extract_signal_from_minidump_bytes(&data).is_err());
    }

    #[test]
    fn test_huge_offsets_do_not_overflow() {
        let mut data = vec![0u8; 16];
        data[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        data[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = extract_signal_from_minidump_bytes(&data).unwrap_err();
        assert_eq!(err.message(), "Unexpected end of data.");
    }

    #[test]
    fn test_missing_file() {
        let err = extract_signal_from_minidump(Path::new("/nonexistent/x.core.dmp")).unwrap_err();
        assert!(err.message().contains("No such file or directory"));
    }
}
