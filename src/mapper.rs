//! Mapping of raw API VM items to metric values.
//!
//! Everything here is pure: no I/O, no registry. A field that cannot be
//! mapped is logged and left out of the resulting [`VmRecord`]; the rest of
//! the VM is still exported.

use crate::client::RawVm;
use crate::error::{AltaroError, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use serde_json::Value;
use tracing::{debug, warn};

/// Format of `LastBackupTime` and friends, e.g. `2024-08-13-01-53-14`.
const BACKUP_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Outcome of the last backup or offsite copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupResult {
    Success,
    Warning,
    Error,
    Unknown,
    Other,
}

impl BackupResult {
    /// Parse a result string, case-insensitively. Never fails: anything
    /// unrecognized is [`BackupResult::Other`].
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "success" => BackupResult::Success,
            "warning" => BackupResult::Warning,
            "error" => BackupResult::Error,
            "unknown" => BackupResult::Unknown,
            _ => BackupResult::Other,
        }
    }

    /// Gauge value.
    pub fn code(self) -> f64 {
        match self {
            BackupResult::Success => 0.0,
            BackupResult::Warning => 1.0,
            BackupResult::Error => 2.0,
            BackupResult::Unknown => 3.0,
            BackupResult::Other => 4.0,
        }
    }
}

/// Statistics of one job kind (backup or offsite copy). `None` means "no sample".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStats {
    /// Unix timestamp of the last run
    pub timestamp: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub transfer_compressed_bytes: Option<f64>,
    pub transfer_uncompressed_bytes: Option<f64>,
    pub result: Option<BackupResult>,
}

/// A VM ready to be written to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub vm_name: String,
    pub host_name: String,
    pub vm_uuid: String,
    /// A next backup or next offsite copy is planned
    pub scheduled: bool,
    pub last_backup: JobStats,
    pub last_offsite_copy: JobStats,
}

impl VmRecord {
    /// Label values in `vmname`, `hostname`, `vmuuid` order.
    pub fn labels(&self) -> [&str; 3] {
        [&self.vm_name, &self.host_name, &self.vm_uuid]
    }
}

/// Map and filter a VM listing.
///
/// VMs with neither a next backup nor a next offsite copy scheduled are
/// dropped unless `include_non_scheduled` is set.
pub fn map_vms(raw: &[RawVm], include_non_scheduled: bool) -> Vec<VmRecord> {
    raw.iter()
        .map(map_vm)
        .filter(|vm| {
            if !include_non_scheduled && !vm.scheduled {
                debug!("Skipping non scheduled VM {} on {}", vm.vm_name, vm.host_name);
                return false;
            }
            true
        })
        .collect()
}

/// Map a single VM item.
pub fn map_vm(vm: &RawVm) -> VmRecord {
    debug!("Found VM {} on {}", vm.virtual_machine_name, vm.host_name);

    let name = vm.virtual_machine_name.as_str();
    let last_backup = JobStats {
        timestamp: field(name, "LastBackupTime", || {
            parse_backup_time(text(vm.last_backup_time.as_ref())?)
        }),
        duration_seconds: field(name, "LastBackupDuration", || {
            numeric(vm.last_backup_duration.as_ref())
        }),
        transfer_compressed_bytes: field(name, "LastBackupTransferSizeCompressed", || {
            numeric(vm.last_backup_transfer_size_compressed.as_ref())
        }),
        transfer_uncompressed_bytes: field(name, "LastBackupTransferSizeUncompressed", || {
            numeric(vm.last_backup_transfer_size_uncompressed.as_ref())
        }),
        result: field(name, "LastBackupResult", || {
            result(vm.last_backup_result.as_ref())
        }),
    };
    let last_offsite_copy = JobStats {
        timestamp: field(name, "LastOffsiteCopyTime", || {
            parse_backup_time(text(vm.last_offsite_copy_time.as_ref())?)
        }),
        duration_seconds: field(name, "LastOffsiteCopyDuration", || {
            numeric(vm.last_offsite_copy_duration.as_ref())
        }),
        transfer_compressed_bytes: field(name, "LastOffsiteCopyTransferSizeCompressed", || {
            numeric(vm.last_offsite_copy_transfer_size_compressed.as_ref())
        }),
        transfer_uncompressed_bytes: field(name, "LastOffsiteCopyTransferSizeUncompressed", || {
            numeric(vm.last_offsite_copy_transfer_size_uncompressed.as_ref())
        }),
        result: field(name, "LastOffsiteCopyResult", || {
            result(vm.last_offsite_copy_result.as_ref())
        }),
    };

    VmRecord {
        vm_name: vm.virtual_machine_name.clone(),
        host_name: vm.host_name.clone(),
        vm_uuid: vm.hypervisor_virtual_machine_uuid.clone(),
        scheduled: is_set(vm.next_backup_time.as_ref())
            || is_set(vm.next_offsite_copy_time.as_ref()),
        last_backup,
        last_offsite_copy,
    }
}

/// Parse an API timestamp (local time) into unix seconds.
///
/// Returns `Ok(None)` for a missing or empty value.
pub fn parse_backup_time(value: Option<&str>) -> Result<Option<f64>> {
    let value = match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let naive = NaiveDateTime::parse_from_str(value, BACKUP_TIME_FORMAT)
        .map_err(|e| AltaroError::Mapping(format!("bad timestamp {:?}: {}", value, e)))?;

    // earliest() picks the first instant when a DST change repeats the hour
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| Some(dt.timestamp() as f64))
        .ok_or_else(|| AltaroError::Mapping(format!("nonexistent local time {:?}", value)))
}

/// Read a numeric field. Missing, null and non-numeric values are errors.
pub fn numeric(value: Option<&Value>) -> Result<Option<f64>> {
    match value {
        None | Some(Value::Null) => Err(AltaroError::Mapping("missing value".to_string())),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| AltaroError::Mapping(format!("not a number: {}", v))),
    }
}

/// Read a result field. A missing or blank result is "no sample", not `Other`.
pub fn result(value: Option<&Value>) -> Result<Option<BackupResult>> {
    Ok(text(value)?.map(BackupResult::parse))
}

/// Read a text field. Missing, null and blank values are `None`.
fn text(value: Option<&Value>) -> Result<Option<&str>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(other) => Err(AltaroError::Mapping(format!("not a string: {}", other))),
    }
}

fn is_set(value: Option<&Value>) -> bool {
    matches!(text(value), Ok(Some(_)))
}

fn field<T>(vm_name: &str, field_name: &str, map: impl FnOnce() -> Result<Option<T>>) -> Option<T> {
    match map() {
        Ok(value) => value,
        Err(e) => {
            warn!("VM {}: skipping {}: {}", vm_name, field_name, e);
            None
        }
    }
}
