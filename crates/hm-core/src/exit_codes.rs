//! Exit codes for the hm-import driver.
//!
//! One code per error category, so scripts can tell a bad settings file from
//! an unreachable store without parsing output.

use hm_common::ErrorCategory;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ExitCode {
    /// Every file imported without dropped rows
    Clean = 0,

    /// Imported, but row-level failures dropped some datapoints
    PartialImport = 1,

    /// Settings or configuration error
    ConfigError = 10,

    /// Document missing, unreadable or malformed
    DocumentError = 11,

    /// Store rejected instrument/enumeration/parameter metadata
    MetadataError = 12,

    /// Bulk load failed (e.g. duplicate key on the copy channel)
    LoadError = 13,

    /// Store unreachable or failed outside a load
    StoreError = 14,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean | ExitCode::PartialImport)
    }

    /// Check if this exit code indicates an error requiring attention.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }
}

impl From<ErrorCategory> for ExitCode {
    /// Default mapping; resource failures are split further by the caller
    /// into document and store errors.
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::RowLevel => ExitCode::DocumentError,
            ErrorCategory::Metadata => ExitCode::MetadataError,
            ErrorCategory::Load => ExitCode::LoadError,
            ErrorCategory::Resource => ExitCode::StoreError,
            ErrorCategory::Config => ExitCode::ConfigError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.as_i32() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_import_is_success_not_error() {
        assert!(ExitCode::PartialImport.is_success());
        assert!(!ExitCode::PartialImport.is_error());
        assert!(ExitCode::ConfigError.is_error());
        assert_eq!(i32::from(ExitCode::InternalError), 99);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(ExitCode::from(ErrorCategory::Load), ExitCode::LoadError);
        assert_eq!(ExitCode::from(ErrorCategory::Config), ExitCode::ConfigError);
    }
}
