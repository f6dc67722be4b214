//! Stable error codes and categories.
//!
//! Codes are `category * 100 + offset` and never reused; logs and
//! telemetry key on the numeric value, so renaming a variant is fine but
//! renumbering is a breaking change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse error category, derived from the code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Build,
    Parse,
    Analysis,
    Cache,
    FileSystem,
    Graph,
    Language,
    System,
    Internal,
    Distributed,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Build => "Build",
            ErrorCategory::Parse => "Parse",
            ErrorCategory::Analysis => "Analysis",
            ErrorCategory::Cache => "Cache",
            ErrorCategory::FileSystem => "FileSystem",
            ErrorCategory::Graph => "Graph",
            ErrorCategory::Language => "Language",
            ErrorCategory::System => "System",
            ErrorCategory::Internal => "Internal",
            ErrorCategory::Distributed => "Distributed",
        };
        write!(f, "{}", name)
    }
}

/// Every error code in the taxonomy, with its stable numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // Build (1xx)
    BuildFailed = 100,
    BuildTimeout = 101,
    BuildCancelled = 102,
    OutputMissing = 103,

    // Parse (2xx)
    ParseFailed = 200,
    InvalidJson = 201,
    InvalidBuildFile = 202,
    MissingField = 203,
    InvalidFieldValue = 204,
    InvalidGlob = 205,

    // Analysis (3xx)
    AnalysisFailed = 300,
    ImportResolutionFailed = 301,
    MissingDependency = 302,
    InvalidImport = 303,
    CircularDependency = 304,

    // Cache (4xx)
    CacheLoadFailed = 400,
    CacheSaveFailed = 401,
    CacheEvictionFailed = 402,
    CacheCorrupted = 403,

    // FileSystem (5xx)
    FileReadFailed = 500,
    FileWriteFailed = 501,
    FileNotFound = 502,
    DirectoryNotFound = 503,
    PermissionDenied = 504,

    // Graph (6xx)
    GraphCycle = 600,
    GraphInvalid = 601,
    NodeNotFound = 602,
    EdgeInvalid = 603,

    // Language (7xx)
    SyntaxError = 700,
    CompilationFailed = 701,
    ValidationFailed = 702,
    UnsupportedLanguage = 703,
    MissingCompiler = 704,

    // System (8xx)
    ProcessSpawnFailed = 800,
    ProcessTimeout = 801,
    ProcessCrashed = 802,
    OutOfMemory = 803,
    ThreadPoolError = 804,

    // Internal (9xx)
    InternalError = 900,
    NotImplemented = 901,
    AssertionFailed = 902,
    UnreachableCode = 903,

    // Distributed (10xx)
    NetworkError = 1000,
    Timeout = 1001,
    NoAvailableWorkers = 1002,
    StaleCheckpoint = 1003,
}

impl ErrorCode {
    /// The stable numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Category this code belongs to.
    pub fn category(self) -> ErrorCategory {
        match self.code() / 100 {
            1 => ErrorCategory::Build,
            2 => ErrorCategory::Parse,
            3 => ErrorCategory::Analysis,
            4 => ErrorCategory::Cache,
            5 => ErrorCategory::FileSystem,
            6 => ErrorCategory::Graph,
            7 => ErrorCategory::Language,
            8 => ErrorCategory::System,
            9 => ErrorCategory::Internal,
            _ => ErrorCategory::Distributed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::BuildFailed.code(), 100);
        assert_eq!(ErrorCode::CacheCorrupted.code(), 403);
        assert_eq!(ErrorCode::GraphCycle.code(), 600);
        assert_eq!(ErrorCode::StaleCheckpoint.code(), 1003);
    }

    #[test]
    fn test_category_from_range() {
        assert_eq!(ErrorCode::InvalidGlob.category(), ErrorCategory::Parse);
        assert_eq!(ErrorCode::PermissionDenied.category(), ErrorCategory::FileSystem);
        assert_eq!(ErrorCode::OutOfMemory.category(), ErrorCategory::System);
        assert_eq!(ErrorCode::NetworkError.category(), ErrorCategory::Distributed);
        assert_eq!(ErrorCode::UnreachableCode.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_code_serializes_by_name() {
        let json = serde_json::to_string(&ErrorCode::CacheCorrupted).unwrap();
        assert_eq!(json, "\"CacheCorrupted\"");
    }
}
