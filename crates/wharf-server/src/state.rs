//! Upload and table-upload state machines
//!
//! Upload statuses move along a fixed DAG; the only re-entries the journal
//! accepts are a failed phase resuming itself and idempotent re-application
//! of the current state after a crash. Anything else is an invariant
//! violation and is rejected.

use serde::{Deserialize, Serialize};

/// Lifecycle of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Waiting,
    GeneratingLoadFiles,
    GeneratingLoadFilesFailed,
    GeneratedLoadFiles,
    UpdatingSchema,
    UpdatingSchemaFailed,
    UpdatedSchema,
    ExportingData,
    ExportingDataFailed,
    ExportedData,
    Aborted,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Waiting => "waiting",
            UploadState::GeneratingLoadFiles => "generating_load_files",
            UploadState::GeneratingLoadFilesFailed => "generating_load_files_failed",
            UploadState::GeneratedLoadFiles => "generated_load_files",
            UploadState::UpdatingSchema => "updating_schema",
            UploadState::UpdatingSchemaFailed => "updating_schema_failed",
            UploadState::UpdatedSchema => "updated_schema",
            UploadState::ExportingData => "exporting_data",
            UploadState::ExportingDataFailed => "exporting_data_failed",
            UploadState::ExportedData => "exported_data",
            UploadState::Aborted => "aborted",
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::ExportedData | UploadState::Aborted)
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            UploadState::GeneratingLoadFilesFailed
                | UploadState::UpdatingSchemaFailed
                | UploadState::ExportingDataFailed
        )
    }

    /// The failure fork of an in-flight phase.
    pub fn failure(self) -> Option<UploadState> {
        match self {
            UploadState::GeneratingLoadFiles => Some(UploadState::GeneratingLoadFilesFailed),
            UploadState::UpdatingSchema => Some(UploadState::UpdatingSchemaFailed),
            UploadState::ExportingData => Some(UploadState::ExportingDataFailed),
            _ => None,
        }
    }

    /// Whether `next` is a legal journal transition from `self`.
    ///
    /// Re-applying the current state is allowed so that crash replays stay
    /// idempotent; any non-terminal state may be aborted.
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        if self == next {
            return !self.is_terminal();
        }
        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Waiting, GeneratingLoadFiles)
                | (GeneratingLoadFiles, GeneratedLoadFiles)
                | (GeneratingLoadFiles, GeneratingLoadFilesFailed)
                | (GeneratingLoadFilesFailed, GeneratingLoadFiles)
                | (GeneratedLoadFiles, UpdatingSchema)
                | (UpdatingSchema, UpdatedSchema)
                | (UpdatingSchema, UpdatingSchemaFailed)
                | (UpdatingSchemaFailed, UpdatingSchema)
                | (UpdatedSchema, ExportingData)
                | (ExportingData, ExportedData)
                | (ExportingData, ExportingDataFailed)
                | (ExportingDataFailed, ExportingData)
        )
    }
}

impl std::str::FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(UploadState::Waiting),
            "generating_load_files" => Ok(UploadState::GeneratingLoadFiles),
            "generating_load_files_failed" => Ok(UploadState::GeneratingLoadFilesFailed),
            "generated_load_files" => Ok(UploadState::GeneratedLoadFiles),
            "updating_schema" => Ok(UploadState::UpdatingSchema),
            "updating_schema_failed" => Ok(UploadState::UpdatingSchemaFailed),
            "updated_schema" => Ok(UploadState::UpdatedSchema),
            "exporting_data" => Ok(UploadState::ExportingData),
            "exporting_data_failed" => Ok(UploadState::ExportingDataFailed),
            "exported_data" => Ok(UploadState::ExportedData),
            "aborted" => Ok(UploadState::Aborted),
            other => Err(format!("unknown upload state: {other}")),
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one table within an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableUploadState {
    Waiting,
    Executing,
    ExportedData,
    ExportingDataFailed,
}

impl TableUploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            TableUploadState::Waiting => "waiting",
            TableUploadState::Executing => "executing",
            TableUploadState::ExportedData => "exported_data",
            TableUploadState::ExportingDataFailed => "exporting_data_failed",
        }
    }
}

impl std::str::FromStr for TableUploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TableUploadState::Waiting),
            "executing" => Ok(TableUploadState::Executing),
            "exported_data" => Ok(TableUploadState::ExportedData),
            "exporting_data_failed" => Ok(TableUploadState::ExportingDataFailed),
            other => Err(format!("unknown table upload state: {other}")),
        }
    }
}

impl std::fmt::Display for TableUploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use UploadState::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Waiting,
            GeneratingLoadFiles,
            GeneratedLoadFiles,
            UpdatingSchema,
            UpdatedSchema,
            ExportingData,
            ExportedData,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_forks_and_retries() {
        assert!(ExportingData.can_transition_to(ExportingDataFailed));
        assert!(ExportingDataFailed.can_transition_to(ExportingData));
        assert!(UpdatingSchema.can_transition_to(UpdatingSchemaFailed));
        assert!(UpdatingSchemaFailed.can_transition_to(UpdatingSchema));
        assert_eq!(ExportingData.failure(), Some(ExportingDataFailed));
        assert_eq!(Waiting.failure(), None);
    }

    #[test]
    fn test_no_regressions() {
        assert!(!ExportedData.can_transition_to(Waiting));
        assert!(!ExportedData.can_transition_to(ExportingData));
        assert!(!ExportingData.can_transition_to(UpdatingSchema));
        assert!(!UpdatedSchema.can_transition_to(Waiting));
        assert!(!Aborted.can_transition_to(Waiting));
        assert!(!Aborted.can_transition_to(Aborted));
    }

    #[test]
    fn test_abort_from_any_non_terminal() {
        for state in [
            Waiting,
            GeneratingLoadFiles,
            GeneratingLoadFilesFailed,
            GeneratedLoadFiles,
            UpdatingSchema,
            UpdatingSchemaFailed,
            UpdatedSchema,
            ExportingData,
            ExportingDataFailed,
        ] {
            assert!(state.can_transition_to(Aborted), "{state}");
        }
        assert!(!ExportedData.can_transition_to(Aborted));
    }

    #[test]
    fn test_idempotent_reapply() {
        assert!(ExportingData.can_transition_to(ExportingData));
        assert!(!ExportedData.can_transition_to(ExportedData));
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            Waiting,
            GeneratingLoadFiles,
            GeneratingLoadFilesFailed,
            GeneratedLoadFiles,
            UpdatingSchema,
            UpdatingSchemaFailed,
            UpdatedSchema,
            ExportingData,
            ExportingDataFailed,
            ExportedData,
            Aborted,
        ] {
            assert_eq!(state.as_str().parse::<UploadState>(), Ok(state));
        }
        assert!("paused".parse::<UploadState>().is_err());
    }
}
