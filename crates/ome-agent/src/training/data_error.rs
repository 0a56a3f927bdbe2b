//! Dataset problems reported by the training server
//!
//! A data error ends the run. Its message goes to the container termination
//! log so the TrainingJob shows the user what is wrong with their dataset.

use std::path::Path;

use tracing::{info, warn};

/// Marker PEFT servers put in front of dataset validation failures
pub const PEFT_DATA_ERROR_MARKER: &str = "Data error";

/// Verbose prefix command-R servers put in front of dataset failures
pub const COMMAND_R_DATA_ERROR_PREFIX: &str = "Error while processing the dataset";

/// What users see instead of the command-R prefix and its stack detail
pub const COMMAND_R_DATA_ERROR_MESSAGE: &str =
    "Failed processing dataset, please check dataset if it is a valid format of JSONL";

/// Whether `message` reports a dataset problem
pub fn is_data_error(message: &str) -> bool {
    message.contains(PEFT_DATA_ERROR_MARKER) || message.contains(COMMAND_R_DATA_ERROR_PREFIX)
}

/// Replace known verbose messages with a short user-facing one
pub fn user_facing_message(message: &str) -> String {
    if message.contains(COMMAND_R_DATA_ERROR_PREFIX) {
        COMMAND_R_DATA_ERROR_MESSAGE.to_string()
    } else {
        message.to_string()
    }
}

/// Record `message` if it is a data error; returns the recorded text.
///
/// Failing to write the log only warns: the run is failing anyway and the
/// caller's error carries the message too.
pub async fn record_data_error(termination_log: &Path, message: &str) -> Option<String> {
    if !is_data_error(message) {
        return None;
    }
    let text = user_facing_message(message);
    if let Some(parent) = termination_log.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "failed to create termination log directory");
        }
    }
    match tokio::fs::write(termination_log, text.as_bytes()).await {
        Ok(()) => info!(path = %termination_log.display(), "wrote data error to termination log"),
        Err(e) => warn!(path = %termination_log.display(), error = %e, "failed to write termination log"),
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(is_data_error("Data error: malformed jsonl"));
        assert!(is_data_error(
            "Error while processing the dataset: Traceback (most recent call last) ..."
        ));
        assert!(!is_data_error("CUDA out of memory"));
    }

    #[test]
    fn test_command_r_prefix_is_replaced() {
        assert_eq!(
            user_facing_message("Error while processing the dataset: line 3: bad json"),
            COMMAND_R_DATA_ERROR_MESSAGE
        );
        assert_eq!(
            user_facing_message("Data error: malformed jsonl"),
            "Data error: malformed jsonl"
        );
    }

    #[tokio::test]
    async fn test_only_data_errors_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("dev").join("termination-log");

        assert_eq!(record_data_error(&log, "CUDA out of memory").await, None);
        assert!(!log.exists());

        let recorded = record_data_error(&log, "Data error: malformed jsonl").await;
        assert_eq!(recorded.as_deref(), Some("Data error: malformed jsonl"));
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "Data error: malformed jsonl"
        );
    }
}
