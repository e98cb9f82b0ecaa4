//! Filter selection and the rolling log file used by the CLI subscriber.

use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "tilescale";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_RETENTION_FILES: usize = 14;

/// ONNX Runtime is chatty at warn level; the console only shows its errors.
const RUNTIME_TARGET: &str = "ort";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum FileSink {
    Rolling(RollingFileAppender),
    Unavailable {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl LogSettings {
    /// `--log-filter` wins, then `-vv` (trace), `-v` (debug), `RUST_LOG`, and finally info.
    fn user_filter(&self) -> String {
        match (&self.cli_filter, self.verbose, &self.env_filter) {
            (Some(filter), _, _) => filter.clone(),
            (None, 2.., _) => "trace".to_string(),
            (None, 1, _) => "debug".to_string(),
            (None, 0, Some(filter)) => filter.clone(),
            (None, 0, None) => DEFAULT_LOG_FILTER.to_string(),
        }
    }

    /// Runtime noise is muted only when the user did not ask for a level explicitly.
    pub fn filters(&self) -> LogFilters {
        let user = self.user_filter();
        if self.cli_filter.is_some() || self.verbose > 0 {
            return LogFilters {
                console: user.clone(),
                file: user,
            };
        }
        LogFilters {
            console: format!("{RUNTIME_TARGET}=error,{user}"),
            file: format!("{RUNTIME_TARGET}=warn,{user}"),
        }
    }

    /// Daily-rotated `tilescale.*.log` under `<data_dir>/logs`.
    pub fn file_sink(&self) -> FileSink {
        let Some(data_dir) = &self.data_dir else {
            return FileSink::Unavailable {
                log_dir: None,
                reason: "no data directory configured".to_string(),
            };
        };

        let log_dir = data_dir.join(LOG_DIR_NAME);
        if let Err(error) = fs::create_dir_all(&log_dir) {
            return FileSink::Unavailable {
                log_dir: Some(log_dir),
                reason: format!("failed to create log directory: {error}"),
            };
        }

        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(LOG_RETENTION_FILES)
            .build(&log_dir)
            .map(FileSink::Rolling)
            .unwrap_or_else(|error| FileSink::Unavailable {
                log_dir: Some(log_dir),
                reason: format!("failed to open rolling log file: {error}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_cli_filter_beats_verbose_and_env() {
        let settings = LogSettings {
            verbose: 2,
            cli_filter: Some("tilescale_core=trace".to_string()),
            env_filter: Some("error".to_string()),
            ..Default::default()
        };
        let filters = settings.filters();
        assert_eq!(filters.console, "tilescale_core=trace");
        assert_eq!(filters.file, "tilescale_core=trace");
    }

    #[test]
    fn test_verbose_maps_to_debug_and_trace() {
        for (verbose, expected) in [(1, "debug"), (2, "trace"), (5, "trace")] {
            let settings = LogSettings {
                verbose,
                env_filter: Some("warn".to_string()),
                ..Default::default()
            };
            assert_eq!(settings.filters().console, expected);
        }
    }

    #[test]
    fn test_implicit_filters_mute_runtime_on_console_only() {
        let filters = LogSettings::default().filters();
        assert_eq!(filters.console, "ort=error,info");
        assert_eq!(filters.file, "ort=warn,info");

        let settings = LogSettings {
            env_filter: Some("warn,tilescale_core=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.filters().console, "ort=error,warn,tilescale_core=debug");
    }

    #[test]
    fn test_file_sink_lives_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let settings = LogSettings {
            data_dir: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };
        match settings.file_sink() {
            FileSink::Rolling(_) => assert!(data_dir.path().join(LOG_DIR_NAME).is_dir()),
            FileSink::Unavailable { reason, .. } => panic!("expected rolling sink: {reason}"),
        }
    }

    #[test]
    fn test_file_sink_unavailable_without_data_dir() {
        match LogSettings::default().file_sink() {
            FileSink::Unavailable { log_dir, reason } => {
                assert_eq!(log_dir, None);
                assert!(reason.contains("no data directory"));
            }
            FileSink::Rolling(_) => panic!("expected no file sink"),
        }
    }

    #[test]
    fn test_file_sink_unavailable_when_data_dir_is_a_file() {
        let file = NamedTempFile::new().expect("named temp file");
        let settings = LogSettings {
            data_dir: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        match settings.file_sink() {
            FileSink::Unavailable { log_dir, reason } => {
                assert_eq!(log_dir, Some(file.path().join(LOG_DIR_NAME)));
                assert!(reason.contains("failed to create log directory"));
            }
            FileSink::Rolling(_) => panic!("expected file sink to be unavailable"),
        }
    }
}
