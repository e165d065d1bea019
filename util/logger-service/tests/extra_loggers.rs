use std::collections::HashMap;
use std::path::PathBuf;

use frame_logger::Level;
use frame_logger_config::{ExtraLoggerConfig, LoggerConfig};
use frame_logger_service::Logger;

mod utils;

#[test]
fn extra_logger_mirrors_records_filtered_by_its_own_level() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let mut extra = HashMap::new();
    extra.insert(
        "audit".to_string(),
        ExtraLoggerConfig {
            filter: "warn".to_string(),
        },
    );
    let config = LoggerConfig {
        filter: Some(Level::Trace.as_str().to_string()),
        color: false,
        log_to_stdout: false,
        log_to_file: true,
        file: PathBuf::from("extra_main.log"),
        log_dir: tmp_dir.path().to_path_buf(),
        extra,
    };
    let audit_file = config.log_dir.join("audit.log");
    let removed_file = config.log_dir.join("removed.log");
    let line_content = "test extra loggers";

    let guard = frame_logger_service::init(None, config).unwrap();
    Logger::update_extra_logger("removed".to_string(), "trace".to_string()).unwrap();
    Logger::remove_extra_logger("removed".to_string()).unwrap();
    utils::log_at_every_level(line_content);
    drop(guard);

    assert!(audit_file.exists());
    for level in utils::all_log_levels() {
        assert_eq!(
            *level <= Level::Warn,
            utils::has_line_in_log_file(&audit_file, *level, line_content),
        );
    }

    assert!(removed_file.exists(), "file created before removal should remain");
    for level in utils::all_log_levels() {
        assert!(!utils::has_line_in_log_file(&removed_file, *level, line_content));
    }
}
