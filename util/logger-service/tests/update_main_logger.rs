use std::collections::HashMap;
use std::path::PathBuf;

use frame_logger::Level;
use frame_logger_config::LoggerConfig;
use frame_logger_service::Logger;

mod utils;

#[test]
fn update_main_logger_changes_the_active_filter() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = LoggerConfig {
        filter: Some(Level::Trace.as_str().to_string()),
        color: false,
        log_to_stdout: false,
        log_to_file: true,
        file: PathBuf::from("update.log"),
        log_dir: tmp_dir.path().to_path_buf(),
        extra: HashMap::new(),
    };
    let log_file = config.log_dir.join(&config.file);
    let line_below_floor = "line written while trace was active";
    let line_raised = "line written after raising to warn";

    let guard = frame_logger_service::init(None, config).unwrap();
    utils::log_at_every_level(line_below_floor);

    Logger::update_main_logger(Some(Level::Warn.as_str().to_string()), None, None, None).unwrap();
    utils::log_at_every_level(line_raised);
    drop(guard);

    for level in utils::all_log_levels() {
        assert!(utils::has_line_in_log_file(&log_file, *level, line_below_floor));
    }
    for level in utils::all_log_levels() {
        assert_eq!(
            *level <= Level::Warn,
            utils::has_line_in_log_file(&log_file, *level, line_raised),
        );
    }
}
