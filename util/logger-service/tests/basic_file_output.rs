use std::collections::HashMap;
use std::path::PathBuf;

use frame_logger_config::LoggerConfig;

mod utils;

#[test]
fn basic_file_output() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = LoggerConfig {
        filter: Some("trace".to_string()),
        color: false,
        log_to_stdout: true,
        log_to_file: true,
        file: PathBuf::from("basic.log"),
        log_dir: tmp_dir.path().to_path_buf(),
        extra: HashMap::new(),
    };
    let log_file = config.log_dir.join(&config.file);
    let line_content = "test basic file output";

    let guard = frame_logger_service::init(None, config).unwrap();
    utils::log_at_every_level(line_content);
    drop(guard);

    assert!(log_file.exists());
    for level in utils::all_log_levels() {
        assert!(
            utils::has_line_in_log_file(&log_file, *level, line_content),
            "missing {level} line"
        );
    }
}
