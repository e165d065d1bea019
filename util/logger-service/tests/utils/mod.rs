#![allow(dead_code)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use frame_logger::Level;
use regex::Regex;

const LOG_TIMESTAMP_REGEX: &str = r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{1,3} [+-]\d{2}:\d{2}";

pub fn has_line_in_log_file(log_file: &Path, level: Level, content_pattern: &str) -> bool {
    let pattern = format!(r"^{LOG_TIMESTAMP_REGEX} [^\s]+ {level} [^\s]+  {content_pattern}$");
    let regex = Regex::new(&pattern).unwrap();
    let file = File::open(log_file).unwrap();
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .any(|line| regex.is_match(&line))
}

pub fn all_log_levels() -> &'static [Level] {
    &[
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
}

pub fn log_at_every_level(message: &str) {
    frame_logger::error!("{}", message);
    frame_logger::warn!("{}", message);
    frame_logger::info!("{}", message);
    frame_logger::debug!("{}", message);
    frame_logger::trace!("{}", message);
}
