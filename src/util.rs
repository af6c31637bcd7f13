use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

pub const HOST: &str = "HOST";
pub const PORT: &str = "PORT";

pub const VAR_CONFIG_PATH: &str = "CONFIG_PATH";
pub const VAR_DATA_DIR: &str = "DATA_DIR";
pub const VAR_LOG_CONFIG_PATH: &str = "LOG_CONFIG_PATH";
pub const VAR_GCM_ENDPOINT: &str = "GCM_ENDPOINT";
pub const VAR_FEEDBACK_INTERVAL_S: &str = "FEEDBACK_INTERVAL_S";

const SHORT_TOKEN_LEN: usize = 8;

/// Last few characters of a token, enough to tell devices apart in logs.
pub fn get_short_token(token: &str) -> &str {
    match token.char_indices().rev().nth(SHORT_TOKEN_LEN - 1) {
        Some((idx, _)) => &token[idx..],
        None => token,
    }
}

/// Loads log4rs from `path`, falling back to plain console output.
pub fn init_logging(path: &str) {
    if let Err(e) = log4rs::init_file(path, Default::default()) {
        eprintln!("Could not load log config {path} ({e}), logging to console");

        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}")))
            .build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));

        match config {
            Ok(config) => {
                if let Err(e) = log4rs::init_config(config) {
                    eprintln!("Failed to install console logger: {e}");
                }
            }
            Err(e) => eprintln!("Invalid console log config: {e}"),
        }
    }
}
