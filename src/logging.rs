use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}";

/// Initialise log4rs from `path`, or a console logger at `info` when the
/// file is missing or invalid.
pub fn init(path: &Path) {
    let from_file = if path.exists() {
        match log4rs::init_file(path, Default::default()) {
            Ok(()) => return,
            Err(e) => Some(e.to_string()),
        }
    } else {
        None
    };

    match console_config() {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("logger already initialised: {}", e);
                return;
            }
        }
        Err(e) => {
            eprintln!("invalid console logging config: {}", e);
            return;
        }
    }
    match from_file {
        Some(err) => log::warn!("Ignoring {}: {}", path.display(), err),
        None => log::info!("{} not found, logging to console", path.display()),
    }
}

fn console_config() -> Result<Config, String> {
    let stdout = ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).build();
    Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_config_builds() {
        assert!(console_config().is_ok());
    }
}
