// =============================================================================
// Fichier : logger.rs
// Rôle    : Initialisation du logging applicatif (stderr ou fichier)
// =============================================================================

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;

use super::settings::LogSettings;

const LOG_FILE: &str = "openpyn-remote.log";

/// Niveau effectif. Un niveau illisible retombe sur `Info`.
fn effective_level(settings: &LogSettings) -> LevelFilter {
    if !settings.enabled {
        return LevelFilter::Off;
    }
    LevelFilter::from_str(settings.level.trim()).unwrap_or(LevelFilter::Info)
}

/// Initialise le logger.
///
/// Format : `[YYYY-MM-DD HH:MM:SS] LEVEL module - message`
pub fn init_logger(settings: &LogSettings) -> Result<()> {
    let level = effective_level(settings);

    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .format(|buf, record| {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let level = record.level();
            let target = record.target();
            writeln!(buf, "[{timestamp}] {level:<5} {target} - {}", record.args())
        });

    if settings.log_to_file && level != LevelFilter::Off {
        let dir = Path::new(&settings.log_directory);
        fs::create_dir_all(dir)
            .with_context(|| format!("Impossible de créer {}", dir.display()))?;
        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Impossible d'ouvrir {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .context("Logger déjà initialisé")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(enabled: bool, level: &str) -> LevelFilter {
        effective_level(&LogSettings {
            enabled,
            level: level.to_string(),
            ..LogSettings::default()
        })
    }

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(level(true, "INFO"), LevelFilter::Info);
        assert_eq!(level(true, " debug "), LevelFilter::Debug);
        assert_eq!(level(true, "bogus"), LevelFilter::Info);
    }

    #[test]
    fn disabled_logging_is_off() {
        assert_eq!(level(false, "trace"), LevelFilter::Off);
    }
}
