use std::{fs, path::Path};

use anyhow::Context;
use serde::Deserialize;
use session_core::{controller::DEFAULT_COACH_WINDOW, http::DEFAULT_TARGET_SOURCE_URL};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub target_source_url: String,
    pub judge_url: Option<String>,
    pub judge_api_key: Option<String>,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub sketch_path: Option<String>,
    pub coach_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/trainer.db".into(),
            target_source_url: DEFAULT_TARGET_SOURCE_URL.into(),
            judge_url: None,
            judge_api_key: None,
            user_id: None,
            display_name: None,
            sketch_path: None,
            coach_window: DEFAULT_COACH_WINDOW,
        }
    }
}

pub fn load_settings(path: &Path) -> Settings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// File values override defaults, `APP__*` variables override both.
pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<Settings>(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), "ignoring unreadable settings file: {err}");
            Settings::default()
        }),
        Err(_) => Settings::default(),
    };

    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__TARGET_SOURCE_URL") {
        settings.target_source_url = v;
    }
    if let Some(v) = env("APP__JUDGE_URL") {
        settings.judge_url = Some(v);
    }
    if let Some(v) = env("APP__JUDGE_API_KEY") {
        settings.judge_api_key = Some(v);
    }
    if let Some(v) = env("APP__USER_ID") {
        settings.user_id = Some(v);
    }
    if let Some(v) = env("APP__DISPLAY_NAME") {
        settings.display_name = Some(v);
    }
    if let Some(v) = env("APP__SKETCH_PATH") {
        settings.sketch_path = Some(v);
    }
    if let Some(v) = env("APP__COACH_WINDOW") {
        match v.parse::<usize>() {
            Ok(parsed) if parsed > 0 => settings.coach_window = parsed,
            _ => warn!(value = %v, "ignoring invalid APP__COACH_WINDOW"),
        }
    }

    settings.judge_url = settings.judge_url.filter(|v| !v.trim().is_empty());
    settings.user_id = settings.user_id.filter(|v| !v.trim().is_empty());
    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    if let Some(parent) = sqlite_file(&database_url).and_then(|path| path.parent()) {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for database url '{database_url}'",
                    parent.display()
                )
            })?;
        }
    }
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();
    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite://")
        .or_else(|| raw_database_url.strip_prefix("sqlite:"))
        .unwrap_or(raw_database_url)
        .replace('\\', "/");

    if has_drive_letter(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn sqlite_file(database_url: &str) -> Option<&Path> {
    if database_url.starts_with("sqlite::memory:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| Path::new(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
