//! Application configuration: a single JSON file loaded once at startup and
//! passed by reference into every component. No ambient lookup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub organization: String,
    pub keywords: Vec<String>,
    pub database: DatabaseSettings,
    pub smtp: SmtpSettings,
    pub notification: NotificationSettings,
    /// Absent means enrichment is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAiSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    /// STARTTLS upgrade after a plain connect.
    #[serde(default)]
    pub use_tls: bool,
    /// Implicit TLS (connect-then-encrypt, typically port 465). Wins over
    /// `use_tls` when both are set.
    #[serde(default)]
    pub use_ssl: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub from_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub to_emails: Vec<String>,
    pub subject: String,
    #[serde(default = "default_max_items_per_mail")]
    pub max_items_per_mail: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

fn default_max_items_per_mail() -> usize {
    50
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file `{path}` was not found; a default template was written there for editing")]
    MissingConfigFile { path: PathBuf },
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("could not write default config template `{path}`: {source}")]
    WriteTemplate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Load and validate the configuration. A missing file is fatal: a
    /// default template is written to `path` for the operator to edit and
    /// the error still propagates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            Self::write_default_template(path)?;
            return Err(ConfigError::MissingConfigFile {
                path: path.to_path_buf(),
            });
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.organization.trim().is_empty() {
            return Err(ConfigError::Invalid("organization must not be empty".into()));
        }
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "at least one non-empty keyword is required".into(),
            ));
        }
        if self.smtp.server.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.server must not be empty".into()));
        }
        if self.notification.to_emails.is_empty() {
            return Err(ConfigError::Invalid(
                "notification.to_emails must list at least one recipient".into(),
            ));
        }
        if self.notification.max_items_per_mail == 0 {
            return Err(ConfigError::Invalid(
                "notification.max_items_per_mail must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_template() -> Self {
        Self {
            organization: "Ministry of Example".to_string(),
            keywords: vec![
                "security".to_string(),
                "system".to_string(),
                "research".to_string(),
            ],
            database: DatabaseSettings {
                path: "notices.db".to_string(),
            },
            smtp: SmtpSettings {
                server: "smtp.example.com".to_string(),
                port: 587,
                use_tls: true,
                use_ssl: false,
                username: "your_email@example.com".to_string(),
                password: "your_password".to_string(),
            },
            notification: NotificationSettings {
                from_email: "your_email@example.com".to_string(),
                from_name: Some("Tenderwatch".to_string()),
                to_emails: vec!["recipient@example.com".to_string()],
                subject: "[Tenderwatch] new procurement notices".to_string(),
                max_items_per_mail: default_max_items_per_mail(),
            },
            openai: Some(OpenAiSettings {
                api_key: String::new(),
                model: default_openai_model(),
            }),
        }
    }

    fn write_default_template(path: &Path) -> Result<(), ConfigError> {
        let template = Self::default_template();
        let json = serde_json::to_string_pretty(&template)
            .expect("default template always serializes");
        fs::write(path, json).map_err(|source| ConfigError::WriteTemplate {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default_template();
        config.openai = None;
        config
    }

    #[test]
    fn missing_file_writes_template_and_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let err = AppConfig::load(&path).expect_err("missing config must be fatal");
        assert!(matches!(err, ConfigError::MissingConfigFile { .. }));
        assert!(path.exists(), "template must be written for the operator");

        // The written template parses back but is only a starting point.
        let text = fs::read_to_string(&path).expect("read template");
        let parsed: AppConfig = serde_json::from_str(&text).expect("template parses");
        assert_eq!(parsed.notification.max_items_per_mail, 50);
    }

    #[test]
    fn load_round_trips_a_valid_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, serde_json::to_string(&valid_config()).unwrap()).unwrap();

        let loaded = AppConfig::load(&path).expect("load");
        assert_eq!(loaded, valid_config());
        assert!(loaded.openai.is_none());
    }

    #[test]
    fn max_items_defaults_when_omitted() {
        let text = r#"{
            "organization": "Ministry of Example",
            "keywords": ["security"],
            "database": {"path": "notices.db"},
            "smtp": {"server": "smtp.example.com", "port": 587,
                     "username": "u", "password": "p"},
            "notification": {"from_email": "a@example.com",
                             "to_emails": ["b@example.com"],
                             "subject": "s"}
        }"#;
        let config: AppConfig = serde_json::from_str(text).expect("parse");
        assert_eq!(config.notification.max_items_per_mail, 50);
        assert!(!config.smtp.use_tls);
        assert!(!config.smtp.use_ssl);
        config.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_empty_organization_and_keywords() {
        let mut config = valid_config();
        config.organization = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = valid_config();
        config.keywords = vec![String::new()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validation_rejects_zero_item_cap_and_no_recipients() {
        let mut config = valid_config();
        config.notification.max_items_per_mail = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.notification.to_emails.clear();
        assert!(config.validate().is_err());
    }
}
