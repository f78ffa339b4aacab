use crate::auth::MagicFailurePolicy;
use crate::error::DEFAULT_SUPPORT_CONTACT;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const BACKEND_URL_ENV: &str = "EXEMI_BACKEND_API_URL";
pub const DEFAULT_UNIVERSITY: &str = "swinburne";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: Url,
    /// Named in generic system-error messages.
    pub support_contact: String,
    /// Sent alongside magic material during onboarding.
    pub university_name: String,
    pub magic_failure: MagicFailurePolicy,
    pub store_path: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Exemi not configured: set EXEMI_BACKEND_API_URL or create exemi.yaml.")]
    Missing,
    #[error("Exemi configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                format!("Exemi is not configured. Set {BACKEND_URL_ENV} or create exemi.yaml.")
            }
            Self::Invalid(detail) => format!("Exemi is not configured: {detail}. Update exemi.yaml."),
        }
    }
}

impl ClientConfig {
    pub fn new(backend_url: Url) -> Self {
        Self {
            backend_url,
            support_contact: DEFAULT_SUPPORT_CONTACT.to_string(),
            university_name: DEFAULT_UNIVERSITY.to_string(),
            magic_failure: MagicFailurePolicy::default(),
            store_path: None,
        }
    }

    /// Reads `exemi.yaml` (if any), then lets `EXEMI_BACKEND_API_URL` from the environment
    /// or a `.env` file override the backend URL.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = match locate_config_file() {
            Some(path) => read_config_file(&path)?,
            None => ClientSection::default(),
        };
        resolve_client_settings(section, std::env::var(BACKEND_URL_ENV).ok())
    }
}

fn read_config_file(path: &Path) -> Result<ClientSection, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    let config: ExemiConfig = serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid exemi.yaml: {err}")))?;
    Ok(config.client.unwrap_or_default())
}

fn resolve_client_settings(
    section: ClientSection,
    env_url: Option<String>,
) -> Result<ClientConfig, ConfigError> {
    let raw_url = env_url
        .filter(|value| !value.trim().is_empty())
        .or(section.backend_url)
        .ok_or(ConfigError::Missing)?;
    let backend_url = Url::parse(raw_url.trim()).map_err(|err| {
        ConfigError::Invalid(format!("backend url `{raw_url}` is not a valid URL ({err})"))
    })?;
    if !matches!(backend_url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "backend url `{raw_url}` must use http or https"
        )));
    }

    let mut config = ClientConfig::new(backend_url);
    if let Some(contact) = non_empty(section.support_contact) {
        config.support_contact = contact;
    }
    if let Some(university) = non_empty(section.university_name) {
        config.university_name = university;
    }
    if let Some(policy) = section.magic_failure {
        config.magic_failure = policy;
    }
    config.store_path = section.store_path;
    Ok(config)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn locate_config_file() -> Option<PathBuf> {
    exemi_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn exemi_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("exemi.yaml")];
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("exemi");
        paths.push(config_dir.join("exemi.yaml"));
        paths.push(config_dir.join("exemi.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".exemi").join("exemi.yaml"));
        paths.push(home_dir.join(".exemi").join("exemi.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct ExemiConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    backend_url: Option<String>,
    support_contact: Option<String>,
    university_name: Option<String>,
    magic_failure: Option<MagicFailurePolicy>,
    store_path: Option<PathBuf>,
}
