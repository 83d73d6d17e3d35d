// =============================================================================
// Fichier : settings.rs
// Rôle    : Configuration persistante (JSON) et magasin d'options openpyn
// =============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Magasin d'options
// =============================================================================

/// Valeur brute d'une option (booléen, nombre ou texte).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(i64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// Magasin clé → valeur en lecture seule.
///
/// Les accesseurs typés ne lèvent jamais d'erreur : une valeur du mauvais
/// type est traitée comme absente.
pub trait ConfigurationStore: Send + Sync {
    fn value(&self, key: &str) -> Option<OptionValue>;

    fn string(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            OptionValue::Text(text) => Some(text),
            OptionValue::Number(n) => Some(n.to_string()),
            OptionValue::Bool(_) => None,
        }
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        match self.value(key)? {
            OptionValue::Bool(b) => Some(b),
            OptionValue::Number(0) => Some(false),
            OptionValue::Number(1) => Some(true),
            OptionValue::Number(_) => None,
            OptionValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }
}

impl ConfigurationStore for BTreeMap<String, OptionValue> {
    fn value(&self, key: &str) -> Option<OptionValue> {
        self.get(key).cloned()
    }
}

// =============================================================================
// Structures de configuration
// =============================================================================

/// Configuration complète de l'application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub ssh: SshSettings,
    pub session: SessionSettings,
    pub log: LogSettings,
    /// Options openpyn (`pref_*`), lues à chaque connexion.
    pub options: BTreeMap<String, OptionValue>,
}

impl ConfigurationStore for AppSettings {
    fn value(&self, key: &str) -> Option<OptionValue> {
        self.options.value(key)
    }
}

/// Paramètres de connexion SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: String, // "password" | "key"
    pub key_path: String,
    /// Accepte et enregistre la clé d'un hôte inconnu (TOFU).
    pub accept_new_hosts: bool,
    pub connect_timeout_secs: u64,
}

/// Paramètres du cycle de session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Délai laissé au script pour s'arrêter après `openpyn --kill`.
    pub disconnect_grace_ms: u64,
}

/// Paramètres de logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub enabled: bool,
    pub level: String,
    pub log_to_file: bool,
    pub log_directory: String,
}

// =============================================================================
// Implémentations par défaut
// =============================================================================

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.1".to_string(),
            port: 22,
            username: String::new(),
            auth_method: "password".to_string(),
            key_path: String::new(),
            accept_new_hosts: false,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 5000,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "INFO".to_string(),
            log_to_file: false,
            log_directory: "logs".to_string(),
        }
    }
}

// =============================================================================
// Gestionnaire de configuration
// =============================================================================

/// Gestionnaire de configuration avec chargement/sauvegarde JSON.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings: AppSettings,
    config_path: PathBuf,
}

impl SettingsManager {
    /// Charge depuis `path`, ou depuis le chemin par défaut.
    ///
    /// Un fichier absent ou invalide donne la configuration par défaut.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path.map_or_else(Self::default_config_path, Path::to_path_buf);
        let settings = match Self::load_from_path(&config_path) {
            Ok(settings) => settings,
            Err(e) => {
                log::debug!("Configuration par défaut utilisée : {e:#}");
                AppSettings::default()
            }
        };
        Self {
            settings,
            config_path,
        }
    }

    /// Chemin par défaut du fichier de configuration.
    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openpyn-remote")
            .join("settings.json")
    }

    /// Charge la configuration depuis un fichier JSON.
    fn load_from_path(path: &Path) -> Result<AppSettings> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Impossible de lire {}", path.display()))?;
        let settings: AppSettings =
            serde_json::from_str(&content).context("Format JSON invalide")?;
        log::info!("Configuration chargée depuis {}", path.display());
        Ok(settings)
    }

    /// Sauvegarde la configuration dans le fichier JSON.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Impossible de créer {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(&self.settings).context("Erreur de sérialisation JSON")?;
        fs::write(&self.config_path, json)
            .with_context(|| format!("Impossible d'écrire {}", self.config_path.display()))?;
        log::info!(
            "Configuration sauvegardée dans {}",
            self.config_path.display()
        );
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Accès en lecture aux paramètres.
    pub const fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Accès en écriture aux paramètres.
    pub fn settings_mut(&mut self) -> &mut AppSettings {
        &mut self.settings
    }

    pub fn into_settings(self) -> AppSettings {
        self.settings
    }
}
