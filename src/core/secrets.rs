// =============================================================================
// Fichier : secrets.rs
// Rôle    : Identifiants SSH du routeur dans le trousseau système
//
// Les secrets ne sont jamais écrits dans settings.json.
// =============================================================================

use std::fmt;

use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "openpyn-remote";

/// Compte SSH auquel les secrets sont rattachés.
#[derive(Debug, Clone, Copy)]
pub struct SshIdentity<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
}

impl fmt::Display for SshIdentity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Entrée du trousseau : mot de passe du compte ou passphrase d'une clé.
enum Secret<'a> {
    Password(SshIdentity<'a>),
    Passphrase(SshIdentity<'a>, &'a str),
}

impl Secret<'_> {
    fn account(&self) -> String {
        match self {
            Self::Password(identity) => format!("ssh-password:{identity}"),
            Self::Passphrase(identity, key_path) => {
                format!("ssh-passphrase:{identity}:{}", key_path.trim())
            }
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account()).context("Trousseau système indisponible")
    }

    fn store(&self, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Ok(());
        }
        self.entry()?
            .set_password(value)
            .context("Impossible d'écrire le secret dans le trousseau")
    }

    /// Lecture tolérante : un trousseau indisponible équivaut à une absence.
    fn fetch(&self) -> Option<String> {
        let entry = self
            .entry()
            .map_err(|e| log::warn!("{e:#}"))
            .ok()?;
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("Lecture du trousseau impossible : {e}");
                None
            }
        }
    }

    fn forget(&self) -> Result<bool> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e).context("Impossible de supprimer le secret du trousseau"),
        }
    }
}

pub fn save_ssh_password(identity: SshIdentity<'_>, password: &str) -> Result<()> {
    Secret::Password(identity).store(password)
}

pub fn load_ssh_password(identity: SshIdentity<'_>) -> Option<String> {
    Secret::Password(identity).fetch()
}

/// Retourne `true` si un mot de passe était enregistré.
pub fn forget_ssh_password(identity: SshIdentity<'_>) -> Result<bool> {
    Secret::Password(identity).forget()
}

pub fn load_ssh_key_passphrase(identity: SshIdentity<'_>, key_path: &str) -> Option<String> {
    if key_path.trim().is_empty() {
        return None;
    }
    Secret::Passphrase(identity, key_path).fetch()
}
