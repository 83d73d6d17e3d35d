// =============================================================================
// Fichier : app.rs
// Rôle    : Ligne de commande et boucle de session
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::runtime::Runtime;

use crate::core::connection::{AuthMethod, SessionTarget};
use crate::core::logger;
use crate::core::secrets::{self, SshIdentity};
use crate::core::session_manager::{ManagerOptions, SessionLifecycleManager, SessionState};
use crate::core::settings::{AppSettings, SettingsManager, SshSettings};
use crate::core::ssh_manager::{SshChannelOptions, SshExecutionChannel};
use crate::ui::console::ConsoleSink;

/// Lance openpyn sur un routeur distant et suit la connexion VPN.
///
/// Ctrl-C arrête le VPN proprement (`openpyn --kill`) avant de fermer la
/// session SSH.
#[derive(Debug, Parser)]
#[command(name = "openpyn-remote", version, about)]
pub struct Cli {
    /// Fichier de configuration (défaut : <config>/openpyn-remote/settings.json)
    #[arg(short, long, value_name = "FICHIER")]
    pub config: Option<PathBuf>,

    /// Hôte SSH du routeur
    #[arg(long)]
    pub host: Option<String>,

    /// Port SSH
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Utilisateur SSH
    #[arg(short, long)]
    pub user: Option<String>,

    /// Clé privée (force l'authentification par clé)
    #[arg(short, long, value_name = "CHEMIN")]
    pub key: Option<String>,

    /// Pays choisi pour cette connexion, prioritaire sur la configuration
    #[arg(long)]
    pub country: Option<String>,

    /// Niveau de log (error, warn, info, debug, trace)
    #[arg(long, value_name = "NIVEAU")]
    pub log_level: Option<String>,

    #[arg(long, env = "OPENPYN_REMOTE_PASSWORD", hide = true)]
    pub password: Option<String>,

    /// Enregistre le mot de passe fourni dans le trousseau système
    #[arg(long)]
    pub save_password: bool,

    /// Supprime le mot de passe enregistré puis quitte
    #[arg(long, conflicts_with = "save_password")]
    pub forget_password: bool,

    /// Écrit la configuration effective (options ci-dessus incluses) puis quitte
    #[arg(long, conflicts_with_all = ["save_password", "forget_password"])]
    pub write_config: bool,
}

/// Point d'entrée applicatif.
///
/// `Ok(true)` si la dernière commande s'est terminée normalement ou par
/// SIGTERM.
pub fn run(cli: &Cli) -> Result<bool> {
    let mut config = SettingsManager::load(cli.config.as_deref());
    apply_overrides(cli, config.settings_mut());
    logger::init_logger(&config.settings().log)?;
    log::info!("Démarrage de openpyn-remote v{}", env!("CARGO_PKG_VERSION"));

    if cli.write_config {
        config.save()?;
        println!("Configuration écrite dans {}", config.config_path().display());
        return Ok(true);
    }
    let settings = config.into_settings();

    if cli.forget_password {
        return forget_password(&settings.ssh);
    }

    let runtime = Runtime::new().context("Impossible de créer le runtime tokio")?;
    runtime.block_on(run_session(cli, settings))
}

async fn run_session(cli: &Cli, settings: AppSettings) -> Result<bool> {
    let target = session_target(cli, &settings.ssh)?;

    let channel = Arc::new(SshExecutionChannel::new(SshChannelOptions {
        connect_timeout_secs: settings.ssh.connect_timeout_secs,
        accept_new_hosts: settings.ssh.accept_new_hosts,
    }));
    let sink = Arc::new(ConsoleSink::new());
    let options = ManagerOptions {
        disconnect_grace: Duration::from_millis(settings.session.disconnect_grace_ms),
    };
    let manager = SessionLifecycleManager::new(channel, Arc::new(settings), sink.clone(), options);

    let mut state = manager.subscribe();
    if !manager.connect(target, cli.country.as_deref()) {
        return Ok(false);
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Impossible d'écouter Ctrl-C")?;
                if manager.disconnect() {
                    log::info!("Ctrl-C — arrêt du VPN demandé");
                } else if manager.state() == SessionState::Starting {
                    log::warn!("Ctrl-C pendant l'ouverture de session — abandon");
                    return Ok(false);
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == SessionState::Idle {
                    break;
                }
            }
        }
    }

    let outcome = sink.outcome();
    log::debug!("Fin de session, résultat : {outcome:?}");
    Ok(outcome.is_some_and(|o| o.is_benign()))
}

fn forget_password(ssh: &SshSettings) -> Result<bool> {
    let identity = SshIdentity {
        host: &ssh.host,
        port: ssh.port,
        username: &ssh.username,
    };
    if secrets::forget_ssh_password(identity)? {
        println!("Mot de passe supprimé pour {identity}");
    } else {
        println!("Aucun mot de passe enregistré pour {identity}");
    }
    Ok(true)
}

/// Les options de ligne de commande priment sur `settings.json`.
fn apply_overrides(cli: &Cli, settings: &mut AppSettings) {
    let ssh = &mut settings.ssh;
    if let Some(host) = &cli.host {
        ssh.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        ssh.port = port;
    }
    if let Some(user) = &cli.user {
        ssh.username.clone_from(user);
    }
    if let Some(key) = &cli.key {
        ssh.key_path.clone_from(key);
        ssh.auth_method = "key".to_string();
    }
    if let Some(level) = &cli.log_level {
        settings.log.enabled = true;
        settings.log.level.clone_from(level);
    }
}

/// Cible SSH d'après les paramètres effectifs.
///
/// Le mot de passe vient de `OPENPYN_REMOTE_PASSWORD` ou du trousseau.
fn session_target(cli: &Cli, ssh: &SshSettings) -> Result<SessionTarget> {
    let host = ssh.host.clone();
    let port = ssh.port;
    let username = ssh.username.clone();
    if host.trim().is_empty() {
        bail!("Hôte SSH manquant (--host ou ssh.host)");
    }
    if username.trim().is_empty() {
        bail!("Utilisateur SSH manquant (--user ou ssh.username)");
    }
    let identity = SshIdentity {
        host: &host,
        port,
        username: &username,
    };

    let auth_method = if ssh.auth_method == "key" {
        let key_path = ssh.key_path.clone();
        if key_path.trim().is_empty() {
            bail!("Chemin de clé privée manquant (--key ou ssh.key_path)");
        }
        let passphrase = secrets::load_ssh_key_passphrase(identity, &key_path);
        AuthMethod::KeyFile {
            private_key_path: key_path,
            passphrase,
        }
    } else {
        let password = match &cli.password {
            Some(password) => {
                if cli.save_password {
                    secrets::save_ssh_password(identity, password)?;
                    log::info!("Mot de passe enregistré pour {identity}");
                }
                password.clone()
            }
            None => secrets::load_ssh_password(identity).with_context(|| {
                format!("Aucun mot de passe pour {identity} (OPENPYN_REMOTE_PASSWORD ou trousseau)")
            })?,
        };
        AuthMethod::Password(password)
    };

    Ok(SessionTarget {
        host,
        port,
        username,
        auth_method,
    })
}
