// =============================================================================
// Fichier : ssh_manager.rs
// Rôle    : Canal d'exécution distant basé sur SSH (russh)
//
// Architecture :
//  - Utilise `russh` directement (pas de wrapper).
//  - `SshClientHandler` vérifie les clés d'hôte (TOFU + known_hosts) sans
//    interaction : clé connue → acceptée ; clé changée → refusée (MITM
//    possible) ; hôte inconnu → accepté et enregistré seulement si
//    `accept_new_hosts`.
//  - Chaque commande s'exécute sur son propre canal `exec` ; stdout/stderr
//    sont découpés en lignes et remontés dans l'ordre.
//
// Sécurité :
//  - Aucun `unwrap()` ni `expect()`.
//  - Toutes les erreurs remontées via `anyhow::Context`.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use russh::client;
use russh::keys::known_hosts::{check_known_hosts, learn_known_hosts};
use russh::keys::{self, HashAlg, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Sig};
use tokio::sync::Mutex;

use super::command::Command;
use super::connection::{
    AuthMethod, ChannelError, ChannelEvent, ExecutionChannel, OutputListener, SessionHandle,
    SessionTarget,
};

// =============================================================================
// Configuration SSH
// =============================================================================

/// Réglages du transport SSH.
#[derive(Debug, Clone)]
pub struct SshChannelOptions {
    /// Délai de connexion TCP (défaut : 10 s).
    pub connect_timeout_secs: u64,
    /// Enregistre la clé d'un hôte inconnu au lieu de refuser.
    pub accept_new_hosts: bool,
}

impl Default for SshChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            accept_new_hosts: false,
        }
    }
}

// =============================================================================
// Handler SSH — vérification des clés d'hôte
// =============================================================================

struct SshClientHandler {
    host: String,
    port: u16,
    accept_new_hosts: bool,
}

impl client::Handler for SshClientHandler {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let key = server_public_key.clone();
        let host = self.host.clone();
        let port = self.port;
        let accept_new_hosts = self.accept_new_hosts;

        async move {
            let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
            let key_type = key.algorithm().to_string();

            match check_known_hosts(&host, port, &key) {
                Ok(true) => {
                    log::info!("SSH: clé connue pour {host}:{port} ({key_type}) — approuvée");
                    Ok(true)
                }

                Err(keys::Error::KeyChanged { line }) => {
                    log::error!(
                        "SSH: AVERTISSEMENT MITM — clé différente ligne {line} \
                         pour {host}:{port} ! fingerprint: {fingerprint} — connexion refusée"
                    );
                    Ok(false)
                }

                Ok(false) | Err(_) if accept_new_hosts => {
                    log::warn!("SSH: hôte inconnu {host}:{port} ({key_type} {fingerprint}) — accepté");
                    if let Err(e) = learn_known_hosts(&host, port, &key) {
                        log::warn!("SSH: impossible d'enregistrer la clé dans known_hosts : {e}");
                    } else {
                        log::info!("SSH: clé de {host}:{port} ajoutée à ~/.ssh/known_hosts");
                    }
                    Ok(true)
                }

                Ok(false) | Err(_) => {
                    log::error!(
                        "SSH: hôte inconnu {host}:{port} ({key_type} {fingerprint}) — refusé \
                         (activer `accept_new_hosts` pour l'enregistrer)"
                    );
                    Ok(false)
                }
            }
        }
    }
}

// =============================================================================
// Canal d'exécution SSH
// =============================================================================

struct LiveSession {
    key: String,
    handle: Arc<client::Handle<SshClientHandler>>,
    events: async_channel::Sender<ChannelEvent>,
}

/// Canal d'exécution implémentant `ExecutionChannel` sur SSH.
pub struct SshExecutionChannel {
    options: SshChannelOptions,
    sessions: Mutex<HashMap<u32, LiveSession>>,
    next_id: AtomicU32,
}

impl SshExecutionChannel {
    pub fn new(options: SshChannelOptions) -> Self {
        Self {
            options,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Connexion TCP + protocole SSH + authentification.
    async fn open(&self, target: &SessionTarget) -> Result<client::Handle<SshClientHandler>> {
        let addr = format!("{}:{}", target.host, target.port);
        log::info!("Connexion SSH vers {addr}...");

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..<client::Config as Default>::default()
        });

        let handler = SshClientHandler {
            host: target.host.clone(),
            port: target.port,
            accept_new_hosts: self.options.accept_new_hosts,
        };

        let mut handle = match tokio::time::timeout(
            Duration::from_secs(self.options.connect_timeout_secs + 2),
            client::connect(ssh_config, addr.as_str(), handler),
        )
        .await
        {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => return Err(e).context("Impossible d'établir la connexion SSH"),
            Err(_) => bail!("Timeout de connexion SSH vers {addr}"),
        };

        let auth_result = match &target.auth_method {
            AuthMethod::Password(password) => handle
                .authenticate_password(&target.username, password)
                .await
                .context("Erreur lors de l'authentification par mot de passe")?,

            AuthMethod::KeyFile {
                private_key_path,
                passphrase,
            } => {
                let key = keys::load_secret_key(private_key_path, passphrase.as_deref())
                    .context("Impossible de charger la clé privée SSH")?;
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), Some(HashAlg::Sha256));
                handle
                    .authenticate_publickey(&target.username, key_with_alg)
                    .await
                    .context("Erreur lors de l'authentification par clé publique")?
            }
        };

        if !auth_result.success() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            bail!("Authentification SSH échouée pour {target}");
        }

        Ok(handle)
    }

    async fn live(
        &self,
        session: &SessionHandle,
    ) -> Result<(Arc<client::Handle<SshClientHandler>>, async_channel::Sender<ChannelEvent>), ChannelError>
    {
        let sessions = self.sessions.lock().await;
        match sessions.get(&session.id) {
            Some(live) if live.key == session.key => {
                Ok((Arc::clone(&live.handle), live.events.clone()))
            }
            _ => Err(ChannelError::UnknownSession(session.id)),
        }
    }
}

#[async_trait]
impl ExecutionChannel for SshExecutionChannel {
    async fn connect(
        &self,
        target: &SessionTarget,
        events: async_channel::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        let handle = self.open(target).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = session_key(id);
        self.sessions.lock().await.insert(
            id,
            LiveSession {
                key: key.clone(),
                handle: Arc::new(handle),
                events: events.clone(),
            },
        );
        log::info!("Session SSH {id} ouverte sur {target}");

        if events
            .send(ChannelEvent::SessionStarted(SessionHandle { id, key }))
            .await
            .is_err()
        {
            log::warn!("Contrôleur arrêté avant le démarrage de la session {id}");
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        session: &SessionHandle,
        command: &Command,
        listener: OutputListener,
    ) -> Result<(), ChannelError> {
        let (handle, _) = self.live(session).await?;

        let channel = handle
            .channel_open_session()
            .await
            .context("Impossible d'ouvrir un canal de session SSH")?;
        channel
            .exec(true, command.as_str())
            .await
            .context("Impossible de lancer la commande distante")?;
        log::debug!("Session {} : exec `{command}`", session.id);

        tokio::spawn(stream_output(channel, listener));
        Ok(())
    }

    async fn disconnect(&self, session: &SessionHandle) -> Result<(), ChannelError> {
        let (_, events) = self.live(session).await?;
        let Some(live) = self.sessions.lock().await.remove(&session.id) else {
            return Err(ChannelError::UnknownSession(session.id));
        };

        log::info!("Fermeture de la session SSH {}...", session.id);
        if let Err(e) = live
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            log::warn!("SSH: fermeture incomplète de la session {} : {e}", session.id);
        }

        if events.send(ChannelEvent::SessionFinished).await.is_err() {
            log::debug!("Contrôleur arrêté, fin de session {} non transmise", session.id);
        }
        Ok(())
    }
}

/// Jeton opaque associé à l'identifiant de session.
fn session_key(id: u32) -> String {
    format!("{id:08x}-{:x}", chrono::Utc::now().timestamp_micros())
}

// =============================================================================
// Lecture de la sortie distante
// =============================================================================

/// Relaie la sortie d'une commande ligne par ligne, puis son code de retour.
async fn stream_output(mut channel: russh::Channel<client::Msg>, listener: OutputListener) {
    let mut lines = LineSplitter::default();
    let mut exit_code: Option<i32> = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                for line in lines.push(&data) {
                    listener.output(line).await;
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(i32::try_from(exit_status).unwrap_or(i32::MAX));
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                exit_code = Some(signal_exit_code(&signal_name));
            }
            ChannelMsg::Failure => {
                listener.failed("Exécution refusée par le serveur SSH").await;
                return;
            }
            ChannelMsg::Eof | ChannelMsg::Close => {
                if exit_code.is_some() || matches!(msg, ChannelMsg::Close) {
                    break;
                }
            }
            _ => {}
        }
    }

    if let Some(rest) = lines.finish() {
        listener.output(rest).await;
    }

    let code = exit_code.unwrap_or_else(|| {
        log::warn!("Canal {:?} fermé sans code de retour", listener.role());
        -1
    });
    listener.completed(code).await;
}

/// Code shell d'un processus tué par un signal : 128 + numéro.
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        Sig::Custom(name) => {
            log::warn!("Signal distant non standard : {name}");
            return -1;
        }
    };
    128 + number
}

/// Découpe un flux d'octets en lignes (`\n` ou `\r\n`).
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..pos]));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
