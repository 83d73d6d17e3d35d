// =============================================================================
// Fichier : connection.rs
// Rôle    : Abstraction du canal d'exécution distant (session SSH)
//
// Principe :
//   - Le contrôleur de session ne connaît pas le transport ; il pilote un
//     `ExecutionChannel` injecté.
//   - Le canal remonte ses notifications via `async_channel`, dans l'ordre.
// =============================================================================

use async_trait::async_trait;
use thiserror::Error;

use super::command::Command;

/// Hôte distant sur lequel ouvrir une session.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
}

/// Méthode d'authentification auprès de l'hôte distant.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    KeyFile {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

// Les secrets ne doivent jamais apparaître dans les logs.
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password([REDACTED])"),
            Self::KeyFile {
                private_key_path, ..
            } => f
                .debug_struct("KeyFile")
                .field("private_key_path", private_key_path)
                .finish_non_exhaustive(),
        }
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Identifiant d'une session ouverte, délivré par le canal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: u32,
    pub key: String,
}

/// Commande à l'origine d'une sortie ou d'un code de retour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRole {
    Connect,
    Disconnect,
}

/// Notifications envoyées par le canal vers le contrôleur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    SessionStarted(SessionHandle),
    /// Ouverture abandonnée avant que la session ne démarre.
    SessionCancelled,
    SessionFinished,
    Output { role: CommandRole, text: String },
    CommandCompleted { role: CommandRole, exit_code: i32 },
    CommandError { role: CommandRole, reason: String },
}

/// Erreurs du canal d'exécution.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Le service d'exécution distant n'est pas connecté")]
    NotConnected,
    #[error("Session inconnue : {0}")]
    UnknownSession(u32),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Récepteur de la sortie d'une commande distante.
///
/// Chaque événement porte le rôle de la commande qui l'a produit.
#[derive(Debug, Clone)]
pub struct OutputListener {
    role: CommandRole,
    events: async_channel::Sender<ChannelEvent>,
}

impl OutputListener {
    pub const fn new(role: CommandRole, events: async_channel::Sender<ChannelEvent>) -> Self {
        Self { role, events }
    }

    pub const fn role(&self) -> CommandRole {
        self.role
    }

    pub async fn output(&self, text: impl Into<String>) {
        self.send(ChannelEvent::Output {
            role: self.role,
            text: text.into(),
        })
        .await;
    }

    pub async fn completed(&self, exit_code: i32) {
        self.send(ChannelEvent::CommandCompleted {
            role: self.role,
            exit_code,
        })
        .await;
    }

    pub async fn failed(&self, reason: impl Into<String>) {
        self.send(ChannelEvent::CommandError {
            role: self.role,
            reason: reason.into(),
        })
        .await;
    }

    async fn send(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Contrôleur arrêté, sortie {:?} ignorée", self.role);
        }
    }
}

/// Canal d'exécution de commandes sur un hôte distant.
///
/// `connect` signale le démarrage par `ChannelEvent::SessionStarted` sur
/// `events` ; `disconnect` se termine par `ChannelEvent::SessionFinished`.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// `false` si le service sous-jacent est indisponible.
    fn is_available(&self) -> bool {
        true
    }

    async fn connect(
        &self,
        target: &SessionTarget,
        events: async_channel::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError>;

    /// Lance `command` ; la sortie et le code de retour arrivent par
    /// `listener`.
    async fn execute_command(
        &self,
        session: &SessionHandle,
        command: &Command,
        listener: OutputListener,
    ) -> Result<(), ChannelError>;

    async fn disconnect(&self, session: &SessionHandle) -> Result<(), ChannelError>;
}
