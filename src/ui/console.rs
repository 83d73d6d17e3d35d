// =============================================================================
// Fichier : console.rs
// Rôle    : Affichage terminal des trames et résultats de session
// =============================================================================

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use colored::{ColoredString, Colorize};

use crate::core::connection::SessionHandle;
use crate::core::event_sink::EventSink;
use crate::core::exit_status::ExitOutcome;
use crate::core::log_decoder::Severity;

/// Sink écrivant sur la sortie standard, une ligne par trame.
///
/// Retient le dernier résultat pour le code de sortie du programme.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    outcome: Mutex<Option<ExitOutcome>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn print(&self, severity: Severity, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.line(&format!("{} {message}", badge(severity)));
    }

    fn line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        // Sortie fermée (pipe) : rien à faire de plus.
        let _ = writeln!(out, "{text}");
    }
}

fn badge(severity: Severity) -> ColoredString {
    let label = format!("[{:<8}]", severity.label());
    match severity {
        Severity::Spam | Severity::Debug | Severity::Verbose => label.dimmed(),
        Severity::Info => label.normal(),
        Severity::Notice => label.cyan(),
        Severity::Warning => label.yellow(),
        Severity::Success => label.green().bold(),
        Severity::Error => label.red(),
        Severity::Critical => label.red().bold(),
    }
}

impl EventSink for ConsoleSink {
    fn spam(&self, message: &str) {
        self.print(Severity::Spam, message);
    }
    fn debug(&self, message: &str) {
        self.print(Severity::Debug, message);
    }
    fn verbose(&self, message: &str) {
        self.print(Severity::Verbose, message);
    }
    fn info(&self, message: &str) {
        self.print(Severity::Info, message);
    }
    fn notice(&self, message: &str) {
        self.print(Severity::Notice, message);
    }
    fn warning(&self, message: &str) {
        self.print(Severity::Warning, message);
    }
    fn success(&self, message: &str) {
        self.print(Severity::Success, message);
    }
    fn error(&self, message: &str) {
        self.print(Severity::Error, message);
    }
    fn critical(&self, message: &str) {
        self.print(Severity::Critical, message);
    }

    fn completion(&self, outcome: &ExitOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(*outcome);
        self.print(outcome.severity(), &outcome.to_string());
    }

    fn failure(&self, reason: &str) {
        self.line(&format!("{} {reason}", "Erreur :".red().bold()));
    }

    fn on_connect_started(&self) {
        self.line(&"▶ Connexion au serveur VPN...".cyan().to_string());
    }

    fn on_disconnect_started(&self) {
        self.line(&"■ Arrêt du VPN en cours...".yellow().to_string());
    }

    fn on_session_started(&self, session: &SessionHandle) {
        self.line(&format!("Session {} ouverte", session.id).dimmed().to_string());
    }

    fn on_session_finished(&self) {
        self.line(&"Session fermée".dimmed().to_string());
    }

    fn on_session_cancelled(&self) {
        self.line(&"Ouverture de session annulée".yellow().to_string());
    }
}
