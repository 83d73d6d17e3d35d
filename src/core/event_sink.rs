// =============================================================================
// Fichier : event_sink.rs
// Rôle    : Interface de sortie du contrôleur vers l'interface utilisateur
//
// Le contrôleur ignore comment l'implémentation relaie les appels (thread
// UI, terminal, canal...). Les appels arrivent dans l'ordre d'émission.
// =============================================================================

use super::connection::SessionHandle;
use super::exit_status::ExitOutcome;
use super::log_decoder::{Frame, Severity};

/// Observateur des trames, résultats et étapes de session.
pub trait EventSink: Send + Sync {
    fn spam(&self, message: &str);
    fn debug(&self, message: &str);
    fn verbose(&self, message: &str);
    fn info(&self, message: &str);
    fn notice(&self, message: &str);
    fn warning(&self, message: &str);
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn critical(&self, message: &str);

    /// Résultat classifié du script de connexion.
    fn completion(&self, outcome: &ExitOutcome);

    /// Erreur destinée à l'utilisateur (canal indisponible, échec SSH...).
    fn failure(&self, reason: &str);

    fn on_connect_started(&self) {}
    fn on_disconnect_started(&self) {}
    fn on_session_started(&self, _session: &SessionHandle) {}
    fn on_session_finished(&self) {}
    fn on_session_cancelled(&self) {}
}

/// Transmet une trame à la méthode de sa sévérité.
pub fn dispatch_frame(sink: &dyn EventSink, frame: &Frame) {
    let message = frame.message.as_str();
    match frame.severity {
        Severity::Spam => sink.spam(message),
        Severity::Debug => sink.debug(message),
        Severity::Verbose => sink.verbose(message),
        Severity::Info => sink.info(message),
        Severity::Notice => sink.notice(message),
        Severity::Warning => sink.warning(message),
        Severity::Success => sink.success(message),
        Severity::Error => sink.error(message),
        Severity::Critical => sink.critical(message),
    }
}
