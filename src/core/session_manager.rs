// =============================================================================
// Fichier : session_manager.rs
// Rôle    : Cycle de vie de l'unique session distante
//
// Machine à états :
//   Idle ──connect──▶ Starting ──started──▶ Connected ──disconnect──▶ Stopping
//     ▲                  │                      │                       │
//     └──── cancelled ───┘                      └── script terminé ─────┤
//     └──────────────────────────── finished ──────────────────────────┘
//
// Architecture :
//   - Le canal d'exécution, le magasin d'options et le sink sont injectés.
//   - Une tâche tokio (pompe) draine les `ChannelEvent` un par un : la
//     sortie distante est décodée dans l'ordre, sans appels concurrents.
//   - Le tampon de log appartient à la session active et disparaît avec elle.
//   - Les appels au sink se font verrou relâché.
// =============================================================================

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::command::{build_connect_command, build_disconnect_command, Command, Configuration};
use super::connection::{
    ChannelError, ChannelEvent, CommandRole, ExecutionChannel, OutputListener, SessionHandle,
    SessionTarget,
};
use super::event_sink::{dispatch_frame, EventSink};
use super::exit_status::classify;
use super::log_decoder::{detect_lifecycle_hints, LifecycleHint, LogFrameDecoder, LogThreshold};
use super::settings::ConfigurationStore;

/// File d'attente canal → contrôleur (backpressure si le sink est lent).
const EVENT_QUEUE: usize = 128;

/// État public de la session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Connected,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Inactive"),
            Self::Starting => write!(f, "Démarrage..."),
            Self::Connected => write!(f, "Connectée"),
            Self::Stopping => write!(f, "Arrêt..."),
        }
    }
}

/// Réglages du contrôleur.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Attente entre `openpyn --kill` et la fermeture forcée de la session.
    pub disconnect_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(5),
        }
    }
}

struct ActiveSession {
    handle: SessionHandle,
    decoder: LogFrameDecoder,
    threshold: LogThreshold,
}

enum Phase {
    Idle,
    Starting {
        command: Command,
        threshold: LogThreshold,
    },
    Connected(ActiveSession),
    Stopping {
        session: ActiveSession,
        teardown: AbortHandle,
    },
}

impl Phase {
    const fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Starting { .. } => SessionState::Starting,
            Self::Connected(_) => SessionState::Connected,
            Self::Stopping { .. } => SessionState::Stopping,
        }
    }

    fn take_connected(&mut self) -> Option<ActiveSession> {
        match mem::replace(self, Self::Idle) {
            Self::Connected(session) => Some(session),
            other => {
                *self = other;
                None
            }
        }
    }
}

struct Shared {
    channel: Arc<dyn ExecutionChannel>,
    store: Arc<dyn ConfigurationStore>,
    sink: Arc<dyn EventSink>,
    options: ManagerOptions,
    phase: Mutex<Phase>,
    state_tx: watch::Sender<SessionState>,
    events_tx: async_channel::Sender<ChannelEvent>,
}

/// Contrôleur de la session distante unique.
///
/// Doit être créé dans un contexte tokio.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    shared: Arc<Shared>,
}

impl SessionLifecycleManager {
    pub fn new(
        channel: Arc<dyn ExecutionChannel>,
        store: Arc<dyn ConfigurationStore>,
        sink: Arc<dyn EventSink>,
        options: ManagerOptions,
    ) -> Self {
        let (events_tx, events_rx) = async_channel::bounded(EVENT_QUEUE);
        let (state_tx, _) = watch::channel(SessionState::Idle);

        let shared = Arc::new(Shared {
            channel,
            store,
            sink,
            options,
            phase: Mutex::new(Phase::Idle),
            state_tx,
            events_tx,
        });
        spawn_event_pump(Arc::downgrade(&shared), events_rx);

        Self { shared }
    }

    pub fn state(&self) -> SessionState {
        self.phase().state()
    }

    /// Suit les transitions d'état.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    // =========================================================================
    // Commandes
    // =========================================================================

    /// Ouvre une session et y lance le script de connexion.
    ///
    /// Retourne `false` (sans effet) si une session est déjà en cours ou si
    /// le canal est indisponible.
    pub fn connect(&self, target: SessionTarget, selected_location: Option<&str>) -> bool {
        let mut phase = self.phase();
        if !matches!(*phase, Phase::Idle) {
            log::warn!("Connexion ignorée : session {}", phase.state());
            return false;
        }

        if !self.shared.channel.is_available() {
            drop(phase);
            let error = ChannelError::NotConnected;
            log::error!("{error}");
            self.shared.sink.failure(&error.to_string());
            return false;
        }

        let configuration = Configuration::from_store(self.shared.store.as_ref());
        let command = build_connect_command(&configuration, selected_location);
        self.transition(
            &mut phase,
            Phase::Starting {
                command,
                threshold: configuration.log_threshold,
            },
        );
        drop(phase);

        log::info!("Ouverture d'une session vers {target}...");
        let manager = self.clone();
        tokio::spawn(async move {
            let events = manager.shared.events_tx.clone();
            if let Err(e) = manager.shared.channel.connect(&target, events).await {
                log::error!("Impossible d'ouvrir la session vers {target} : {e:#}");
                manager.abort_start();
                manager.shared.sink.failure(&e.to_string());
            }
        });
        true
    }

    /// Arrête le script puis ferme la session après le délai de grâce.
    ///
    /// Sans effet hors de l'état `Connected`.
    pub fn disconnect(&self) -> bool {
        let mut phase = self.phase();
        let Some(session) = phase.take_connected() else {
            log::debug!("Déconnexion ignorée : session {}", phase.state());
            return false;
        };

        log::info!("Arrêt de la session {}...", session.handle.id);
        let teardown = tokio::spawn(self.clone().tear_down(session.handle.clone())).abort_handle();
        self.transition(&mut phase, Phase::Stopping { session, teardown });
        true
    }

    // =========================================================================
    // Notifications du canal
    // =========================================================================

    pub fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::SessionStarted(handle) => self.on_session_started(handle),
            ChannelEvent::SessionCancelled => self.on_session_cancelled(),
            ChannelEvent::SessionFinished => self.on_session_finished(),
            ChannelEvent::Output { role, text } => self.on_output(role, &text),
            ChannelEvent::CommandCompleted { role, exit_code } => {
                self.on_command_completed(role, exit_code);
            }
            ChannelEvent::CommandError { role, reason } => self.on_command_error(role, &reason),
        }
    }

    pub fn on_session_started(&self, handle: SessionHandle) {
        let mut phase = self.phase();
        let (command, threshold) = match mem::replace(&mut *phase, Phase::Idle) {
            Phase::Starting { command, threshold } => (command, threshold),
            other => {
                *phase = other;
                log::warn!(
                    "Session {} démarrée hors séquence (état : {}) — ignorée",
                    handle.id,
                    phase.state()
                );
                return;
            }
        };
        let session = ActiveSession {
            handle: handle.clone(),
            decoder: LogFrameDecoder::new(),
            threshold,
        };
        self.transition(&mut phase, Phase::Connected(session));
        drop(phase);

        log::info!("Session {} ouverte", handle.id);
        self.shared.sink.on_session_started(&handle);

        let manager = self.clone();
        tokio::spawn(async move {
            let listener = OutputListener::new(CommandRole::Connect, manager.shared.events_tx.clone());
            match manager
                .shared
                .channel
                .execute_command(&handle, &command, listener)
                .await
            {
                Ok(()) => {}
                Err(ChannelError::NotConnected) => {
                    let error = ChannelError::NotConnected;
                    log::error!("Impossible de lancer openpyn : {error}");
                    manager.shared.sink.failure(&error.to_string());
                }
                Err(e) => {
                    log::error!("Impossible de lancer openpyn : {e:#}");
                    manager.shared.sink.failure(&e.to_string());
                    manager.release_finished_session();
                }
            }
        });
    }

    pub fn on_session_cancelled(&self) {
        let mut phase = self.phase();
        if !matches!(*phase, Phase::Starting { .. }) {
            log::debug!("Annulation ignorée : session {}", phase.state());
            return;
        }
        self.transition(&mut phase, Phase::Idle);
        drop(phase);

        log::info!("Ouverture de session annulée");
        self.shared.sink.on_session_cancelled();
    }

    pub fn on_session_finished(&self) {
        let mut phase = self.phase();
        let previous = mem::replace(&mut *phase, Phase::Idle);
        if matches!(previous, Phase::Idle) {
            log::debug!("Fin de session sans session active");
            return;
        }
        self.transition(&mut phase, Phase::Idle);
        drop(phase);

        let session = match previous {
            Phase::Stopping { session, teardown } => {
                teardown.abort();
                Some(session)
            }
            Phase::Connected(session) => Some(session),
            Phase::Idle | Phase::Starting { .. } => None,
        };
        if let Some(session) = session {
            let pending = session.decoder.pending();
            if !pending.trim().is_empty() {
                log::warn!("Sortie sans marqueur de sévérité abandonnée : {pending:?}");
            }
            log::info!("Session {} terminée", session.handle.id);
        }
        self.shared.sink.on_session_finished();
    }

    /// Décode un morceau de sortie et transmet les trames au sink.
    pub fn on_output(&self, role: CommandRole, text: &str) {
        log::debug!("[{role:?}] {text}");

        let frames = {
            let mut phase = self.phase();
            match &mut *phase {
                Phase::Connected(session) | Phase::Stopping { session, .. } => {
                    let threshold = session.threshold;
                    session
                        .decoder
                        .feed(text)
                        .into_iter()
                        .filter(|frame| threshold.forwards(frame.severity))
                        .collect::<Vec<_>>()
                }
                Phase::Idle | Phase::Starting { .. } => {
                    log::debug!("Sortie hors session ignorée");
                    return;
                }
            }
        };

        let sink = self.shared.sink.as_ref();
        for hint in detect_lifecycle_hints(text) {
            match hint {
                LifecycleHint::ConnectStarted => sink.on_connect_started(),
                LifecycleHint::DisconnectStarted => sink.on_disconnect_started(),
            }
        }
        for frame in &frames {
            dispatch_frame(sink, frame);
        }
    }

    pub fn on_command_completed(&self, role: CommandRole, exit_code: i32) {
        match role {
            CommandRole::Disconnect => {
                log::info!("Commande d'arrêt terminée (code {exit_code})");
            }
            CommandRole::Connect => {
                let state = self.state();
                if !matches!(state, SessionState::Connected | SessionState::Stopping) {
                    log::debug!("Code {exit_code} d'openpyn ignoré : session {state}");
                    return;
                }
                let outcome = classify(exit_code);
                if outcome.is_benign() {
                    log::info!("openpyn terminé : {outcome} (code {exit_code})");
                } else {
                    log::error!("openpyn terminé : {outcome} (code {exit_code})");
                }
                self.shared.sink.completion(&outcome);
                self.release_finished_session();
            }
        }
    }

    /// Un script de connexion qui n'a pas pu tourner libère la session.
    pub fn on_command_error(&self, role: CommandRole, reason: &str) {
        log::error!("Erreur de la commande {role:?} : {reason}");
        self.shared.sink.failure(reason);
        if role == CommandRole::Connect {
            self.release_finished_session();
        }
    }

    // =========================================================================
    // Interne
    // =========================================================================

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.shared
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, phase: &mut Phase, next: Phase) {
        *phase = next;
        let to = phase.state();
        let from = self.shared.state_tx.send_replace(to);
        if from != to {
            log::debug!("Session : {from} → {to}");
        }
    }

    /// Annule un démarrage refusé par le canal : retour à `Idle`.
    fn abort_start(&self) {
        let mut phase = self.phase();
        if matches!(*phase, Phase::Starting { .. }) {
            self.transition(&mut phase, Phase::Idle);
        }
    }

    /// Le script de connexion est terminé : la session n'a plus d'usage.
    fn release_finished_session(&self) {
        let mut phase = self.phase();
        let Some(session) = phase.take_connected() else {
            return;
        };

        let manager = self.clone();
        let handle = session.handle.clone();
        let teardown = tokio::spawn(async move { manager.close_session(&handle).await }).abort_handle();
        self.transition(&mut phase, Phase::Stopping { session, teardown });
    }

    async fn tear_down(self, session: SessionHandle) {
        let kill = build_disconnect_command();
        let listener = OutputListener::new(CommandRole::Disconnect, self.shared.events_tx.clone());
        match self
            .shared
            .channel
            .execute_command(&session, &kill, listener)
            .await
        {
            Ok(()) => {}
            Err(ChannelError::NotConnected) => {
                let error = ChannelError::NotConnected;
                log::error!("{error} — session {} conservée", session.id);
                self.restore_connected();
                self.shared.sink.failure(&error.to_string());
                return;
            }
            Err(e) => log::warn!("Échec de `{kill}` : {e:#} — fermeture forcée"),
        }

        tokio::time::sleep(self.shared.options.disconnect_grace).await;
        self.close_session(&session).await;
    }

    async fn close_session(&self, session: &SessionHandle) {
        if let Err(e) = self.shared.channel.disconnect(session).await {
            log::error!("Impossible de fermer la session {} : {e:#}", session.id);
            self.shared.sink.failure(&e.to_string());
            // Aucune fin de session n'arrivera : la session est abandonnée.
            self.on_session_finished();
        }
    }

    fn restore_connected(&self) {
        let mut phase = self.phase();
        if let Phase::Stopping { .. } = *phase {
            if let Phase::Stopping { session, .. } = mem::replace(&mut *phase, Phase::Idle) {
                self.transition(&mut phase, Phase::Connected(session));
            }
        }
    }
}

/// Draine les notifications du canal, une à la fois.
///
/// La pompe ne garde qu'une référence faible : elle s'arrête avec le
/// contrôleur.
fn spawn_event_pump(shared: Weak<Shared>, events: async_channel::Receiver<ChannelEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            SessionLifecycleManager { shared }.handle_event(event);
        }
        log::debug!("Pompe d'événements du contrôleur arrêtée");
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::core::command::keys;
    use crate::core::connection::AuthMethod;
    use crate::core::exit_status::{ExitOutcome, Signal};
    use crate::core::log_decoder::Severity;
    use crate::core::settings::OptionValue;

    // ── Canal factice ────────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(String),
        Execute(u32, String, CommandRole),
        Disconnect(u32),
    }

    #[derive(Default)]
    struct FakeChannel {
        unavailable: AtomicBool,
        hold_start: AtomicBool,
        refuse_connect: AtomicBool,
        kill_not_connected: AtomicBool,
        fail_script: AtomicBool,
        fail_disconnect: AtomicBool,
        calls: Mutex<Vec<Call>>,
        events: Mutex<Option<async_channel::Sender<ChannelEvent>>>,
    }

    impl FakeChannel {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        async fn emit(&self, event: ChannelEvent) {
            let events = self.events.lock().unwrap().clone();
            events.expect("connect not called").send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl ExecutionChannel for FakeChannel {
        fn is_available(&self) -> bool {
            !self.unavailable.load(Ordering::SeqCst)
        }

        async fn connect(
            &self,
            target: &SessionTarget,
            events: async_channel::Sender<ChannelEvent>,
        ) -> Result<(), ChannelError> {
            self.record(Call::Connect(target.host.clone()));
            if self.refuse_connect.load(Ordering::SeqCst) {
                return Err(ChannelError::NotConnected);
            }
            *self.events.lock().unwrap() = Some(events.clone());
            if !self.hold_start.load(Ordering::SeqCst) {
                let handle = SessionHandle {
                    id: 1,
                    key: "key-1".to_string(),
                };
                events.send(ChannelEvent::SessionStarted(handle)).await.unwrap();
            }
            Ok(())
        }

        async fn execute_command(
            &self,
            session: &SessionHandle,
            command: &Command,
            listener: OutputListener,
        ) -> Result<(), ChannelError> {
            self.record(Call::Execute(
                session.id,
                command.to_string(),
                listener.role(),
            ));
            if listener.role() == CommandRole::Disconnect
                && self.kill_not_connected.load(Ordering::SeqCst)
            {
                return Err(ChannelError::NotConnected);
            }
            if listener.role() == CommandRole::Connect && self.fail_script.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("channel_open_session refusé").into());
            }
            Ok(())
        }

        async fn disconnect(&self, session: &SessionHandle) -> Result<(), ChannelError> {
            self.record(Call::Disconnect(session.id));
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("fermeture impossible").into());
            }
            self.emit(ChannelEvent::SessionFinished).await;
            Ok(())
        }
    }

    // ── Sink enregistreur ────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Frame(Severity, String),
        Completion(ExitOutcome),
        Failure(String),
        ConnectStarted,
        DisconnectStarted,
        SessionStarted(u32),
        SessionFinished,
        SessionCancelled,
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<Seen>>,
    }

    impl RecordingSink {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn frames(&self) -> Vec<Seen> {
            self.seen()
                .into_iter()
                .filter(|s| matches!(s, Seen::Frame(..)))
                .collect()
        }

        fn push(&self, seen: Seen) {
            self.seen.lock().unwrap().push(seen);
        }

        fn frame(&self, severity: Severity, message: &str) {
            self.push(Seen::Frame(severity, message.to_string()));
        }
    }

    impl EventSink for RecordingSink {
        fn spam(&self, message: &str) {
            self.frame(Severity::Spam, message);
        }
        fn debug(&self, message: &str) {
            self.frame(Severity::Debug, message);
        }
        fn verbose(&self, message: &str) {
            self.frame(Severity::Verbose, message);
        }
        fn info(&self, message: &str) {
            self.frame(Severity::Info, message);
        }
        fn notice(&self, message: &str) {
            self.frame(Severity::Notice, message);
        }
        fn warning(&self, message: &str) {
            self.frame(Severity::Warning, message);
        }
        fn success(&self, message: &str) {
            self.frame(Severity::Success, message);
        }
        fn error(&self, message: &str) {
            self.frame(Severity::Error, message);
        }
        fn critical(&self, message: &str) {
            self.frame(Severity::Critical, message);
        }
        fn completion(&self, outcome: &ExitOutcome) {
            self.push(Seen::Completion(*outcome));
        }
        fn failure(&self, reason: &str) {
            self.push(Seen::Failure(reason.to_string()));
        }
        fn on_connect_started(&self) {
            self.push(Seen::ConnectStarted);
        }
        fn on_disconnect_started(&self) {
            self.push(Seen::DisconnectStarted);
        }
        fn on_session_started(&self, session: &SessionHandle) {
            self.push(Seen::SessionStarted(session.id));
        }
        fn on_session_finished(&self) {
            self.push(Seen::SessionFinished);
        }
        fn on_session_cancelled(&self) {
            self.push(Seen::SessionCancelled);
        }
    }

    // ── Outils ───────────────────────────────────────────────────────────────

    struct Harness {
        channel: Arc<FakeChannel>,
        sink: Arc<RecordingSink>,
        manager: SessionLifecycleManager,
    }

    fn harness(channel: FakeChannel, options: &[(&str, OptionValue)]) -> Harness {
        harness_with_grace(channel, options, Duration::from_millis(20))
    }

    fn harness_with_grace(
        channel: FakeChannel,
        options: &[(&str, OptionValue)],
        disconnect_grace: Duration,
    ) -> Harness {
        let channel = Arc::new(channel);
        let sink = Arc::new(RecordingSink::default());
        let store: BTreeMap<String, OptionValue> = options
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let manager = SessionLifecycleManager::new(
            channel.clone(),
            Arc::new(store),
            sink.clone(),
            ManagerOptions { disconnect_grace },
        );
        Harness {
            channel,
            sink,
            manager,
        }
    }

    fn target() -> SessionTarget {
        SessionTarget {
            host: "router.lan".to_string(),
            port: 22,
            username: "admin".to_string(),
            auth_method: AuthMethod::Password("secret".to_string()),
        }
    }

    async fn wait_for_state(manager: &SessionLifecycleManager, state: SessionState) {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("état {state:?} jamais atteint"))
            .unwrap();
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition jamais remplie");
    }

    async fn connected(channel: FakeChannel, options: &[(&str, OptionValue)]) -> Harness {
        wait_connected(harness(channel, options)).await
    }

    async fn wait_connected(h: Harness) -> Harness {
        assert!(h.manager.connect(target(), None));
        wait_for_state(&h.manager, SessionState::Connected).await;
        let channel = h.channel.clone();
        eventually(|| {
            channel
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Execute(_, _, CommandRole::Connect)))
        })
        .await;
        h
    }

    // ── Tests ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_runs_resolved_command() {
        let h = connected(
            FakeChannel::default(),
            &[(keys::COUNTRY, OptionValue::from("se"))],
        )
        .await;

        assert_eq!(
            h.channel.calls(),
            vec![
                Call::Connect("router.lan".to_string()),
                Call::Execute(
                    1,
                    "[ -f /opt/etc/profile ] && . /opt/etc/profile ; openpyn se".to_string(),
                    CommandRole::Connect
                ),
            ]
        );
        assert!(h.sink.seen().contains(&Seen::SessionStarted(1)));
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected() {
        let h = connected(FakeChannel::default(), &[]).await;
        let before = h.channel.calls();

        assert!(!h.manager.connect(target(), Some("fr")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.channel.calls(), before);
        assert_eq!(h.manager.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_while_idle_is_a_no_op() {
        let h = harness(FakeChannel::default(), &[]);
        assert!(!h.manager.disconnect());
        assert!(!h.manager.disconnect());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.channel.calls().is_empty());
        assert_eq!(h.manager.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn disconnect_kills_then_tears_down_after_grace() {
        let h = connected(FakeChannel::default(), &[]).await;

        assert!(h.manager.disconnect());
        assert_eq!(h.manager.state(), SessionState::Stopping);
        assert!(!h.manager.disconnect());

        wait_for_state(&h.manager, SessionState::Idle).await;
        let calls = h.channel.calls();
        assert_eq!(
            &calls[2..],
            &[
                Call::Execute(1, "sudo openpyn --kill".to_string(), CommandRole::Disconnect),
                Call::Disconnect(1),
            ]
        );
        let sink = h.sink.clone();
        eventually(|| sink.seen().contains(&Seen::SessionFinished)).await;
    }

    #[tokio::test]
    async fn unavailable_channel_leaves_state_untouched() {
        let channel = FakeChannel::default();
        channel.unavailable.store(true, Ordering::SeqCst);
        let h = harness(channel, &[]);

        assert!(!h.manager.connect(target(), None));
        assert_eq!(h.manager.state(), SessionState::Idle);
        assert!(h.channel.calls().is_empty());
        assert_eq!(
            h.sink.seen(),
            vec![Seen::Failure(ChannelError::NotConnected.to_string())]
        );
    }

    #[tokio::test]
    async fn refused_connect_rolls_back_to_idle() {
        let channel = FakeChannel::default();
        channel.refuse_connect.store(true, Ordering::SeqCst);
        let h = harness(channel, &[]);

        assert!(h.manager.connect(target(), None));
        let sink = h.sink.clone();
        eventually(|| !sink.seen().is_empty()).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(
            h.sink.seen(),
            vec![Seen::Failure(ChannelError::NotConnected.to_string())]
        );
    }

    #[tokio::test]
    async fn cancelled_start_returns_to_idle() {
        let channel = FakeChannel::default();
        channel.hold_start.store(true, Ordering::SeqCst);
        let h = harness(channel, &[]);

        assert!(h.manager.connect(target(), None));
        let channel = h.channel.clone();
        eventually(|| !channel.calls().is_empty()).await;
        assert_eq!(h.manager.state(), SessionState::Starting);

        h.channel.emit(ChannelEvent::SessionCancelled).await;
        wait_for_state(&h.manager, SessionState::Idle).await;
        let sink = h.sink.clone();
        eventually(|| sink.seen().contains(&Seen::SessionCancelled)).await;
    }

    #[tokio::test]
    async fn frames_above_threshold_are_not_forwarded() {
        let h = connected(
            FakeChannel::default(),
            &[(keys::LOG_LEVEL, OptionValue::from("20"))],
        )
        .await;

        h.channel
            .emit(ChannelEvent::Output {
                role: CommandRole::Connect,
                text: "hello:INFO world:ERROR".to_string(),
            })
            .await;
        h.channel
            .emit(ChannelEvent::Output {
                role: CommandRole::Connect,
                text: "done:DEBUG".to_string(),
            })
            .await;

        let sink = h.sink.clone();
        eventually(|| sink.frames().len() == 2).await;
        assert_eq!(
            h.sink.frames(),
            vec![
                Seen::Frame(Severity::Info, "hello".to_string()),
                Seen::Frame(Severity::Debug, "done".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn frames_accumulate_and_keep_order() {
        let h = connected(FakeChannel::default(), &[]).await;

        for text in ["ab", "c:INFO", "CONNECTING TO SERVER x", ":SUCCESS"] {
            h.channel
                .emit(ChannelEvent::Output {
                    role: CommandRole::Connect,
                    text: text.to_string(),
                })
                .await;
        }

        let sink = h.sink.clone();
        eventually(|| sink.frames().len() == 2).await;
        let seen: Vec<Seen> = h
            .sink
            .seen()
            .into_iter()
            .filter(|s| !matches!(s, Seen::SessionStarted(_)))
            .collect();
        assert_eq!(
            seen,
            vec![
                Seen::Frame(Severity::Info, "abc".to_string()),
                Seen::ConnectStarted,
                Seen::Frame(Severity::Success, "CONNECTING TO SERVER x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn silent_threshold_still_reports_lifecycle_hints() {
        let h = connected(
            FakeChannel::default(),
            &[(keys::LOG_LEVEL, OptionValue::from(0))],
        )
        .await;

        h.channel
            .emit(ChannelEvent::Output {
                role: CommandRole::Disconnect,
                text: "Killing the running openvpn process:WARNING".to_string(),
            })
            .await;

        let sink = h.sink.clone();
        eventually(|| sink.seen().contains(&Seen::DisconnectStarted)).await;
        assert!(h.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn script_exit_is_classified_and_session_released() {
        let h = connected(FakeChannel::default(), &[]).await;

        h.channel
            .emit(ChannelEvent::CommandCompleted {
                role: CommandRole::Connect,
                exit_code: 137,
            })
            .await;

        wait_for_state(&h.manager, SessionState::Idle).await;
        let seen = h.sink.seen();
        assert!(seen.contains(&Seen::Completion(ExitOutcome::Signal(Signal::Kill))));
        assert_eq!(h.channel.calls().last(), Some(&Call::Disconnect(1)));
        assert!(!h
            .channel
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Execute(_, _, CommandRole::Disconnect))));
    }

    #[tokio::test]
    async fn kill_completion_is_not_reported_as_outcome() {
        let h = connected(FakeChannel::default(), &[]).await;

        h.channel
            .emit(ChannelEvent::CommandCompleted {
                role: CommandRole::Disconnect,
                exit_code: 0,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!h
            .sink
            .seen()
            .iter()
            .any(|s| matches!(s, Seen::Completion(_))));
        assert_eq!(h.manager.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn rejected_script_releases_session() {
        let h = connected(FakeChannel::default(), &[]).await;

        h.channel
            .emit(ChannelEvent::CommandError {
                role: CommandRole::Connect,
                reason: "exec refusé".to_string(),
            })
            .await;

        wait_for_state(&h.manager, SessionState::Idle).await;
        assert!(h.sink.seen().contains(&Seen::Failure("exec refusé".to_string())));
        assert_eq!(h.channel.calls().last(), Some(&Call::Disconnect(1)));
    }

    #[tokio::test]
    async fn kill_on_disconnected_service_restores_session() {
        let channel = FakeChannel::default();
        channel.kill_not_connected.store(true, Ordering::SeqCst);
        let h = connected(channel, &[]).await;

        assert!(h.manager.disconnect());
        wait_for_state(&h.manager, SessionState::Connected).await;

        let sink = h.sink.clone();
        eventually(|| sink.seen().iter().any(|s| matches!(s, Seen::Failure(_)))).await;
        assert!(!h
            .channel
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Disconnect(_))));
    }

    #[tokio::test]
    async fn failed_script_launch_releases_session() {
        let channel = FakeChannel::default();
        channel.fail_script.store(true, Ordering::SeqCst);
        let h = harness(channel, &[]);
        assert!(h.manager.connect(target(), None));

        wait_for_state(&h.manager, SessionState::Idle).await;
        assert!(h
            .sink
            .seen()
            .contains(&Seen::Failure("channel_open_session refusé".to_string())));
        assert_eq!(h.channel.calls().last(), Some(&Call::Disconnect(1)));
        assert!(h.manager.connect(target(), None));
    }

    #[tokio::test]
    async fn failed_close_abandons_session() {
        let channel = FakeChannel::default();
        channel.fail_disconnect.store(true, Ordering::SeqCst);
        let h = connected(channel, &[]).await;

        assert!(h.manager.disconnect());
        wait_for_state(&h.manager, SessionState::Idle).await;

        let seen = h.sink.seen();
        assert!(seen.contains(&Seen::Failure("fermeture impossible".to_string())));
        assert!(seen.contains(&Seen::SessionFinished));
        assert!(h.manager.connect(target(), None));
    }

    #[tokio::test]
    async fn session_end_during_grace_cancels_teardown() {
        let h = wait_connected(harness_with_grace(
            FakeChannel::default(),
            &[],
            Duration::from_millis(500),
        ))
        .await;

        assert!(h.manager.disconnect());
        let channel = h.channel.clone();
        eventually(|| {
            channel
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Execute(_, _, CommandRole::Disconnect)))
        })
        .await;
        h.channel.emit(ChannelEvent::SessionFinished).await;
        wait_for_state(&h.manager, SessionState::Idle).await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!h
            .channel
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Disconnect(_))));
    }

    #[tokio::test]
    async fn late_script_exit_after_session_end_is_ignored() {
        let h = connected(FakeChannel::default(), &[]).await;
        assert!(h.manager.disconnect());
        wait_for_state(&h.manager, SessionState::Idle).await;

        h.channel
            .emit(ChannelEvent::CommandCompleted {
                role: CommandRole::Connect,
                exit_code: -1,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!h
            .sink
            .seen()
            .iter()
            .any(|s| matches!(s, Seen::Completion(_))));
    }

    #[tokio::test]
    async fn script_exit_while_stopping_is_still_reported() {
        let h = wait_connected(harness_with_grace(
            FakeChannel::default(),
            &[],
            Duration::from_millis(500),
        ))
        .await;
        assert!(h.manager.disconnect());

        h.channel
            .emit(ChannelEvent::CommandCompleted {
                role: CommandRole::Connect,
                exit_code: 143,
            })
            .await;

        let sink = h.sink.clone();
        eventually(|| {
            sink.seen()
                .contains(&Seen::Completion(ExitOutcome::Signal(Signal::Term)))
        })
        .await;
        assert_eq!(h.manager.state(), SessionState::Stopping);
    }
}
