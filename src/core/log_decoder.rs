// =============================================================================
// Fichier : log_decoder.rs
// Rôle    : Découpage du flux de sortie distant en trames de log
//
// Format :
//   Le script distant termine chaque message par un marqueur `:NIVEAU`
//   (ex: `Connexion établie:SUCCESS`). Le flux n'est pas aligné sur les
//   lignes : un message peut s'étendre sur plusieurs lectures.
//
// Hypothèse :
//   Tout texte émis finit par être suivi d'un marqueur. Sans marqueur, le
//   texte reste en mémoire tampon jusqu'à la fin de la session.
// =============================================================================

/// Niveaux de sévérité émis par le script distant, du plus détaillé au plus
/// critique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Spam,
    Debug,
    Verbose,
    Info,
    Notice,
    Warning,
    Success,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Self; 9] = [
        Self::Spam,
        Self::Debug,
        Self::Verbose,
        Self::Info,
        Self::Notice,
        Self::Warning,
        Self::Success,
        Self::Error,
        Self::Critical,
    ];

    /// Priorité numérique (plus basse = plus détaillée).
    pub const fn priority(self) -> u8 {
        match self {
            Self::Spam => 5,
            Self::Debug => 10,
            Self::Verbose => 15,
            Self::Info => 20,
            Self::Notice => 25,
            Self::Warning => 30,
            Self::Success => 35,
            Self::Error => 40,
            Self::Critical => 50,
        }
    }

    /// Marqueur littéral tel qu'il apparaît dans le flux.
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Spam => ":SPAM",
            Self::Debug => ":DEBUG",
            Self::Verbose => ":VERBOSE",
            Self::Info => ":INFO",
            Self::Notice => ":NOTICE",
            Self::Warning => ":WARNING",
            Self::Success => ":SUCCESS",
            Self::Error => ":ERROR",
            Self::Critical => ":CRITICAL",
        }
    }

    pub fn label(self) -> &'static str {
        &self.marker()[1..]
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Seuil de filtrage des trames.
///
/// Une trame est transmise si sa priorité est inférieure ou égale au seuil.
/// Le seuil 0 coupe tout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogThreshold(pub u8);

impl LogThreshold {
    pub const SILENT: Self = Self(0);
    pub const ALL: Self = Self(Severity::Critical.priority());

    pub const fn forwards(self, severity: Severity) -> bool {
        self.0 != 0 && severity.priority() <= self.0
    }
}

impl Default for LogThreshold {
    fn default() -> Self {
        Self::ALL
    }
}

/// Unité de log décodée : texte + sévérité.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message: String,
    pub severity: Severity,
}

/// Tampon incrémental extrayant les trames du flux.
#[derive(Debug, Default)]
pub struct LogFrameDecoder {
    buffer: String,
}

impl LogFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute `text` au tampon et renvoie les trames complètes, dans l'ordre.
    pub fn feed(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some((start, severity)) = self.earliest_marker() {
            let end = start + severity.marker().len();
            let message = self.buffer[..start].to_string();
            self.buffer.drain(..end);
            frames.push(Frame { message, severity });
        }
        frames
    }

    /// Texte en attente d'un marqueur.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn earliest_marker(&self) -> Option<(usize, Severity)> {
        Severity::ALL
            .iter()
            .filter_map(|&severity| {
                self.buffer
                    .find(severity.marker())
                    .map(|index| (index, severity))
            })
            .min_by_key(|&(index, _)| index)
    }
}

/// Notifications de cycle de vie détectées dans le texte brut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleHint {
    ConnectStarted,
    DisconnectStarted,
}

const HINT_PHRASES: [(&str, LifecycleHint); 3] = [
    ("connecting to server", LifecycleHint::ConnectStarted),
    ("killing the running openvpn", LifecycleHint::DisconnectStarted),
    ("shutting down safely", LifecycleHint::DisconnectStarted),
];

/// Repère les phrases de cycle de vie, indépendamment de la sévérité.
pub fn detect_lifecycle_hints(text: &str) -> Vec<LifecycleHint> {
    let lowered = text.to_lowercase();
    HINT_PHRASES
        .iter()
        .filter(|(phrase, _)| lowered.contains(phrase))
        .map(|&(_, hint)| hint)
        .collect()
}
