// =============================================================================
// Fichier : exit_status.rs
// Rôle    : Classification du code de sortie du script distant
//
// Convention POSIX : un processus tué par le signal N se termine avec le
// code 128 + N côté shell.
// =============================================================================

use super::log_decoder::Severity;

/// Signaux POSIX reconnus dans un code de sortie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Ill,
    Trap,
    Abrt,
    Fpe,
    Kill,
    Segv,
    Alrm,
    Term,
}

impl Signal {
    /// Signal correspondant à un numéro POSIX, s'il est connu.
    pub const fn from_number(number: i32) -> Option<Self> {
        match number {
            1 => Some(Self::Hup),
            2 => Some(Self::Int),
            3 => Some(Self::Quit),
            4 => Some(Self::Ill),
            5 => Some(Self::Trap),
            6 => Some(Self::Abrt),
            8 => Some(Self::Fpe),
            9 => Some(Self::Kill),
            11 => Some(Self::Segv),
            14 => Some(Self::Alrm),
            15 => Some(Self::Term),
            _ => None,
        }
    }

    pub const fn number(self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Quit => 3,
            Self::Ill => 4,
            Self::Trap => 5,
            Self::Abrt => 6,
            Self::Fpe => 8,
            Self::Kill => 9,
            Self::Segv => 11,
            Self::Alrm => 14,
            Self::Term => 15,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Hup => "HUP",
            Self::Int => "INT",
            Self::Quit => "QUIT",
            Self::Ill => "ILL",
            Self::Trap => "TRAP",
            Self::Abrt => "ABRT",
            Self::Fpe => "FPE",
            Self::Kill => "KILL",
            Self::Segv => "SEGV",
            Self::Alrm => "ALRM",
            Self::Term => "TERM",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Résultat classifié d'un processus distant terminé.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure(i32),
    CommandNotFound,
    Signal(Signal),
    UnknownFailure,
}

impl ExitOutcome {
    /// Sévérité avec laquelle le résultat est présenté.
    ///
    /// `SIGTERM` est l'arrêt volontaire (`openpyn --kill`) : avertissement
    /// et non erreur.
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Success => Severity::Success,
            Self::Signal(Signal::Term) => Severity::Warning,
            Self::Failure(_) | Self::CommandNotFound | Self::Signal(_) | Self::UnknownFailure => {
                Severity::Error
            }
        }
    }

    /// `true` si l'issue correspond à un succès ou à un arrêt demandé.
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::Success | Self::Signal(Signal::Term))
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Terminé avec succès"),
            Self::Failure(code) => write!(f, "Échec (code {code})"),
            Self::CommandNotFound => {
                write!(f, "Commande introuvable sur le serveur (code 127)")
            }
            Self::Signal(Signal::Term) => write!(f, "Arrêté ({})", Signal::Term),
            Self::Signal(signal) => write!(f, "Interrompu par {signal}"),
            Self::UnknownFailure => write!(f, "Échec inconnu"),
        }
    }
}

/// Classe un code de sortie brut.
pub const fn classify(code: i32) -> ExitOutcome {
    match code {
        0 => ExitOutcome::Success,
        1 | 126 | 128 => ExitOutcome::Failure(code),
        127 => ExitOutcome::CommandNotFound,
        129..=134 | 136 | 137 | 139 | 142 | 143 => match Signal::from_number(code - 128) {
            Some(signal) => ExitOutcome::Signal(signal),
            None => ExitOutcome::UnknownFailure,
        },
        _ => ExitOutcome::UnknownFailure,
    }
}
