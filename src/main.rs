// =============================================================================
// openpyn-remote — Pilotage d'openpyn sur un routeur distant
// =============================================================================
//
// Architecture :
//   core/   — Logique métier (session, commande, décodage, ssh, settings)
//   ui/     — Affichage console (sink coloré)
//   app.rs  — Ligne de commande et boucle de session
//
// Technologies :
//   Rust + tokio + russh + clap
//
// Auteur : M@nu
// Licence : MIT
// =============================================================================

mod app;
mod core;
mod ui;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = app::Cli::parse();

    match app::run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Erreur : {e:#}");
            ExitCode::FAILURE
        }
    }
}
