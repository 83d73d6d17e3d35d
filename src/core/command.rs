// =============================================================================
// Fichier : command.rs
// Rôle    : Construction des commandes shell de connexion / déconnexion
//
// Le shell distant n'est pas interactif : /opt/etc/profile n'est pas chargé
// et `openpyn` serait absent du PATH. La commande le source explicitement.
// =============================================================================

use super::log_decoder::LogThreshold;
use super::settings::ConfigurationStore;

const PROFILE: &str = "/opt/etc/profile";
const PROGRAM: &str = "openpyn";
const KILL_COMMAND: &str = "sudo openpyn --kill";

/// Noms des options dans le magasin de configuration.
pub mod keys {
    pub const SERVER: &str = "pref_server";
    pub const COUNTRY: &str = "pref_country";
    pub const TCP: &str = "pref_tcp";
    pub const MAX_LOAD: &str = "pref_max_load";
    pub const TOP_SERVERS: &str = "pref_top_servers";
    pub const PINGS: &str = "pref_pings";
    pub const FORCE_FW: &str = "pref_force_fw";
    pub const P2P: &str = "pref_p2p";
    pub const DEDICATED: &str = "pref_dedicated";
    pub const DOUBLE: &str = "pref_double";
    pub const TOR: &str = "pref_tor";
    pub const ANTI_DDOS: &str = "pref_anti_ddos";
    pub const NETFLIX: &str = "pref_netflix";
    pub const TEST: &str = "pref_test";
    pub const SKIP_DNS_PATCH: &str = "pref_skip_dns_patch";
    pub const SILENT: &str = "pref_silent";
    pub const NVRAM: &str = "pref_nvram";
    pub const NVRAM_CLIENT: &str = "pref_nvram_client";
    pub const MANAGEMENT: &str = "pref_openvpnmgmt";
    pub const MANAGEMENT_HOST: &str = "pref_openvpnmgmt_host";
    pub const MANAGEMENT_PORT: &str = "pref_openvpnmgmt_port";
    pub const MANAGEMENT_PASSWORD_FILE: &str = "pref_openvpnmgmt_password_file";
    pub const MANAGEMENT_USERNAME: &str = "pref_openvpnmgmt_username";
    pub const MANAGEMENT_USERPASS: &str = "pref_openvpnmgmt_userpass";
    pub const LOG_LEVEL: &str = "pref_log_level";
}

const DEFAULT_NVRAM_CLIENT: &str = "5";
const DEFAULT_MANAGEMENT_HOST: &str = "127.0.0.1";
const DEFAULT_MANAGEMENT_PORT: u16 = 7015;

// =============================================================================
// Commande
// =============================================================================

/// Commande shell immuable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(String);

impl Command {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Configuration résolue
// =============================================================================

/// Intégration à l'interface de management OpenVPN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementOptions {
    pub host: String,
    pub port: u16,
    pub password_file: String,
    pub username: String,
    pub userpass: String,
}

impl ManagementOptions {
    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.userpass.is_empty()
    }
}

/// Options openpyn, lues à chaque tentative de connexion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub server: String,
    pub country: String,
    pub tcp: bool,
    pub max_load: Option<u32>,
    pub top_servers: Option<u32>,
    pub pings: Option<u32>,
    pub force_fw_rules: bool,
    pub p2p: bool,
    pub dedicated: bool,
    pub double_hop: bool,
    pub tor: bool,
    pub anti_ddos: bool,
    pub netflix: bool,
    pub test: bool,
    pub skip_dns_patch: bool,
    pub silent: bool,
    pub nvram_client: Option<String>,
    pub management: Option<ManagementOptions>,
    pub log_threshold: LogThreshold,
}

impl Configuration {
    /// Résout les options depuis le magasin ; ne peut pas échouer.
    pub fn from_store(store: &dyn ConfigurationStore) -> Self {
        let text = |key: &str| {
            store
                .string(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let flag = |key: &str| store.boolean(key).unwrap_or(false);
        let limit = |key: &str| {
            store
                .string(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|&n| n > 0)
        };

        let nvram_client = flag(keys::NVRAM).then(|| {
            Some(text(keys::NVRAM_CLIENT))
                .filter(|client| !client.is_empty())
                .unwrap_or_else(|| DEFAULT_NVRAM_CLIENT.to_string())
        });

        let management = flag(keys::MANAGEMENT).then(|| ManagementOptions {
            host: openvpn_token(keys::MANAGEMENT_HOST, text(keys::MANAGEMENT_HOST))
                .filter(|host| !host.is_empty())
                .unwrap_or_else(|| DEFAULT_MANAGEMENT_HOST.to_string()),
            port: text(keys::MANAGEMENT_PORT)
                .parse()
                .unwrap_or(DEFAULT_MANAGEMENT_PORT),
            password_file: openvpn_token(
                keys::MANAGEMENT_PASSWORD_FILE,
                text(keys::MANAGEMENT_PASSWORD_FILE),
            )
            .unwrap_or_default(),
            username: text(keys::MANAGEMENT_USERNAME),
            userpass: text(keys::MANAGEMENT_USERPASS),
        });

        let log_threshold = store
            .string(keys::LOG_LEVEL)
            .and_then(|v| v.trim().parse::<u8>().ok())
            .map_or_else(LogThreshold::default, LogThreshold);

        Self {
            server: text(keys::SERVER),
            country: text(keys::COUNTRY),
            tcp: flag(keys::TCP),
            max_load: limit(keys::MAX_LOAD),
            top_servers: limit(keys::TOP_SERVERS),
            pings: limit(keys::PINGS),
            force_fw_rules: flag(keys::FORCE_FW),
            p2p: flag(keys::P2P),
            dedicated: flag(keys::DEDICATED),
            double_hop: flag(keys::DOUBLE),
            tor: flag(keys::TOR),
            anti_ddos: flag(keys::ANTI_DDOS),
            netflix: flag(keys::NETFLIX),
            test: flag(keys::TEST),
            skip_dns_patch: flag(keys::SKIP_DNS_PATCH),
            silent: flag(keys::SILENT),
            nvram_client,
            management,
            log_threshold,
        }
    }
}

/// Code pays tel qu'attendu par openpyn (les domaines NordVPN utilisent `uk`).
fn country_code(iso: &str) -> String {
    match iso.trim().to_ascii_lowercase().as_str() {
        "gb" => "uk".to_string(),
        other => other.to_string(),
    }
}

/// Mot shell sûr : laissé tel quel s'il ne contient que des caractères
/// inertes, sinon entouré d'apostrophes.
fn shell_quote(value: &str) -> String {
    let inert = |c: char| c.is_ascii_alphanumeric() || "_-.,:/@%+=".contains(c);
    if !value.is_empty() && value.chars().all(inert) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Valeur passée telle quelle à OpenVPN dans `--openvpn-options` : un seul
/// mot, sans guillemets.
fn openvpn_token(key: &str, value: String) -> Option<String> {
    if value.chars().any(|c| c.is_whitespace() || "'\"\\".contains(c)) {
        log::warn!("Option {key} ignorée : {value:?} n'est pas un argument OpenVPN valide");
        return None;
    }
    Some(value)
}

// =============================================================================
// Builder
// =============================================================================

/// Assemble les arguments openpyn dans un ordre fixe.
///
/// Chaque étape correspond à une option ; l'ordre des appels dans
/// `build_connect_command` définit l'ordre de la ligne de commande.
#[derive(Debug)]
pub struct CommandBuilder<'a> {
    config: &'a Configuration,
    args: Vec<String>,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a Configuration) -> Self {
        Self {
            config,
            args: vec![PROGRAM.to_string()],
        }
    }

    fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    fn push_if(mut self, enabled: bool, arg: &str) -> Self {
        if enabled {
            self.push(arg);
        }
        self
    }

    fn push_limit(mut self, name: &str, value: Option<u32>) -> Self {
        if let Some(value) = value {
            self.push(format!("{name} {value}"));
        }
        self
    }

    /// Un seul argument de localisation : carte > serveur > pays.
    pub fn location(mut self, selected: Option<&str>) -> Self {
        let config = self.config;
        let selected = selected.map(str::trim).filter(|code| !code.is_empty());
        if let Some(code) = selected {
            self.push(shell_quote(&country_code(code)));
        } else if !config.server.is_empty() {
            self.push(format!("--server {}", shell_quote(&config.server)));
        } else if !config.country.is_empty() {
            self.push(shell_quote(&country_code(&config.country)));
        }
        self
    }

    pub fn transport(self) -> Self {
        let tcp = self.config.tcp;
        self.push_if(tcp, "--tcp")
    }

    pub fn limits(self) -> Self {
        let (load, top, pings) = (
            self.config.max_load,
            self.config.top_servers,
            self.config.pings,
        );
        self.push_limit("--max-load", load)
            .push_limit("--top-servers", top)
            .push_limit("--pings", pings)
    }

    pub fn firewall(self) -> Self {
        let rules = self.config.force_fw_rules;
        self.push_if(rules, "--force-fw-rules")
    }

    pub fn features(self) -> Self {
        let c = self.config;
        self.push_if(c.p2p, "--p2p")
            .push_if(c.dedicated, "--dedicated")
            .push_if(c.double_hop, "--double")
            .push_if(c.tor, "--tor")
            .push_if(c.anti_ddos, "--anti-ddos")
            .push_if(c.netflix, "--netflix")
    }

    /// `--silent` est forcé quand l'interface de management est active.
    pub fn diagnostics(self) -> Self {
        let c = self.config;
        let silent = c.silent || c.management.is_some();
        self.push_if(c.test, "--test")
            .push_if(c.skip_dns_patch, "--skip-dns-patch")
            .push_if(silent, "--silent")
    }

    pub fn nvram(mut self) -> Self {
        let config = self.config;
        if let Some(client) = &config.nvram_client {
            self.push(format!("--nvram {}", shell_quote(client)));
        }
        self
    }

    pub fn management(mut self) -> Self {
        let config = self.config;
        let Some(mgmt) = &config.management else {
            return self;
        };

        let mut openvpn = format!("--management {} {}", mgmt.host, mgmt.port);
        if !mgmt.password_file.is_empty() {
            openvpn.push(' ');
            openvpn.push_str(&mgmt.password_file);
        }
        if mgmt.has_credentials() {
            openvpn.push_str(
                " --auth-nocache --auth-retry interact --management-hold --management-query-passwords",
            );
            self.push("--application");
        }
        openvpn.push_str(" --management-up-down");

        self.push(format!("--openvpn-options {}", shell_quote(&openvpn)));
        self
    }

    pub fn build(self) -> Command {
        Command(format!(
            "[ -f {PROFILE} ] && . {PROFILE} ; {}",
            self.args.join(" ")
        ))
    }
}

/// Commande de connexion pour la configuration et la localisation choisies.
pub fn build_connect_command(config: &Configuration, selected_location: Option<&str>) -> Command {
    let command = CommandBuilder::new(config)
        .location(selected_location)
        .transport()
        .limits()
        .firewall()
        .features()
        .diagnostics()
        .nvram()
        .management()
        .build();
    log::debug!("Commande de connexion : {command}");
    command
}

/// Commande d'arrêt, indépendante de la configuration.
pub fn build_disconnect_command() -> Command {
    Command(KILL_COMMAND.to_string())
}
