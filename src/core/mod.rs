pub mod command;
pub mod connection;
pub mod event_sink;
pub mod exit_status;
pub mod log_decoder;
pub mod logger;
pub mod secrets;
pub mod session_manager;
pub mod settings;
pub mod ssh_manager;
