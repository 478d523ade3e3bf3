//! Configuration from CLI flags and an optional `key = value` file.
//!
//! File values are applied first, then explicit CLI flags win. `#` starts a
//! comment; blank lines are ignored. Both the legacy upper-case keys and
//! lower-case aliases are recognized.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{ServerError, ServerResult};
use crate::syscalls::TriggerMode;

/// Concurrency discipline: where the socket I/O syscalls happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorModel {
    /// I/O on the loop thread, business logic on workers.
    Proactor,
    /// I/O and logic both on workers.
    Reactor,
}

#[derive(Parser, Debug)]
#[command(name = "minuet", about = "Epoll-based static file and auth HTTP/1.1 server")]
struct Cli {
    /// Listen port
    #[arg(short = 'p')]
    port: Option<u16>,

    /// Log write mode: 0 = sync, 1 = async
    #[arg(short = 'l')]
    log_write: Option<u8>,

    /// Trigger mode 0..3: listen/connection = LT/LT, LT/ET, ET/LT, ET/ET
    #[arg(short = 'm')]
    trig_mode: Option<u8>,

    /// SO_LINGER on the listen socket: 0 = off, 1 = on
    #[arg(short = 'o')]
    opt_linger: Option<u8>,

    /// Database connection pool size
    #[arg(short = 's')]
    sql_num: Option<u32>,

    /// Worker thread count
    #[arg(short = 't')]
    thread_num: Option<u32>,

    /// Disable logging: 0 = enabled, 1 = disabled
    #[arg(short = 'c')]
    close_log: Option<u8>,

    /// Actor model: 0 = proactor, 1 = reactor
    #[arg(short = 'a')]
    actor_model: Option<u8>,

    /// Load options from a config file
    #[arg(short = 'f')]
    config_file: Option<PathBuf>,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_write: u8,
    pub trig_mode: u8,
    pub opt_linger: u8,
    pub sql_num: u32,
    pub thread_num: u32,
    pub close_log: u8,
    pub actor_model: u8,

    /// Derived from `trig_mode` unless set individually in the file.
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,

    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9006,
            log_write: 0,
            trig_mode: 0,
            opt_linger: 0,
            sql_num: 8,
            thread_num: 8,
            close_log: 0,
            actor_model: 0,
            listen_trigger: TriggerMode::Level,
            conn_trigger: TriggerMode::Level,
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "root".to_string(),
            db_password: "root".to_string(),
            db_name: "minuet".to_string(),
        }
    }
}

impl Config {
    /// Parse the process arguments (and any `-f` file) into a validated
    /// config.
    pub fn load() -> ServerResult<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> ServerResult<Self> {
        let mut cfg = Config::default();
        let mut listen_override = None;
        let mut conn_override = None;

        if let Some(path) = &cli.config_file {
            cfg.apply_file(path, &mut listen_override, &mut conn_override)?;
        }

        if let Some(v) = cli.port {
            cfg.port = v;
        }
        if let Some(v) = cli.log_write {
            cfg.log_write = v;
        }
        if let Some(v) = cli.trig_mode {
            cfg.trig_mode = v;
            // An explicit -m supersedes any per-side keys from the file.
            listen_override = None;
            conn_override = None;
        }
        if let Some(v) = cli.opt_linger {
            cfg.opt_linger = v;
        }
        if let Some(v) = cli.sql_num {
            cfg.sql_num = v;
        }
        if let Some(v) = cli.thread_num {
            cfg.thread_num = v;
        }
        if let Some(v) = cli.close_log {
            cfg.close_log = v;
        }
        if let Some(v) = cli.actor_model {
            cfg.actor_model = v;
        }

        cfg.finalize_triggers(listen_override, conn_override);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(
        &mut self,
        path: &Path,
        listen_override: &mut Option<u8>,
        conn_override: &mut Option<u8>,
    ) -> ServerResult<()> {
        let text = fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot open config file {}: {}", path.display(), e))
        })?;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "PORT" | "port" => self.port = parse_num(key, value)? as u16,
                "LOGWrite" | "log_write" => self.log_write = parse_num(key, value)? as u8,
                "TRIGMode" | "trig_mode" => self.trig_mode = parse_num(key, value)? as u8,
                "LISTENTrigmode" | "listen_trigmode" => {
                    *listen_override = Some(parse_num(key, value)? as u8)
                }
                "CONNTrigmode" | "conn_trigmode" => {
                    *conn_override = Some(parse_num(key, value)? as u8)
                }
                "OPT_LINGER" | "opt_linger" => self.opt_linger = parse_num(key, value)? as u8,
                "sql_num" => self.sql_num = parse_num(key, value)? as u32,
                "thread_num" => self.thread_num = parse_num(key, value)? as u32,
                "close_log" => self.close_log = parse_num(key, value)? as u8,
                "actor_model" => self.actor_model = parse_num(key, value)? as u8,
                "db_host" => self.db_host = value.to_string(),
                "db_port" => self.db_port = parse_num(key, value)? as u16,
                "db_user" => self.db_user = value.to_string(),
                "db_passwd" => self.db_password = value.to_string(),
                "db_name" => self.db_name = value.to_string(),
                _ => {
                    tracing::warn!(key, "unknown config key ignored");
                }
            }
        }
        Ok(())
    }

    fn finalize_triggers(&mut self, listen_override: Option<u8>, conn_override: Option<u8>) {
        let (listen, conn) = match self.trig_mode {
            1 => (TriggerMode::Level, TriggerMode::Edge),
            2 => (TriggerMode::Edge, TriggerMode::Level),
            3 => (TriggerMode::Edge, TriggerMode::Edge),
            _ => (TriggerMode::Level, TriggerMode::Level),
        };
        self.listen_trigger = match listen_override {
            Some(1) => TriggerMode::Edge,
            Some(_) => TriggerMode::Level,
            None => listen,
        };
        self.conn_trigger = match conn_override {
            Some(1) => TriggerMode::Edge,
            Some(_) => TriggerMode::Level,
            None => conn,
        };
    }

    fn validate(&self) -> ServerResult<()> {
        if self.port != 80 && self.port != 443 && self.port < 1024 {
            return Err(ServerError::Config(format!(
                "port {} out of range (80, 443, or >= 1024)",
                self.port
            )));
        }
        if self.log_write > 1 {
            return Err(ServerError::Config("log write mode must be 0 or 1".into()));
        }
        if self.trig_mode > 3 {
            return Err(ServerError::Config("trigger mode must be in 0..=3".into()));
        }
        if self.opt_linger > 1 {
            return Err(ServerError::Config("linger flag must be 0 or 1".into()));
        }
        if !(1..=100).contains(&self.sql_num) {
            return Err(ServerError::Config(format!(
                "DB pool size {} out of range [1,100]",
                self.sql_num
            )));
        }
        if !(1..=100).contains(&self.thread_num) {
            return Err(ServerError::Config(format!(
                "worker count {} out of range [1,100]",
                self.thread_num
            )));
        }
        if self.close_log > 1 {
            return Err(ServerError::Config("close_log must be 0 or 1".into()));
        }
        if self.actor_model > 1 {
            return Err(ServerError::Config("actor model must be 0 or 1".into()));
        }
        Ok(())
    }

    pub fn actor(&self) -> ActorModel {
        if self.actor_model == 1 {
            ActorModel::Reactor
        } else {
            ActorModel::Proactor
        }
    }

    pub fn log_enabled(&self) -> bool {
        self.close_log == 0
    }

    /// Log the effective values once at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            port = self.port,
            trig_mode = self.trig_mode,
            listen_trigger = ?self.listen_trigger,
            conn_trigger = ?self.conn_trigger,
            actor_model = ?self.actor(),
            workers = self.thread_num,
            db_pool = self.sql_num,
            opt_linger = self.opt_linger,
            log_write = self.log_write,
            "configuration loaded"
        );
    }
}

fn parse_num(key: &str, value: &str) -> ServerResult<i64> {
    value
        .parse()
        .map_err(|_| ServerError::Config(format!("cannot parse {} = {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("minuet_cfg_{}.ini", uuid::Uuid::new_v4()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn cli_with_file(path: PathBuf) -> Cli {
        Cli {
            port: None,
            log_write: None,
            trig_mode: None,
            opt_linger: None,
            sql_num: None,
            thread_num: None,
            close_log: None,
            actor_model: None,
            config_file: Some(path),
        }
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 9006);
        assert_eq!(cfg.sql_num, 8);
        assert_eq!(cfg.thread_num, 8);
        assert_eq!(cfg.listen_trigger, TriggerMode::Level);
        assert_eq!(cfg.conn_trigger, TriggerMode::Level);
        assert_eq!(cfg.actor(), ActorModel::Proactor);
    }

    #[test]
    fn trigger_mode_table() {
        for (mode, listen, conn) in [
            (0, TriggerMode::Level, TriggerMode::Level),
            (1, TriggerMode::Level, TriggerMode::Edge),
            (2, TriggerMode::Edge, TriggerMode::Level),
            (3, TriggerMode::Edge, TriggerMode::Edge),
        ] {
            let mut cfg = Config {
                trig_mode: mode,
                ..Config::default()
            };
            cfg.finalize_triggers(None, None);
            assert_eq!(cfg.listen_trigger, listen, "mode {}", mode);
            assert_eq!(cfg.conn_trigger, conn, "mode {}", mode);
        }
    }

    #[test]
    fn file_legacy_keys() {
        let path = temp_config(
            "# comment line\n\
             PORT = 9100\n\
             TRIGMode = 3\n\
             \n\
             sql_num = 4\n\
             thread_num = 2\n\
             actor_model = 1\n",
        );
        let cfg = Config::from_cli(cli_with_file(path.clone())).unwrap();
        fs::remove_file(path).ok();

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.trig_mode, 3);
        assert_eq!(cfg.listen_trigger, TriggerMode::Edge);
        assert_eq!(cfg.conn_trigger, TriggerMode::Edge);
        assert_eq!(cfg.sql_num, 4);
        assert_eq!(cfg.thread_num, 2);
        assert_eq!(cfg.actor(), ActorModel::Reactor);
    }

    #[test]
    fn file_per_side_trigger_keys() {
        let path = temp_config("LISTENTrigmode = 1\nCONNTrigmode = 0\n");
        let cfg = Config::from_cli(cli_with_file(path.clone())).unwrap();
        fs::remove_file(path).ok();

        assert_eq!(cfg.listen_trigger, TriggerMode::Edge);
        assert_eq!(cfg.conn_trigger, TriggerMode::Level);
    }

    #[test]
    fn cli_wins_over_file() {
        let path = temp_config("PORT = 9100\nthread_num = 2\n");
        let mut cli = cli_with_file(path.clone());
        cli.port = Some(9200);
        let cfg = Config::from_cli(cli).unwrap();
        fs::remove_file(path).ok();

        assert_eq!(cfg.port, 9200);
        assert_eq!(cfg.thread_num, 2);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut cli = cli_with_file(temp_config("thread_num = 0\n"));
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));

        cli = Cli {
            port: None,
            log_write: None,
            trig_mode: Some(7),
            opt_linger: None,
            sql_num: None,
            thread_num: None,
            close_log: None,
            actor_model: None,
            config_file: None,
        };
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn bad_value_is_an_error() {
        let path = temp_config("PORT = nine\n");
        let err = Config::from_cli(cli_with_file(path.clone())).unwrap_err();
        fs::remove_file(path).ok();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
