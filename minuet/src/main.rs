use std::process::ExitCode;
use std::sync::Arc;

use minuet_pg::PgConfig;

use minuet::config::Config;
use minuet::db::PgPool;
use minuet::logging;
use minuet::server::Server;
use minuet::users::{DbPool, UsersCache};

fn main() -> ExitCode {
    // Config first: logging setup depends on it.
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("minuet: {}", e);
            return ExitCode::from(1);
        }
    };

    let _log_guard = logging::init(&cfg);
    cfg.log_summary();

    let pg_config = PgConfig::new(
        &cfg.db_host,
        cfg.db_port,
        &cfg.db_user,
        &cfg.db_password,
        &cfg.db_name,
    );
    let db = match PgPool::connect(&pg_config, cfg.sql_num as usize) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!(error = %e, "database pool init failed");
            eprintln!("minuet: database pool init failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let users = match db.load_users() {
        Ok(map) => Arc::new(UsersCache::new(map)),
        Err(e) => {
            tracing::error!(error = %e, "users bootstrap failed");
            eprintln!("minuet: users bootstrap failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let mut server = match Server::new(&cfg, db, users) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("minuet: startup failed: {}", e);
            return ExitCode::from(1);
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "event loop failed");
            ExitCode::from(1)
        }
    }
}
