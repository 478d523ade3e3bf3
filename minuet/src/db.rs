//! Production `DbPool`: a fixed free list of blocking PostgreSQL
//! connections behind one mutex and a condition variable.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

use minuet_pg::{escape_literal, PgConfig, PgConnection, PgError};

use crate::users::{DbConn, DbLease, DbPool};

struct PoolState {
    free: Vec<PgConnection>,
    destroyed: bool,
}

pub struct PgPool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PgPool {
    /// Eagerly open `size` connections. Any connect failure is fatal.
    pub fn connect(config: &PgConfig, size: usize) -> Result<Self, PgError> {
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(PgConnection::connect(config)?);
        }
        tracing::info!(size, host = %config.host, db = %config.database, "database pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                free,
                destroyed: false,
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DbPool for PgPool {
    type Conn = PgConnection;

    fn acquire(&self) -> Option<PgConnection> {
        let mut state = self.lock();
        loop {
            if state.destroyed {
                return None;
            }
            if let Some(conn) = state.free.pop() {
                return Some(conn);
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn release(&self, conn: PgConnection) {
        let mut state = self.lock();
        if state.destroyed {
            // Dropping the connection sends Terminate.
            return;
        }
        state.free.push(conn);
        drop(state);
        self.cond.notify_one();
    }

    fn load_users(&self) -> Result<HashMap<String, String>, PgError> {
        let mut lease = DbLease::acquire(self).ok_or(PgError::ConnectionClosed)?;
        let rows = lease
            .conn_mut()
            .query_simple(r#"SELECT username, passwd FROM "user""#)?;

        let mut users = HashMap::with_capacity(rows.len());
        for row in rows {
            let (Some(name), Some(passwd)) = (row.get_str(0)?, row.get_str(1)?) else {
                continue;
            };
            users.insert(name.to_string(), passwd.to_string());
        }
        tracing::info!(count = users.len(), "users table loaded");
        Ok(users)
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.free.clear();
        drop(state);
        self.cond.notify_all();
        tracing::info!("database pool shut down");
    }
}

impl DbConn for PgConnection {
    fn insert_user(&mut self, name: &str, passwd: &str) -> Result<(), PgError> {
        let sql = format!(
            r#"INSERT INTO "user"(username, passwd) VALUES('{}', '{}')"#,
            escape_literal(name),
            escape_literal(passwd)
        );
        self.execute_simple(&sql)
    }
}
