//! The in-memory users table and the database collaborator interface.
//!
//! The cache is loaded once at startup from `DbPool::load_users` and updated
//! in place on successful registration. Login never touches the database.

use std::collections::HashMap;
use std::sync::Mutex;

use minuet_pg::PgError;

/// One checked-out database connection.
pub trait DbConn: Send {
    fn insert_user(&mut self, name: &str, passwd: &str) -> Result<(), PgError>;
}

/// Blocking connection pool interface the server consumes.
pub trait DbPool: Send + Sync + 'static {
    type Conn: DbConn;

    /// Block until a connection frees. None once the pool has shut down.
    fn acquire(&self) -> Option<Self::Conn>;

    fn release(&self, conn: Self::Conn);

    /// Bootstrap query: the full `name → password` table.
    fn load_users(&self) -> Result<HashMap<String, String>, PgError>;

    /// Stop handing out connections and drop the free list.
    fn shutdown(&self) {}
}

/// RAII pairing of `acquire` with `release`.
pub struct DbLease<'a, P: DbPool> {
    pool: &'a P,
    conn: Option<P::Conn>,
}

impl<'a, P: DbPool> DbLease<'a, P> {
    /// Blocks like `acquire`; None means the pool is gone and the caller
    /// should drop its unit of work.
    pub fn acquire(pool: &'a P) -> Option<Self> {
        pool.acquire().map(|c| Self {
            pool,
            conn: Some(c),
        })
    }

    pub fn conn_mut(&mut self) -> &mut P::Conn {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<P: DbPool> Drop for DbLease<'_, P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Duplicate,
    DbFailed,
}

/// Process-wide `name → password` map behind one mutex.
pub struct UsersCache {
    inner: Mutex<HashMap<String, String>>,
}

impl UsersCache {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Login check: exact name and password match.
    pub fn verify(&self, name: &str, passwd: &str) -> bool {
        self.lock().get(name).map(|p| p == passwd).unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Register a new user. The mutex is held across the duplicate check,
    /// the DB insert, and the cache insert so two racing registrations of
    /// the same name cannot both commit.
    pub fn register(&self, name: &str, passwd: &str, db: &mut dyn DbConn) -> RegisterOutcome {
        let mut map = self.lock();
        if map.contains_key(name) {
            return RegisterOutcome::Duplicate;
        }
        match db.insert_user(name, passwd) {
            Ok(()) => {
                map.insert(name.to_string(), passwd.to_string());
                RegisterOutcome::Inserted
            }
            Err(e) => {
                tracing::error!(name, error = %e, "user insert failed");
                RegisterOutcome::DbFailed
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
