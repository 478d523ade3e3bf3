//! End-to-end request → response scenarios over a socket pair, exercising
//! the parse → handle → emit pipeline with a real document root.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use minuet::conn::Connection;
use minuet::parser::HttpCode;
use minuet::response::WriteOutcome;
use minuet::syscalls::TriggerMode;
use minuet::users::{DbConn, UsersCache};
use minuet_pg::PgError;

struct FakeDb {
    inserted: Vec<(String, String)>,
}

impl DbConn for FakeDb {
    fn insert_user(&mut self, name: &str, passwd: &str) -> Result<(), PgError> {
        self.inserted.push((name.to_string(), passwd.to_string()));
        Ok(())
    }
}

fn peer() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000))
}

fn doc_root(files: &[(&str, &str)]) -> Arc<PathBuf> {
    let dir = std::env::temp_dir().join(format!("minuet_e2e_{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    for (name, contents) in files {
        fs::write(dir.join(name), contents).unwrap();
    }
    Arc::new(dir)
}

fn users_with(pairs: &[(&str, &str)]) -> UsersCache {
    UsersCache::new(
        pairs
            .iter()
            .map(|(n, p)| (n.to_string(), p.to_string()))
            .collect::<HashMap<_, _>>(),
    )
}

/// Push `raw` through the full pipeline and return the wire response.
fn roundtrip(
    root: Arc<PathBuf>,
    users: &UsersCache,
    db: &mut FakeDb,
    raw: &[u8],
) -> (String, WriteOutcome) {
    let (local, mut remote) = UnixStream::pair().unwrap();
    remote.write_all(raw).unwrap();

    let mut conn = Connection::new(local.as_raw_fd(), peer(), TriggerMode::Level, root);
    assert!(conn.read_once(), "request bytes should be readable");

    let code = conn.process_read();
    assert_ne!(code, HttpCode::NoRequest, "request should be complete");

    let code = if code == HttpCode::GetRequest {
        conn.do_request(users, db)
    } else {
        code
    };
    assert!(conn.process_write(code), "response must fit the buffer");

    let outcome = conn.write();
    drop(local);

    let mut response = String::new();
    remote.read_to_string(&mut response).unwrap();
    (response, outcome)
}

#[test]
fn scenario_1_root_serves_judge_page() {
    let root = doc_root(&[("judge.html", "<html>judge</html>")]);
    let users = users_with(&[]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, outcome) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("<html>judge</html>"));
    assert_eq!(outcome, WriteOutcome::Complete { keep_alive: false });
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn scenario_2_missing_file_is_404() {
    let root = doc_root(&[]);
    let users = users_with(&[]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, _) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("The requested file was not found on this server.\n"));
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn scenario_3_login_success_serves_welcome() {
    let root = doc_root(&[("welcome.html", "welcome"), ("logError.html", "denied")]);
    let users = users_with(&[("alice", "secret1")]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, _) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 25\r\n\r\nuser=alice&passwd=secret1",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("welcome"));
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn scenario_4_login_failure_serves_error_page() {
    let root = doc_root(&[("welcome.html", "welcome"), ("logError.html", "denied")]);
    let users = users_with(&[("alice", "secret1")]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, _) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 23\r\n\r\nuser=alice&passwd=wrong",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("denied"));
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn scenario_5_register_commits_to_cache_and_db() {
    let root = doc_root(&[("log.html", "login page"), ("registerError.html", "taken")]);
    let users = users_with(&[]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, _) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"POST /3CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-Length: 20\r\n\r\nuser=newbob&passwd=p",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("login page"));
    assert!(users.verify("newbob", "p"));
    assert_eq!(db.inserted, vec![("newbob".to_string(), "p".to_string())]);
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn scenario_6_wrong_version_is_400() {
    let root = doc_root(&[("judge.html", "j")]);
    let users = users_with(&[]);
    let mut db = FakeDb { inserted: vec![] };

    let (response, _) = roundtrip(
        Arc::clone(&root),
        &users,
        &mut db,
        b"GET / HTTP/2.0\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.ends_with("Your request has bad syntax or is inherently impossible to satisfy.\n"));
    fs::remove_dir_all(&*root).ok();
}

#[test]
fn keep_alive_connection_reset_serves_second_request() {
    let root = doc_root(&[("a.html", "first"), ("b.html", "second")]);
    let users = users_with(&[]);
    let mut db = FakeDb { inserted: vec![] };

    let (local, mut remote) = UnixStream::pair().unwrap();
    let mut conn = Connection::new(
        local.as_raw_fd(),
        peer(),
        TriggerMode::Level,
        Arc::clone(&root),
    );

    for (target, body) in [("/a.html", "first"), ("/b.html", "second")] {
        let raw = format!(
            "GET {} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            target
        );
        remote.write_all(raw.as_bytes()).unwrap();

        assert!(conn.read_once());
        let code = conn.process_read();
        assert_eq!(code, HttpCode::GetRequest);
        let code = conn.do_request(&users, &mut db);
        assert_eq!(code, HttpCode::FileRequest);
        assert!(conn.process_write(code));
        assert_eq!(conn.write(), WriteOutcome::Complete { keep_alive: true });

        let mut buf = [0u8; 512];
        let n = remote.read(&mut buf).unwrap();
        let response = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.ends_with(body));

        conn.reset();
    }

    drop(local);
    fs::remove_dir_all(&*root).ok();
}
