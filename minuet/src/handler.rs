//! Request handler: URL dispatch, CGI-style form decode, file resolution.
//!
//! The first character after the target's last `/` selects the behavior:
//! `0` register form, `1` login form, `2` login check, `3` register check,
//! `5`/`6`/`7` named static pages, anything else a file under the document
//! root. The digit table is a design constant, not configuration.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;

use memmap2::Mmap;

use crate::conn::Connection;
use crate::parser::HttpCode;
use crate::users::{DbConn, RegisterOutcome, UsersCache};

impl Connection {
    /// Route the parsed request and stage the file body for emission.
    pub fn do_request(&mut self, users: &UsersCache, db: &mut dyn DbConn) -> HttpCode {
        let url = self.url().to_string();
        let digit = url
            .rfind('/')
            .and_then(|p| url.as_bytes().get(p + 1))
            .copied();

        let rel: String = if self.cgi && matches!(digit, Some(b'2') | Some(b'3')) {
            let Some((name, passwd)) = decode_form(self.body_bytes()) else {
                return HttpCode::BadRequest;
            };

            if digit == Some(b'3') {
                match users.register(&name, &passwd, db) {
                    RegisterOutcome::Inserted => "/log.html".to_string(),
                    RegisterOutcome::Duplicate | RegisterOutcome::DbFailed => {
                        "/registerError.html".to_string()
                    }
                }
            } else if users.verify(&name, &passwd) {
                "/welcome.html".to_string()
            } else {
                "/logError.html".to_string()
            }
        } else {
            match digit {
                Some(b'0') => "/register.html".to_string(),
                Some(b'1') => "/log.html".to_string(),
                Some(b'5') => "/picture.html".to_string(),
                Some(b'6') => "/video.html".to_string(),
                Some(b'7') => "/fans.html".to_string(),
                _ => url,
            }
        };

        let path = self.doc_root.join(rel.trim_start_matches('/'));

        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        if meta.len() == 0 {
            // Zero-length files get a canned body; nothing to map.
            self.file_len = 0;
            self.file_map = None;
            return HttpCode::FileRequest;
        }

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return HttpCode::NoResource,
        };
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                self.file_len = map.len();
                self.file_map = Some(map);
                HttpCode::FileRequest
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "mmap failed");
                HttpCode::InternalError
            }
        }
    }
}

/// Strict positional decode of `user=<name>&passwd=<pwd>`.
///
/// `&` and `=` are hard delimiters; any deviation (missing literals, missing
/// `&`, empty name, non-UTF-8) is a decode failure rather than a read past a
/// delimiter.
pub(crate) fn decode_form(body: &[u8]) -> Option<(String, String)> {
    let s = std::str::from_utf8(body).ok()?;
    let rest = s.strip_prefix("user=")?;
    let (name, after) = rest.split_once('&')?;
    let passwd = after.strip_prefix("passwd=")?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), passwd.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::DbConn;
    use minuet_pg::PgError;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct FakeDb {
        inserted: Vec<(String, String)>,
    }

    impl DbConn for FakeDb {
        fn insert_user(&mut self, name: &str, passwd: &str) -> Result<(), PgError> {
            self.inserted.push((name.to_string(), passwd.to_string()));
            Ok(())
        }
    }

    fn doc_root(files: &[(&str, &str)]) -> Arc<PathBuf> {
        let dir = std::env::temp_dir().join(format!("minuet_root_{}", uuid::Uuid::new_v4()));
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

    fn request(root: Arc<PathBuf>, raw: &[u8]) -> Connection {
        let mut conn = Connection::for_tests(root);
        conn.feed(raw);
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
        conn
    }

    #[test]
    fn decode_form_happy_path() {
        assert_eq!(
            decode_form(b"user=alice&passwd=secret1"),
            Some(("alice".to_string(), "secret1".to_string()))
        );
        assert_eq!(
            decode_form(b"user=bob&passwd="),
            Some(("bob".to_string(), "".to_string()))
        );
    }

    #[test]
    fn decode_form_rejects_deviations() {
        assert_eq!(decode_form(b""), None);
        assert_eq!(decode_form(b"user=alice"), None);
        assert_eq!(decode_form(b"user=&passwd=x"), None);
        assert_eq!(decode_form(b"name=alice&passwd=x"), None);
        assert_eq!(decode_form(b"user=alice&password=x"), None);
    }

    #[test]
    fn digit_table_routes_to_named_pages() {
        let root = doc_root(&[
            ("register.html", "reg"),
            ("log.html", "log"),
            ("picture.html", "pic"),
            ("video.html", "vid"),
            ("fans.html", "fans"),
        ]);
        let users = users_with(&[]);

        for (target, body) in [
            ("/0", "reg"),
            ("/1", "log"),
            ("/5", "pic"),
            ("/6", "vid"),
            ("/7", "fans"),
        ] {
            let raw = format!("GET {} HTTP/1.1\r\n\r\n", target);
            let mut conn = request(Arc::clone(&root), raw.as_bytes());
            let mut db = FakeDb { inserted: vec![] };
            assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
            let map = conn.file_map.as_ref().unwrap();
            assert_eq!(&map[..], body.as_bytes(), "target {}", target);
        }
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn plain_file_served_from_root() {
        let root = doc_root(&[("page.html", "hello")]);
        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };

        let mut conn = request(Arc::clone(&root), b"GET /page.html HTTP/1.1\r\n\r\n");
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(conn.file_len, 5);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn missing_file_is_no_resource() {
        let root = doc_root(&[]);
        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };

        let mut conn = request(Arc::clone(&root), b"GET /nope HTTP/1.1\r\n\r\n");
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::NoResource);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let root = doc_root(&[("secret.html", "s")]);
        let path = root.join("secret.html");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms).unwrap();

        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };
        let mut conn = request(Arc::clone(&root), b"GET /secret.html HTTP/1.1\r\n\r\n");
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::ForbiddenRequest);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn directory_target_is_bad_request() {
        let root = doc_root(&[]);
        fs::create_dir_all(root.join("subdir")).unwrap();
        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };

        let mut conn = request(Arc::clone(&root), b"GET /subdir HTTP/1.1\r\n\r\n");
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::BadRequest);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn login_check_routes_on_credentials() {
        let root = doc_root(&[("welcome.html", "w"), ("logError.html", "e")]);
        let users = users_with(&[("alice", "secret1")]);
        let mut db = FakeDb { inserted: vec![] };

        let raw = b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 25\r\n\r\nuser=alice&passwd=secret1";
        let mut conn = request(Arc::clone(&root), raw);
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(&conn.file_map.as_ref().unwrap()[..], b"w");

        let raw = b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 23\r\n\r\nuser=alice&passwd=wrong";
        let mut conn = request(Arc::clone(&root), raw);
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(&conn.file_map.as_ref().unwrap()[..], b"e");
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn register_check_inserts_and_serves_login_page() {
        let root = doc_root(&[("log.html", "l"), ("registerError.html", "re")]);
        let users = users_with(&[("alice", "secret1")]);
        let mut db = FakeDb { inserted: vec![] };

        let raw = b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 20\r\n\r\nuser=newbob&passwd=p";
        let mut conn = request(Arc::clone(&root), raw);
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(&conn.file_map.as_ref().unwrap()[..], b"l");
        assert!(users.verify("newbob", "p"));
        assert_eq!(db.inserted.len(), 1);

        // Duplicate name serves the error page and skips the DB.
        let raw = b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 20\r\n\r\nuser=newbob&passwd=q";
        let mut conn = request(Arc::clone(&root), raw);
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(&conn.file_map.as_ref().unwrap()[..], b"re");
        assert_eq!(db.inserted.len(), 1);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn malformed_form_is_bad_request() {
        let root = doc_root(&[]);
        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };

        let raw = b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 7\r\n\r\ngarbage";
        let mut conn = request(Arc::clone(&root), raw);
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::BadRequest);
        fs::remove_dir_all(&*root).ok();
    }

    #[test]
    fn zero_length_file_skips_the_map() {
        let root = doc_root(&[("empty.html", "")]);
        let users = users_with(&[]);
        let mut db = FakeDb { inserted: vec![] };

        let mut conn = request(Arc::clone(&root), b"GET /empty.html HTTP/1.1\r\n\r\n");
        assert_eq!(conn.do_request(&users, &mut db), HttpCode::FileRequest);
        assert_eq!(conn.file_len, 0);
        assert!(conn.file_map.is_none());
        fs::remove_dir_all(&*root).ok();
    }
}
