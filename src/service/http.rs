//! HTTP surface: the admin routes (`OPTIONS /<db>`, `POST /create`,
//! `POST /mount`, `POST /unmount`) and the REST-style data-plane routes
//! (`GET/PUT/DELETE /<db>/<key>`, `GET /<db>/?id=&n=` cursor scan). Parsed by
//! hand in the same style as [crate::proto::upgrade]'s handshake reader,
//! since this crate carries no general-purpose HTTP server dependency.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    path::Path,
};

use serde_json::json;

use crate::{
    database::Mode,
    err_at,
    proto::upgrade::PROTOCOL_TOKEN,
    service::{
        close_mount, create_mount,
        mount::MountTable,
        open_mount,
        session::{decode_recid, encode_recid},
    },
    Result,
};

/// A parsed request line, headers (lower-cased keys), and body.
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse a request line, headers, and (if `Content-Length` is present) a
    /// body off `stream`. Serves both the `Upgrade` handshake and the plain
    /// HTTP routes below; [Request::is_upgrade] tells them apart.
    pub fn read<R: Read>(stream: R) -> Result<Request> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        err_at!(IOError, reader.read_line(&mut line))?;

        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let target = parts.next().unwrap_or("/").to_string();

        let mut headers = HashMap::new();
        loop {
            let mut header = String::new();
            let n = err_at!(IOError, reader.read_line(&mut header))?;
            if n == 0 || header.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let body = match headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            Some(len) => {
                let mut body = vec![0u8; len];
                err_at!(IOError, reader.read_exact(&mut body))?;
                body
            }
            None => Vec::new(),
        };

        let (path, query) = split_target(&target);
        Ok(Request {
            method,
            path,
            query,
            headers,
            body,
        })
    }

    /// Whether this is the `Upgrade: slingdb` handshake that switches the
    /// connection into the binary protocol, rather than a plain HTTP request.
    pub fn is_upgrade(&self) -> bool {
        self.method == "GET"
            && self
                .headers
                .get("upgrade")
                .map(|v| v.to_ascii_lowercase().contains(PROTOCOL_TOKEN))
                .unwrap_or(false)
            && self
                .headers
                .get("connection")
                .map(|v| v.to_ascii_lowercase().contains("upgrade"))
                .unwrap_or(false)
    }
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let mut query = HashMap::new();
    let (path, qs) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    for pair in qs.split('&').filter(|s| !s.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) => {
                query.insert(k.to_string(), v.to_string());
            }
            None => {
                query.insert(pair.to_string(), String::new());
            }
        }
    }
    (path.to_string(), query)
}

/// Write a `status reason` response with a JSON body.
pub fn write_json<W: Write>(mut stream: W, status: u16, reason: &str, body: &serde_json::Value) -> Result<()> {
    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    err_at!(IOError, stream.write_all(response.as_bytes()))
}

/// Write a `status reason` response with arbitrary headers and a raw body,
/// for routes that carry an opaque record value rather than JSON.
fn write_raw<W: Write>(
    mut stream: W,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    err_at!(IOError, stream.write_all(response.as_bytes()))?;
    err_at!(IOError, stream.write_all(body))
}

/// Dispatch one HTTP request, writing a response and returning once done.
pub fn handle<S: Read + Write>(mounts: &MountTable, dbdir: &Path, stream: &mut S, req: &Request) -> Result<()> {
    let trimmed = req.path.trim_start_matches('/');
    let mut segments = trimmed.splitn(2, '/');
    let first = segments.next().unwrap_or("");
    let rest = segments.next();

    match (req.method.as_str(), first, rest) {
        ("POST", "create", None) => create(mounts, dbdir, stream, req),
        ("POST", "mount", None) => mount(mounts, dbdir, stream, req),
        ("POST", "unmount", None) => unmount(mounts, stream, req),
        ("OPTIONS", db, None) => options(mounts, dbdir, stream, db),
        ("GET", db, Some("")) => scan(mounts, stream, db, req),
        ("GET", db, Some(key)) => get_key(mounts, stream, db, key),
        ("PUT", db, Some(key)) => put_key(mounts, stream, db, key, req),
        ("DELETE", db, Some(key)) => delete_key(mounts, stream, db, key),
        _ => write_json(stream, 404, "Not Found", &json!({"error": "unknown route"})),
    }
}

fn options<S: Write>(mounts: &MountTable, dbdir: &Path, stream: &mut S, name: &str) -> Result<()> {
    let mount = match mounts.get(name) {
        Some(mount) => mount,
        None => return write_json(stream, 404, "Not Found", &json!({"error": "no such database"})),
    };
    let db = mount.lock();
    let body = json!({
        "name": mount.name(),
        "epoch": db.epoch(),
        "dbdir": dbdir.to_string_lossy(),
        "dirty": db.dirty(),
        "num_shards": db.num_shards(),
    });
    write_json(stream, 200, "OK", &body)
}

fn name_arg(req: &Request) -> Result<&str> {
    match req.query.get("name") {
        Some(name) => Ok(name.as_str()),
        None => err_at!(InvalidInput, msg: "missing required query parameter `name`"),
    }
}

fn create<S: Write>(mounts: &MountTable, dbdir: &Path, stream: &mut S, req: &Request) -> Result<()> {
    let name = match name_arg(req) {
        Ok(name) => name,
        Err(err) => return write_json(stream, 400, "Bad Request", &json!({"error": err.to_string()})),
    };
    let num_shards: usize = req
        .query
        .get("num_shards")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    match create_mount(mounts, dbdir, name, num_shards) {
        Ok(()) => write_json(stream, 200, "OK", &json!({"name": name})),
        Err(err) => write_json(stream, 500, "Internal Server Error", &json!({"error": err.to_string()})),
    }
}

fn mount<S: Write>(mounts: &MountTable, dbdir: &Path, stream: &mut S, req: &Request) -> Result<()> {
    let name = match name_arg(req) {
        Ok(name) => name,
        Err(err) => return write_json(stream, 400, "Bad Request", &json!({"error": err.to_string()})),
    };
    let recover = req.query.get("recover").map(|v| v == "1").unwrap_or(false);

    match open_mount(mounts, dbdir, name, recover) {
        Ok(()) => write_json(stream, 200, "OK", &json!({"name": name})),
        Err(err) => write_json(stream, 500, "Internal Server Error", &json!({"error": err.to_string()})),
    }
}

fn unmount<S: Write>(mounts: &MountTable, stream: &mut S, req: &Request) -> Result<()> {
    let name = match name_arg(req) {
        Ok(name) => name,
        Err(err) => return write_json(stream, 400, "Bad Request", &json!({"error": err.to_string()})),
    };

    match close_mount(mounts, name) {
        Ok(()) => write_json(stream, 200, "OK", &json!({"name": name})),
        Err(err) => write_json(stream, 404, "Not Found", &json!({"error": err.to_string()})),
    }
}

fn parse_mode(req: &Request) -> Mode {
    match req.headers.get("mode").map(|v| v.as_str()) {
        Some("add") => Mode::Add,
        Some("ordered") => Mode::Ordered,
        Some("newer") => Mode::Newer,
        _ => Mode::Overwrite,
    }
}

/// `GET /<db>/<key>`: the record's value as the body, `Key`/`Version`
/// headers echoing the request.
fn get_key<S: Write>(mounts: &MountTable, stream: &mut S, db: &str, key: &str) -> Result<()> {
    let mount = match mounts.get(db) {
        Some(mount) => mount,
        None => return write_json(stream, 404, "Not Found", &json!({"error": "no such database"})),
    };
    match mount.lock().get(key.as_bytes())? {
        Some(rec) => write_raw(
            stream,
            200,
            "OK",
            &[("Key", key.to_string()), ("Version", rec.version.to_string())],
            &rec.value,
        ),
        None => write_json(stream, 404, "Not Found", &json!({"error": "no such key"})),
    }
}

/// `PUT /<db>/<key>`: body is the new value, `Mode` header selects the
/// conflict-resolution policy, response carries `Outcome`/`RecordID`. No
/// recid equivalent comes back from [crate::database::Database::put]; the
/// stored version is reported as `RecordID` instead.
fn put_key<S: Write>(mounts: &MountTable, stream: &mut S, db: &str, key: &str, req: &Request) -> Result<()> {
    let mount = match mounts.get(db) {
        Some(mount) => mount,
        None => return write_json(stream, 404, "Not Found", &json!({"error": "no such database"})),
    };
    let version: u64 = req.headers.get("version").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mode = parse_mode(req);

    let result = mount.lock().put(key.as_bytes(), version, &req.body, mode)?;
    write_raw(
        stream,
        200,
        "OK",
        &[
            ("Outcome", format!("{:?}", result.status)),
            ("RecordID", result.version.to_string()),
        ],
        &[],
    )
}

/// `DELETE /<db>/<key>`.
fn delete_key<S: Write>(mounts: &MountTable, stream: &mut S, db: &str, key: &str) -> Result<()> {
    let mount = match mounts.get(db) {
        Some(mount) => mount,
        None => return write_json(stream, 404, "Not Found", &json!({"error": "no such database"})),
    };
    if mount.lock().delete(key.as_bytes())? {
        write_json(stream, 200, "OK", &json!({"key": key}))
    } else {
        write_json(stream, 404, "Not Found", &json!({"error": "no such key"}))
    }
}

const SCAN_BOUNDARY: &str = "slingdb-cursor-scan";

/// `GET /<db>/?id=<recid>&n=<batch>`: a `multipart/mixed` cursor scan, one
/// part per record, each carrying `Key`/`Version` headers. The recid to
/// resume from is echoed back in a `Next-RecordID` header on the envelope.
fn scan<S: Write>(mounts: &MountTable, stream: &mut S, db: &str, req: &Request) -> Result<()> {
    let mount = match mounts.get(db) {
        Some(mount) => mount,
        None => return write_json(stream, 404, "Not Found", &json!({"error": "no such database"})),
    };
    let recid: u64 = req.query.get("id").and_then(|v| v.parse().ok()).unwrap_or(0);
    let batch: usize = req.query.get("n").and_then(|v| v.parse().ok()).unwrap_or(100);

    let mut cursor = decode_recid(recid);
    let records = {
        let mut db = mount.lock();
        db.next(&mut cursor, batch, false)?
    };
    let next_recid = encode_recid(&cursor);

    let mut body = Vec::new();
    for rec in &records {
        body.extend_from_slice(format!("--{}\r\n", SCAN_BOUNDARY).as_bytes());
        body.extend_from_slice(format!("Key: {}\r\n", String::from_utf8_lossy(&rec.key)).as_bytes());
        body.extend_from_slice(format!("Version: {}\r\n", rec.version).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&rec.value);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", SCAN_BOUNDARY).as_bytes());

    write_raw(
        stream,
        200,
        "OK",
        &[
            ("Content-Type", format!("multipart/mixed; boundary={}", SCAN_BOUNDARY)),
            ("Next-RecordID", next_recid.to_string()),
        ],
        &body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target_parses_query_string() {
        let (path, query) = split_target("/mount?name=orders&recover=1");
        assert_eq!(path, "/mount");
        assert_eq!(query.get("name"), Some(&"orders".to_string()));
        assert_eq!(query.get("recover"), Some(&"1".to_string()));
    }

    #[test]
    fn test_split_target_with_no_query() {
        let (path, query) = split_target("/orders");
        assert_eq!(path, "/orders");
        assert!(query.is_empty());
    }

    #[test]
    fn test_request_read_captures_headers_and_body() {
        let raw = b"PUT /orders/k1 HTTP/1.1\r\nMode: add\r\nContent-Length: 5\r\n\r\nhello";
        let req = Request::read(&raw[..]).unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/orders/k1");
        assert_eq!(req.headers.get("mode"), Some(&"add".to_string()));
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn test_is_upgrade_requires_both_headers() {
        let raw = b"GET /orders HTTP/1.1\r\nUpgrade: slingdb\r\nConnection: Upgrade\r\n\r\n";
        let req = Request::read(&raw[..]).unwrap();
        assert!(req.is_upgrade());

        let raw = b"GET /orders/k1 HTTP/1.1\r\n\r\n";
        let req = Request::read(&raw[..]).unwrap();
        assert!(!req.is_upgrade());
    }
}
