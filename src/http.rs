//! Minimal HTTP/1.1 responder served by the binary.
//!
//! `GET /` returns a small page, any other path is a 404, and anything that
//! does not parse gets a 400 and the connection is closed. Request bodies
//! are skipped according to `Content-Length`.

use std::{fmt::Write as _, net::SocketAddr};

use bytes::{Buf, BytesMut};
use mill_serve::{ConnectionHandler, ConnectionId, Result, Verdict};

const INDEX: &str = "<html><body><h1>mill-serve</h1></body></html>";
const NOT_FOUND: &str = "<h1>404 Not Found</h1>";
const BAD_REQUEST: &str = "<h1>400 Bad Request</h1>";
const NOT_ALLOWED: &str = "<h1>405 Method Not Allowed</h1>";

/// Requests served on this connection.
pub type Session = u64;

pub struct HttpHandler;

struct Request {
    method: String,
    path: String,
    keep_alive: bool,
    /// Bytes of head plus body.
    len: usize,
}

enum Parse {
    Incomplete,
    Malformed,
    Complete(Request),
}

fn parse(data: &[u8]) -> Parse {
    let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Parse::Incomplete;
    };
    let Ok(head) = std::str::from_utf8(&data[..head_end]) else {
        return Parse::Malformed;
    };

    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(path), Some(version), None) = (
        request_line.next(),
        request_line.next(),
        request_line.next(),
        request_line.next(),
    ) else {
        return Parse::Malformed;
    };

    let mut keep_alive = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => return Parse::Malformed,
    };
    let mut body_len = 0usize;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Parse::Malformed;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                keep_alive = false;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case("content-length") {
            match value.parse() {
                Ok(n) => body_len = n,
                Err(_) => return Parse::Malformed,
            }
        }
    }

    let Some(len) = head_end.checked_add(4).and_then(|n| n.checked_add(body_len)) else {
        return Parse::Malformed;
    };
    if data.len() < len {
        return Parse::Incomplete;
    }

    Parse::Complete(Request {
        method: method.to_string(),
        path: path.to_string(),
        keep_alive,
        len,
    })
}

fn respond(output: &mut BytesMut, status: u16, body: &str, keep_alive: bool) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    };
    let connection = if keep_alive { "keep-alive" } else { "close" };

    let mut head = String::with_capacity(128);
    // writing to a String cannot fail
    let _ = write!(
        head,
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: {connection}\r\n\r\n",
        body.len()
    );
    output.extend_from_slice(head.as_bytes());
    output.extend_from_slice(body.as_bytes());
}

impl ConnectionHandler for HttpHandler {
    type Session = Session;

    fn on_connect(&self, conn_id: ConnectionId, peer: SocketAddr) -> Session {
        tracing::trace!(conn = %conn_id, peer = %peer, "http session opened");
        0
    }

    /// Answers every complete request in `input`, stopping after one that
    /// ends the connection.
    fn on_data(&self, served: &mut Session, input: &mut BytesMut, output: &mut BytesMut) -> Result<Verdict> {
        let mut answered = false;

        loop {
            let request = match parse(input) {
                Parse::Incomplete => break,
                Parse::Malformed => {
                    input.clear();
                    respond(output, 400, BAD_REQUEST, false);
                    return Ok(Verdict::Respond { keep_alive: false });
                }
                Parse::Complete(request) => request,
            };
            input.advance(request.len);
            *served += 1;
            answered = true;

            let (status, body) = match (request.method.as_str(), request.path.as_str()) {
                ("GET", "/") => (200, INDEX),
                ("GET", _) => (404, NOT_FOUND),
                _ => (405, NOT_ALLOWED),
            };
            respond(output, status, body, request.keep_alive);

            if !request.keep_alive {
                return Ok(Verdict::Respond { keep_alive: false });
            }
        }

        Ok(if answered {
            Verdict::Respond { keep_alive: true }
        } else {
            Verdict::NeedMore
        })
    }

    fn on_disconnect(&self, conn_id: ConnectionId) {
        tracing::trace!(conn = %conn_id, "http session closed");
    }
}
