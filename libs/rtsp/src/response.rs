use std::collections::HashMap;

/// A parsed RTSP response. Header names are kept case-sensitive as
/// received; the body is passed through verbatim.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_line: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Parses a raw RTSP response. Never fails: syntactic garbage degrades to
/// absent headers and an empty input yields an empty response.
///
/// The `Session` header is decomposed into `Session` and `timeout` entries
/// when it has the `token;timeout=<digits>` shape; any other shape is
/// stored whole under `Session`.
pub fn parse(input: &[u8]) -> Response {
    let input = String::from_utf8_lossy(input);
    if input.is_empty() {
        return Response::default();
    }

    let (head, body) = match input.split_once("\r\n\r\n") {
        Some((head, body)) => (head, body),
        None => (input.as_ref(), ""),
    };

    let mut response = Response {
        body: body.to_string(),
        ..Response::default()
    };

    let mut lines = head.split("\r\n");
    response.status_line = lines.next().unwrap_or_default().to_string();

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name == "Session" {
            insert_session(&mut response.headers, value);
        } else {
            response.headers.insert(name.to_string(), value.to_string());
        }
    }

    response
}

fn insert_session(headers: &mut HashMap<String, String>, value: &str) {
    let parts: Vec<&str> = value.split(';').collect();
    if let [token, param] = parts[..]
        && let Some(timeout) = param.trim().strip_prefix("timeout=")
        && !timeout.is_empty()
        && timeout.bytes().all(|b| b.is_ascii_digit())
    {
        headers.insert("Session".to_string(), token.trim().to_string());
        headers.insert("timeout".to_string(), timeout.to_string());
    } else {
        headers.insert("Session".to_string(), value.to_string());
    }
}
