// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    fmt,
    io::{BufRead, Read, Write},
};

use anyhow::{anyhow, Context};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The status codes the listener can answer with.
///
/// The greeting code is included even though it is written before
/// any request has been read so that both sides share a single
/// table of known codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Written to every connection as soon as it is accepted,
    /// before any input is read.
    Ready = 100,
    /// The handler completed normally.
    Success = 200,
    /// A document block plus body follows the status line.
    ResponseFollows = 300,
    /// The Auth-Key header was absent or did not match the
    /// listener's current key.
    PermissionDenied = 900,
    /// The Command header named a handler the listener does
    /// not know.
    UnrecognisedCommand = 910,
}

impl Code {
    /// The short text phrase written after the numeric code.
    pub fn message(&self) -> &'static str {
        match self {
            Code::Ready => "Ready",
            Code::Success => "Success",
            Code::ResponseFollows => "Response follows",
            Code::PermissionDenied => "Permission denied",
            Code::UnrecognisedCommand => "Unrecognised command",
        }
    }
}

impl TryFrom<u32> for Code {
    type Error = anyhow::Error;

    fn try_from(v: u32) -> anyhow::Result<Self> {
        match v {
            100 => Ok(Code::Ready),
            200 => Ok(Code::Success),
            300 => Ok(Code::ResponseFollows),
            900 => Ok(Code::PermissionDenied),
            910 => Ok(Code::UnrecognisedCommand),
            _ => Err(anyhow!("unknown response code {}", v)),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", *self as u32, self.message())
    }
}

/// A single back-channel request.
///
/// On the wire a request is a block of `Name: value` header lines
/// terminated by a blank line, followed by exactly `Content-Length`
/// bytes of body. All lines end in a bare LF. Handlers interpret
/// the body per-command; for the built-in commands it is a newline
/// separated path list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// The credential presented by the client. The listener rejects
    /// the request with code 900 unless it matches its current key.
    pub auth_key: String,
    /// Self-reported label for the remote host. Untrusted; only
    /// used for display and path namespacing.
    pub host_alias: String,
    /// The name of the handler to invoke.
    pub command: String,
    /// Opaque bytes after the header block.
    pub body: Vec<u8>,
}

impl Request {
    pub fn write_to<W>(&self, w: &mut W) -> anyhow::Result<()>
    where
        W: Write,
    {
        write!(
            w,
            "Auth-Key: {}\nHost-Alias: {}\nCommand: {}\nContent-Length: {}\n\n",
            self.auth_key,
            self.host_alias,
            self.command,
            self.body.len()
        )
        .context("writing request headers")?;
        w.write_all(&self.body).context("writing request body")?;
        w.flush().context("flushing request")?;
        Ok(())
    }

    pub fn read_from<R>(r: &mut R) -> anyhow::Result<Self>
    where
        R: BufRead,
    {
        let headers = read_header_block(r)?;
        let body = read_sized_body(r, &headers)?;
        Ok(Request {
            auth_key: header_value(&headers, "auth_key"),
            host_alias: header_value(&headers, "host_alias"),
            command: header_value(&headers, "command"),
            body,
        })
    }
}

/// A document payload carried by a code 300 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A response: a status line, optionally followed (only for code
/// 300) by a header block and body in the same shape as a request
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub message: String,
    pub document: Option<Document>,
}

impl Response {
    pub fn new(code: Code) -> Self {
        Response { code, message: String::from(code.message()), document: None }
    }

    pub fn with_document(content_type: &str, body: Vec<u8>) -> Self {
        Response {
            code: Code::ResponseFollows,
            message: String::from(Code::ResponseFollows.message()),
            document: Some(Document { content_type: String::from(content_type), body }),
        }
    }

    pub fn write_to<W>(&self, w: &mut W) -> anyhow::Result<()>
    where
        W: Write,
    {
        write!(w, "{} {}\n", self.code as u32, self.message).context("writing status line")?;
        if let Some(doc) = &self.document {
            write!(
                w,
                "Content-Length: {}\nContent-Type: {}\n\n",
                doc.body.len(),
                doc.content_type
            )
            .context("writing document headers")?;
            w.write_all(&doc.body).context("writing document body")?;
        }
        w.flush().context("flushing response")?;
        Ok(())
    }

    pub fn read_from<R>(r: &mut R) -> anyhow::Result<Self>
    where
        R: BufRead,
    {
        let line = read_line(r)?.ok_or(anyhow!("unexpected eof waiting for response"))?;
        let (code_str, message) =
            line.split_once(' ').ok_or(anyhow!("unexpected response '{}'", line))?;
        let code: u32 =
            code_str.parse().map_err(|_| anyhow!("unexpected response '{}'", line))?;
        let code = Code::try_from(code)?;

        let document = if let Code::ResponseFollows = code {
            let headers = read_header_block(r)?;
            let body = read_sized_body(r, &headers)?;
            Some(Document { content_type: header_value(&headers, "content_type"), body })
        } else {
            None
        };

        Ok(Response { code, message: String::from(message), document })
    }
}

/// Write the server greeting. The version goes in parentheses so
/// that the client can scrape it back out for `--version`.
pub fn write_greeting<W>(w: &mut W, version: &str) -> anyhow::Result<()>
where
    W: Write,
{
    write!(w, "{} Ready ({})\n", Code::Ready as u32, version).context("writing greeting")?;
    w.flush().context("flushing greeting")?;
    Ok(())
}

/// Read and check the server greeting, returning the advertized
/// version. Any malformed greeting is fatal for the caller.
pub fn read_greeting<R>(r: &mut R) -> anyhow::Result<String>
where
    R: BufRead,
{
    let line = read_line(r)?.ok_or(anyhow!("unexpected eof waiting for greeting"))?;
    let (code_str, rest) =
        line.split_once(' ').ok_or(anyhow!("unexpected greeting '{}'", line))?;
    let code: u32 = code_str.parse().map_err(|_| anyhow!("unexpected greeting '{}'", line))?;
    if Code::try_from(code)? != Code::Ready {
        return Err(anyhow!("unexpected greeting code {}", code));
    }

    let open = rest.find('(').ok_or(anyhow!("greeting has no version: '{}'", line))?;
    let close = rest.rfind(')').ok_or(anyhow!("greeting has no version: '{}'", line))?;
    if close <= open {
        return Err(anyhow!("greeting has no version: '{}'", line));
    }
    Ok(String::from(&rest[open + 1..close]))
}

/// Canonicalize a header name: lowercase with `-` mapped to `_`,
/// so that `HOST-ALIAS` and `host_alias` land on the same key.
pub fn canonical_header_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

fn header_value(headers: &HashMap<String, String>, name: &str) -> String {
    headers.get(name).cloned().unwrap_or_default()
}

// Reads one LF terminated line, without the terminator. A stray CR
// before the LF is stripped rather than rejected. None means clean
// EOF before any byte was read.
fn read_line<R>(r: &mut R) -> anyhow::Result<Option<String>>
where
    R: BufRead,
{
    let mut line = String::new();
    let nread = r.read_line(&mut line).context("reading protocol line")?;
    if nread == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(anyhow!("truncated protocol line '{}'", line));
    }
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn read_header_block<R>(r: &mut R) -> anyhow::Result<HashMap<String, String>>
where
    R: BufRead,
{
    let mut headers = HashMap::new();
    loop {
        let line =
            read_line(r)?.ok_or(anyhow!("unexpected eof in the middle of a header block"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) =
            line.split_once(':').ok_or(anyhow!("malformed header line '{}'", line))?;
        headers.insert(canonical_header_name(name), String::from(value.trim()));
    }
}

// The body is exactly Content-Length bytes, no more, no less.
fn read_sized_body<R>(r: &mut R, headers: &HashMap<String, String>) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let len: usize = headers
        .get("content_length")
        .ok_or(anyhow!("missing Content-Length header"))?
        .parse()
        .context("parsing Content-Length")?;
    let mut body = vec![0; len];
    r.read_exact(&mut body).context("reading sized body")?;
    Ok(body)
}

#[cfg(test)]
mod test {
    use std::io;
    use std::io::Read as _;

    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request {
            auth_key: String::from("deadbeef"),
            host_alias: String::from("pluto"),
            command: String::from("vi"),
            body: Vec::from(&b"/etc/hosts\n"[..]),
        };

        let mut wire = vec![];
        req.write_to(&mut wire).expect("write to succeed");
        let mut cursor = io::Cursor::new(wire);
        let round_tripped = Request::read_from(&mut cursor).expect("parse to succeed");
        assert_eq!(req, round_tripped);
    }

    #[test]
    fn request_headers_canonicalize() {
        let wire = "AUTH-KEY: deadbeef\nHOST-ALIAS: pluto\nCOMMAND: vi\nCONTENT-LENGTH: 0\n\n";
        let mut cursor = io::Cursor::new(wire);
        let req = Request::read_from(&mut cursor).expect("parse to succeed");
        assert_eq!(req.auth_key, "deadbeef");
        assert_eq!(req.host_alias, "pluto");
        assert_eq!(req.command, "vi");
        assert_eq!(req.body.len(), 0);
    }

    #[test]
    fn request_body_is_exact_length() {
        // 12 bytes of body, then trailing junk that belongs to
        // nobody. The parser must leave the junk unread.
        let wire =
            b"Auth-Key: k\nHost-Alias: h\nCommand: vi\nContent-Length: 12\n\n/etc/hosts\r\nJUNK";
        let mut cursor = io::Cursor::new(&wire[..]);
        let req = Request::read_from(&mut cursor).expect("parse to succeed");
        assert_eq!(req.body, b"/etc/hosts\r\n");

        let mut rest = vec![];
        cursor.read_to_end(&mut rest).expect("read to succeed");
        assert_eq!(rest, b"JUNK");
    }

    #[test]
    fn request_truncated_header_block_errors() {
        let wire = "Auth-Key: k\nHost-Alias: h";
        let mut cursor = io::Cursor::new(wire);
        assert!(Request::read_from(&mut cursor).is_err());
    }

    #[test]
    fn response_plain_round_trip() {
        let resp = Response::new(Code::Success);
        let mut wire = vec![];
        resp.write_to(&mut wire).expect("write to succeed");
        assert_eq!(String::from_utf8_lossy(&wire), "200 Success\n");

        let mut cursor = io::Cursor::new(wire);
        let round_tripped = Response::read_from(&mut cursor).expect("parse to succeed");
        assert_eq!(resp, round_tripped);
    }

    #[test]
    fn response_document_round_trip() {
        let resp = Response::with_document("text/pod", Vec::from(&b"=head1 COMMANDS\n"[..]));
        let mut wire = vec![];
        resp.write_to(&mut wire).expect("write to succeed");

        let mut cursor = io::Cursor::new(wire);
        let round_tripped = Response::read_from(&mut cursor).expect("parse to succeed");
        let doc = round_tripped.document.expect("document to be present");
        assert_eq!(doc.content_type, "text/pod");
        assert_eq!(doc.body, b"=head1 COMMANDS\n");
    }

    #[test]
    fn response_non_numeric_code_errors() {
        let mut cursor = io::Cursor::new("garbage response\n");
        assert!(Response::read_from(&mut cursor).is_err());
    }

    #[test]
    fn greeting_round_trip() {
        let mut wire = vec![];
        write_greeting(&mut wire, VERSION).expect("write to succeed");
        let mut cursor = io::Cursor::new(wire);
        let version = read_greeting(&mut cursor).expect("parse to succeed");
        assert_eq!(version, VERSION);
    }

    #[test]
    fn greeting_rejects_other_codes() {
        let mut cursor = io::Cursor::new("200 Success (0.9.0)\n");
        assert!(read_greeting(&mut cursor).is_err());
    }
}
