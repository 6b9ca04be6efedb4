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

//! The remote side of the back-channel: collect paths, dial the
//! forwarded port, send one request, interpret one response.

use std::{
    env,
    io::{self, BufReader, Write as _},
    net::TcpStream,
    path::Path,
};

use anyhow::{anyhow, Context};
use bcvi_protocol::{Code, Request, Response};
use tracing::info;

use super::consts;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The connection descriptor a remote shell carries in $BCVI_CONF,
/// planted there by the TERM unpacker at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnDescriptor {
    /// Short label for this remote host, chosen on the workstation.
    pub host_alias: String,
    /// Host to dial; in practice localhost, the tunnel terminus.
    pub gateway: String,
    pub port: u16,
    pub auth_key: String,
}

impl ConnDescriptor {
    /// Parse the colon separated `alias:gateway:port:auth_key` form.
    /// Any malformation is fatal before a socket is opened.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 4 {
            return Err(anyhow!(
                "malformed {}: want alias:gateway:port:auth_key, got '{}'",
                consts::BCVI_CONF_VAR,
                raw
            ));
        }
        let port: u16 = parts[2]
            .parse()
            .with_context(|| format!("bad port in {} '{}'", consts::BCVI_CONF_VAR, raw))?;
        Ok(ConnDescriptor {
            host_alias: String::from(parts[0]),
            gateway: String::from(parts[1]),
            port,
            auth_key: String::from(parts[3]),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let raw = env::var(consts::BCVI_CONF_VAR).map_err(|_| {
            anyhow!(
                "{} is not set; log in through `bcvi --wrap-ssh` to establish the back-channel",
                consts::BCVI_CONF_VAR
            )
        })?;
        Self::parse(&raw)
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// The version the listener advertized in its greeting.
    pub server_version: String,
}

impl Client {
    /// Dial the back-channel and consume the greeting.
    pub fn dial(conf: &ConnDescriptor) -> anyhow::Result<Self> {
        let stream =
            TcpStream::connect((conf.gateway.as_str(), conf.port)).with_context(|| {
                format!("connecting to the back-channel at {}:{}", conf.gateway, conf.port)
            })?;
        let writer = stream.try_clone().context("cloning stream handle")?;
        let mut reader = BufReader::new(stream);
        let server_version = bcvi_protocol::read_greeting(&mut reader)?;
        info!("listener greeted us with version {}", server_version);
        Ok(Client { reader, writer, server_version })
    }

    pub fn send(&mut self, req: &Request) -> anyhow::Result<Response> {
        req.write_to(&mut self.writer).context("writing request")?;
        Response::read_from(&mut self.reader).context("reading response")
    }
}

/// True for `+N` line-number directives, which are forwarded to the
/// editor untouched rather than treated as paths.
pub fn is_line_directive(tok: &str) -> bool {
    match tok.strip_prefix('+') {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Resolve each non-directive path against the given working
/// directory. Translating an already absolute path is the identity.
pub fn translate_paths(paths: &[String], cwd: &Path, xlate: bool) -> Vec<String> {
    paths
        .iter()
        .map(|p| {
            if !xlate || is_line_directive(p) || Path::new(p).is_absolute() {
                p.clone()
            } else {
                cwd.join(p).to_string_lossy().into_owned()
            }
        })
        .collect()
}

/// The default client mode: one request, one response, exit.
pub fn run(command: &str, files: &[String], no_path_xlate: bool) -> anyhow::Result<()> {
    let conf = ConnDescriptor::from_env()?;
    let cwd = env::current_dir().context("resolving the current directory")?;
    let paths = translate_paths(files, &cwd, !no_path_xlate);

    let mut body = String::new();
    for p in &paths {
        body.push_str(p);
        body.push('\n');
    }

    let mut client = Client::dial(&conf)?;
    let resp = client.send(&Request {
        auth_key: conf.auth_key.clone(),
        host_alias: conf.host_alias.clone(),
        command: String::from(command),
        body: body.into_bytes(),
    })?;

    match resp.code {
        Code::Success => Ok(()),
        Code::ResponseFollows => {
            if let Some(doc) = resp.document {
                io::stdout().write_all(&doc.body).context("writing response document")?;
            }
            Ok(())
        }
        code => Err(anyhow!("listener refused the request: {} {}", code as u32, resp.message)),
    }
}

/// Fetch a document from the listener, e.g. the commands_pod help
/// text. Used by --help to reflect handlers that only exist on the
/// workstation side.
pub fn fetch_document(command: &str) -> anyhow::Result<Vec<u8>> {
    let conf = ConnDescriptor::from_env()?;
    let mut client = Client::dial(&conf)?;
    let resp = client.send(&Request {
        auth_key: conf.auth_key.clone(),
        host_alias: conf.host_alias.clone(),
        command: String::from(command),
        body: vec![],
    })?;
    match resp.document {
        Some(doc) => Ok(doc.body),
        None => Err(anyhow!("listener sent no document: {} {}", resp.code as u32, resp.message)),
    }
}

/// The --version mode: always the client version, plus the listener
/// version when a back-channel is configured and answering.
pub fn run_version() -> anyhow::Result<()> {
    println!("bcvi {}", VERSION);
    if let Ok(conf) = ConnDescriptor::from_env() {
        match Client::dial(&conf) {
            Ok(client) => println!("listener {}", client.server_version),
            Err(err) => info!("no listener version available: {:?}", err),
        }
    }
    Ok(())
}
