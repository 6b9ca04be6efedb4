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
    io::{self, IsTerminal as _},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use anyhow::Context;
use bcvi_protocol::{Code, Request, Response};
use tracing::{error, info, instrument, warn};

use super::handlers;
use crate::config;

/// The listener context created once at startup and shared immutably
/// with every connection thread.
pub struct Server {
    config: config::Config,
    registry: handlers::Registry,
    auth_key: String,
    home_dir: String,
}

impl Server {
    pub fn new(
        config: config::Config,
        registry: handlers::Registry,
        auth_key: String,
        home_dir: String,
    ) -> Arc<Self> {
        Arc::new(Server { config, registry, auth_key, home_dir })
    }

    /// The accept loop. Each accepted connection gets its own worker
    /// thread so that a handler blocked on an editor cannot stall the
    /// loop, and a worker crash ends only that connection.
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling connection {}: {:?}", conn_id, err);
                        }
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    info!("retrying interrupted accept");
                    continue;
                }
                Err(err) => {
                    return Err(err).context("accepting connection");
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, stream: TcpStream, conn_id: usize) -> anyhow::Result<()> {
        let mut writer = stream.try_clone().context("cloning stream handle")?;
        let mut reader = io::BufReader::new(stream);

        bcvi_protocol::write_greeting(&mut writer, bcvi_protocol::VERSION)?;

        let req = match Request::read_from(&mut reader) {
            Ok(req) => req,
            Err(err) => {
                info!("closing connection with bad framing: {:?}", err);
                return Ok(());
            }
        };

        if !constant_time_eq(req.auth_key.as_bytes(), self.auth_key.as_bytes()) {
            warn!("rejected request from '{}': bad auth key", req.host_alias);
            // the stderr warning is for humans only, never for logs
            if io::stderr().is_terminal() {
                eprintln!(
                    "bcvi: rejected a request from '{}' with a stale or wrong auth key",
                    req.host_alias
                );
            }
            Response::new(Code::PermissionDenied).write_to(&mut writer)?;
            return Ok(());
        }

        let handler = match self.registry.get(&req.command) {
            Some(h) => h,
            None => {
                info!("unrecognised command '{}' from '{}'", req.command, req.host_alias);
                Response::new(Code::UnrecognisedCommand).write_to(&mut writer)?;
                return Ok(());
            }
        };

        info!("dispatching '{}' for '{}'", req.command, req.host_alias);
        let ctx = handlers::HandlerCtx {
            host_alias: &req.host_alias,
            config: &self.config,
            home_dir: &self.home_dir,
        };
        match handler.run(&ctx, &self.registry, &req, &mut writer)? {
            handlers::Outcome::Done => Response::new(Code::Success).write_to(&mut writer),
            handlers::Outcome::Responded => Ok(()),
        }
    }
}

// Compare the presented key against ours without an early exit, so
// response timing does not leak how much of a guessed key matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut acc = a.len() ^ b.len();
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= (x ^ y) as usize;
    }
    acc == 0
}
