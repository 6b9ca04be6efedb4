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

use std::{collections::HashMap, io::Write, process, thread};

use anyhow::{anyhow, Context};
use bcvi_protocol::{Request, Response};
use tracing::{info, warn};

use crate::{client, config, config::PathRewrite, consts};

/// Everything a handler may need from the listener, copied or
/// borrowed per connection. Handlers share no mutable state with
/// the accept loop or with each other.
pub struct HandlerCtx<'a> {
    /// The client's self-reported host label. Untrusted; only used
    /// for display and path namespacing.
    pub host_alias: &'a str,
    pub config: &'a config::Config,
    pub home_dir: &'a str,
}

/// What the connection engine should do after a handler returns.
pub enum Outcome {
    /// Send the terminal 200 response.
    Done,
    /// The handler already streamed its own terminal response.
    Responded,
}

/// A named command the listener can execute on behalf of a remote
/// client. Implement this and register it to extend a listener from
/// a wrapping binary; per-user extensions go in config.toml instead.
pub trait Handler: Send + Sync {
    /// A short POD description, surfaced by --help on remote hosts
    /// through the commands_pod command.
    fn doc(&self) -> String;

    fn run(
        &self,
        ctx: &HandlerCtx,
        registry: &Registry,
        req: &Request,
        out: &mut dyn Write,
    ) -> anyhow::Result<Outcome>;
}

/// The command dispatch table. Immutable once the listener starts
/// serving, so connection threads can share it freely.
pub struct Registry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut r = Registry { handlers: HashMap::new() };
        r.register("vi", Box::new(Editor { wait: false }));
        r.register("viwait", Box::new(Editor { wait: true }));
        r.register("scpd", Box::new(CopyToDesktop {}));
        r.register("commands_pod", Box::new(CommandsPod {}));
        r
    }

    pub fn from_config(config: &config::Config) -> Self {
        let mut r = Self::new();
        r.load_config_commands(config);
        r
    }

    /// Register the [[commands]] entries from config.toml.
    pub fn load_config_commands(&mut self, config: &config::Config) {
        if let Some(commands) = &config.commands {
            for c in commands {
                let doc = c
                    .doc
                    .clone()
                    .unwrap_or_else(|| format!("Run C<{}> with the request paths.", c.run));
                self.register(&c.name, Box::new(Custom { run: c.run.clone(), doc }));
            }
        }
    }

    /// Last registration wins.
    pub fn register(&mut self, name: &str, handler: Box<dyn Handler>) {
        if self.handlers.insert(String::from(name), handler).is_some() {
            warn!("command '{}' registered more than once, the last registration wins", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }

    pub fn doc_for(&self, name: &str) -> Option<String> {
        self.handlers.get(name).map(|h| h.doc())
    }

    /// The documentation for every registered command, as one POD
    /// document.
    pub fn commands_pod(&self) -> String {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();

        let mut pod = String::from("=head1 COMMANDS\n\n=over 4\n\n");
        for name in names {
            pod.push_str(&format!("=item C<{}>\n\n{}\n\n", name, self.handlers[name].doc()));
        }
        pod.push_str("=back\n");
        pod
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point the local editor at a path that lives on the remote host.
pub fn rewrite_path(mode: &PathRewrite, alias: &str, path: &str) -> String {
    match mode {
        // absolute remote paths come out as scp://alias//path,
        // which editors with netrw-style remote support edit in
        // place over ssh
        PathRewrite::ScpUri => format!("scp://{}/{}", alias, path),
        PathRewrite::TmpMount => {
            if path.starts_with('/') {
                format!("/tmp/{}{}", alias, path)
            } else {
                String::from(path)
            }
        }
    }
}

// The body of the built-in commands is an LF separated path list.
fn body_paths(req: &Request) -> anyhow::Result<Vec<String>> {
    let text = std::str::from_utf8(&req.body).context("request body is not utf-8")?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(String::from).collect())
}

fn command_for(line: &str) -> anyhow::Result<process::Command> {
    let argv = shell_words::split(line).with_context(|| format!("parsing command '{}'", line))?;
    if argv.is_empty() {
        return Err(anyhow!("empty command line"));
    }
    let mut cmd = process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    Ok(cmd)
}

/// The `vi` and `viwait` commands.
struct Editor {
    wait: bool,
}

impl Handler for Editor {
    fn doc(&self) -> String {
        if self.wait {
            String::from(
                "Like C<vi>, but holds the connection open until the editor exits. \
                 Lets a remote sudoedit keep its temp file until the edit is done.",
            )
        } else {
            String::from(
                "Launch the local editor on each path in the request body. \
                 Returns as soon as the editor has started.",
            )
        }
    }

    fn run(
        &self,
        ctx: &HandlerCtx,
        _registry: &Registry,
        req: &Request,
        _out: &mut dyn Write,
    ) -> anyhow::Result<Outcome> {
        let mode = ctx.config.path_rewrite.clone().unwrap_or_default();
        let args: Vec<String> = body_paths(req)?
            .iter()
            .map(|p| {
                if client::is_line_directive(p) {
                    p.clone()
                } else {
                    rewrite_path(&mode, ctx.host_alias, p)
                }
            })
            .collect();

        let editor =
            ctx.config.editor.clone().unwrap_or(String::from(consts::DEFAULT_EDITOR));
        let mut cmd = command_for(&editor).context("resolving configured editor")?;
        cmd.args(&args);

        info!("launching editor for '{}': {:?}", ctx.host_alias, args);
        let mut child = cmd.spawn().with_context(|| format!("spawning editor '{}'", editor))?;
        if self.wait {
            let status = child.wait().context("waiting for editor")?;
            if !status.success() {
                warn!("editor exited with {}", status);
            }
        } else {
            // collect the detached child so it cannot linger as a
            // zombie
            thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Ok(Outcome::Done)
    }
}

/// The `scpd` command.
struct CopyToDesktop {}

impl Handler for CopyToDesktop {
    fn doc(&self) -> String {
        String::from(
            "Copy each path in the request body from the remote host to the local desktop.",
        )
    }

    fn run(
        &self,
        ctx: &HandlerCtx,
        _registry: &Registry,
        req: &Request,
        _out: &mut dyn Write,
    ) -> anyhow::Result<Outcome> {
        let paths = body_paths(req)?;
        if paths.is_empty() {
            return Ok(Outcome::Done);
        }

        let remote_files: Vec<String> =
            paths.iter().map(|p| format!("{}:{}", ctx.host_alias, p)).collect();
        let desktop = ctx
            .config
            .desktop_dir
            .clone()
            .unwrap_or_else(|| format!("{}/Desktop", ctx.home_dir));

        let scp = ctx.config.scp.clone().unwrap_or(String::from(consts::DEFAULT_SCP));
        let mut cmd = command_for(&scp).context("resolving configured scp")?;
        cmd.arg("-q").arg("--").args(&remote_files).arg(&desktop);

        info!("copying {:?} to {}", remote_files, desktop);
        let status = cmd.status().with_context(|| format!("running '{}'", scp))?;
        if !status.success() {
            // child exit codes are never reported on the wire
            warn!("scp exited with {}", status);
        }
        Ok(Outcome::Done)
    }
}

/// The `commands_pod` command: registry introspection, so --help on
/// a remote host can document commands that only the workstation
/// listener knows about.
struct CommandsPod {}

impl Handler for CommandsPod {
    fn doc(&self) -> String {
        String::from("Send back the documentation for every registered command as POD.")
    }

    fn run(
        &self,
        _ctx: &HandlerCtx,
        registry: &Registry,
        _req: &Request,
        mut out: &mut dyn Write,
    ) -> anyhow::Result<Outcome> {
        let resp = Response::with_document("text/pod", registry.commands_pod().into_bytes());
        resp.write_to(&mut out)?;
        Ok(Outcome::Responded)
    }
}

/// A [[commands]] entry from config.toml. Paths are passed through
/// verbatim; the configured command decides what to make of them.
struct Custom {
    run: String,
    doc: String,
}

impl Handler for Custom {
    fn doc(&self) -> String {
        self.doc.clone()
    }

    fn run(
        &self,
        ctx: &HandlerCtx,
        _registry: &Registry,
        req: &Request,
        _out: &mut dyn Write,
    ) -> anyhow::Result<Outcome> {
        let mut cmd = command_for(&self.run)?;
        cmd.args(body_paths(req)?);

        info!("running custom command '{}' for '{}'", self.run, ctx.host_alias);
        let status = cmd.status().with_context(|| format!("running '{}'", self.run))?;
        if !status.success() {
            warn!("custom command '{}' exited with {}", self.run, status);
        }
        Ok(Outcome::Done)
    }
}
