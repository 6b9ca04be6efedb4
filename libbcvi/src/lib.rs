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

use std::{fs, io, sync::Mutex};

use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod client;
mod config;
mod consts;
mod help;
mod install;
mod listener;
mod ssh;
mod term;
mod user;

pub use listener::handlers::{Handler, HandlerCtx, Outcome, Registry};

/// The command line arguments that bcvi expects: a flat set of
/// mutually exclusive mode flags. These can be directly parsed with
/// clap or manually constructed in order to present some other user
/// interface.
///
/// NOTE: clap's automatic --help and --version are disabled because
/// both flags have bcvi-specific behavior (pager-rendered POD docs,
/// and a client-plus-listener version report).
#[derive(Parser, Debug)]
#[clap(author, about, disable_help_flag = true, disable_version_flag = true)]
pub struct Args {
    #[clap(short = '?', long, action, help = "Show the bcvi documentation through your pager")]
    pub help: bool,

    #[clap(short, long, action, help = "Run the workstation listener")]
    pub listener: bool,

    #[clap(
        long,
        action,
        help = "On listener start, keep the previous auth key instead of generating a new one"
    )]
    pub reuse_auth: bool,

    #[clap(
        long,
        value_name = "HOST",
        num_args = 1..,
        help = "Copy bcvi to each host and install the shell aliases there"
    )]
    pub install: Option<Vec<String>>,

    #[clap(long, action, help = "Add or refresh the bcvi alias block in your shell rc file")]
    pub add_aliases: bool,

    #[clap(
        long,
        action,
        long_help = "Emit shell code that re-exports variables packed into TERM

Meant to be run by the remote login script as:
    eval \"$(bcvi --unpack-term)\""
    )]
    pub unpack_term: bool,

    #[clap(
        short = 's',
        long,
        action,
        help = "Rewrite an ssh command line (given after --) to carry the back-channel, then exec ssh"
    )]
    pub wrap_ssh: bool,

    #[clap(
        short = 'v',
        long,
        action,
        help = "Print the client version and, if reachable, the listener version"
    )]
    pub version: bool,

    #[clap(short, long, action, help = "Skip absolute-path translation in the request body")]
    pub no_path_xlate: bool,

    #[clap(short, long, value_name = "PORT", help = "Override the default per-user port")]
    pub port: Option<u16>,

    #[clap(
        short,
        long,
        value_name = "NAME",
        default_value = "vi",
        help = "The listener command to invoke"
    )]
    pub command: String,

    #[clap(long, value_name = "NAME", help = "Show documentation for a single named command")]
    pub plugin_help: Option<String>,

    #[clap(
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if bcvi is
running in listener mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(
        value_name = "FILE",
        help = "Paths (or +N line directives) for the selected command; with --wrap-ssh, the ssh arguments"
    )]
    pub files: Vec<String>,
}

/// Run the bcvi tool with the given arguments. If a registry is
/// provided, the listener serves its handlers (plus any [[commands]]
/// from config.toml) instead of just the built-in set.
pub fn run(args: Args, registry: Option<Registry>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if args.listener {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res: anyhow::Result<()> = if args.help {
        help::run(&args.config_file)
    } else if let Some(name) = &args.plugin_help {
        help::run_plugin_help(&args.config_file, name)
    } else if args.unpack_term {
        term::run_unpack()
    } else if args.wrap_ssh {
        ssh::run(args.files.clone(), args.port)
    } else if args.listener {
        listener::run(&args.config_file, args.port, args.reuse_auth, registry)
    } else if let Some(hosts) = &args.install {
        install::run_install(hosts)
    } else if args.add_aliases {
        install::run_add_aliases(&args.config_file)
    } else if args.version {
        client::run_version()
    } else {
        client::run(&args.command, &args.files, args.no_path_xlate)
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("bcvi: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
