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
    env,
    io::{self, IsTerminal as _, Write as _},
    process,
};

use anyhow::{anyhow, Context};
use tracing::info;

use super::{client, config, consts, listener::handlers};

const OVERVIEW: &str = "\
=head1 NAME

bcvi - back-channel vi, a command proxy for ssh sessions

=head1 SYNOPSIS

On the workstation:

    bcvi --listener &
    bcvi --add-aliases
    bcvi --wrap-ssh -- somehost

On the remote host (with the aliases installed):

    vi /etc/motd            # opens in the workstation's editor
    suedit /etc/motd        # sudoedit, editing locally
    bcp report.txt          # copy the file to the local desktop

=head1 DESCRIPTION

When you ssh somewhere through `bcvi --wrap-ssh`, a reverse tunnel
comes along for the ride and the remote shell learns about it from
a payload smuggled through $TERM. Commands run on the remote host
are then forwarded back over the tunnel and executed on your
workstation, so \"vi file\" over ssh opens your own graphical
editor instead of whatever the server has.

=head1 OPTIONS

=over 4

=item B<--help>, B<-?>

Show this document through your pager.

=item B<--listener>, B<-l>

Run the workstation listener, replacing any prior one.

=item B<--install> I<host> ...

Copy bcvi to each host and install the shell aliases there.

=item B<--add-aliases>

Add (or refresh) the bcvi alias block in your shell rc file.

=item B<--unpack-term>

Emit shell code that re-exports variables packed into $TERM.
Meant for `eval` in a remote login script.

=item B<--wrap-ssh>, B<-s> -- I<ssh-args>

Rewrite the ssh command line to carry the back-channel, then exec
ssh.

=item B<--version>, B<-v>

Print the client version and, if a listener answers, its version.

=item B<--no-path-xlate>, B<-n>

Do not translate request paths to absolute paths.

=item B<--port>, B<-p> I<port>

Override the default per-user port.

=item B<--command>, B<-c> I<name>

Select the listener command to invoke (default C<vi>).

=item B<--reuse-auth>

On listener start, keep the previous auth key instead of
generating a fresh one.

=item B<--plugin-help> I<name>

Show the documentation for a single named command.

=back

";

/// The --help mode: the built-in document, plus whatever commands
/// the listener on the other end of the back-channel advertizes.
pub fn run(config_file: &Option<String>) -> anyhow::Result<()> {
    let config = config::read_config(config_file)?;
    let mut text = String::from(OVERVIEW);
    text.push_str(&handlers::Registry::from_config(&config).commands_pod());

    if env::var(consts::BCVI_CONF_VAR).is_ok() {
        match client::fetch_document("commands_pod") {
            Ok(body) => {
                text.push_str("\n=head1 LISTENER COMMANDS\n\n");
                text.push_str(&String::from_utf8_lossy(&body));
            }
            Err(err) => {
                info!("could not fetch listener command docs: {:?}", err);
            }
        }
    }

    page(&text)
}

/// The --plugin-help mode.
pub fn run_plugin_help(config_file: &Option<String>, name: &str) -> anyhow::Result<()> {
    let config = config::read_config(config_file)?;
    let registry = handlers::Registry::from_config(&config);
    match registry.doc_for(name) {
        Some(doc) => {
            println!("{}\n\n{}", name, doc);
            Ok(())
        }
        None => Err(anyhow!("no command named '{}' is registered", name)),
    }
}

// Send the text through $PAGER (fallback less). When stdout is not
// a terminal, or the pager will not start, just print it.
fn page(text: &str) -> anyhow::Result<()> {
    if !io::stdout().is_terminal() {
        print!("{}", text);
        return Ok(());
    }

    let pager = env::var(consts::PAGER_VAR).unwrap_or(String::from(consts::DEFAULT_PAGER));
    let argv = match shell_words::split(&pager) {
        Ok(argv) if !argv.is_empty() => argv,
        _ => vec![String::from(consts::DEFAULT_PAGER)],
    };

    let child = process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(process::Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            info!("could not spawn pager '{}': {:?}", pager, err);
            print!("{}", text);
            return Ok(());
        }
    };

    // stdin must drop here to close the pipe, or the pager never
    // sees EOF; a user quitting the pager early shows up as a
    // broken pipe, which is not an error worth reporting
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(text.as_bytes());
    }
    child.wait().context("waiting for pager")?;
    Ok(())
}
