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

use std::{fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use super::user;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let user_info = user::info()?;
        let config_path = state_dir(&user_info.home_dir).join("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The command line to launch for the `vi` and `viwait` handlers.
    /// Defaults to `gvim`. Split with shell quoting rules, so
    /// something like `editor = "code --wait"` works.
    pub editor: Option<String>,

    /// The copy binary the `scpd` handler invokes. Defaults to `scp`.
    pub scp: Option<String>,

    /// Where `scpd` drops copied files. Defaults to `~/Desktop`.
    pub desktop_dir: Option<String>,

    /// How the listener rewrites the absolute paths a remote client
    /// sends before handing them to the editor.
    pub path_rewrite: Option<PathRewrite>,

    /// The address the listener binds. Defaults to 127.0.0.1; the
    /// back-channel arrives via an ssh reverse forward, so there is
    /// normally no reason to listen beyond loopback.
    pub listen_address: Option<String>,

    /// The shell rc file that --add-aliases edits. Defaults to
    /// ~/.bashrc when it exists, otherwise ~/.profile.
    pub shell_rc: Option<String>,

    /// Extra commands to register with the listener, so deployments
    /// can wire up site-specific actions without recompiling.
    pub commands: Option<Vec<CustomCommand>>,
}

/// A user supplied handler registration.
#[derive(Deserialize, Debug, Clone)]
pub struct CustomCommand {
    /// The command name clients select with `--command`.
    pub name: String,
    /// The command line to run. The request's path list is appended
    /// as arguments.
    pub run: String,
    /// A one line description, shown by --help and commands_pod.
    pub doc: Option<String>,
}

/// Where to point the local editor when a remote path arrives.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PathRewrite {
    /// Rewrite `/path` to `scp://<alias>//path` so an editor with
    /// network support edits the file in place over ssh.
    #[default]
    ScpUri,
    /// Rewrite `/path` to `/tmp/<alias>/path`, for setups that mount
    /// the remote filesystem under /tmp/<alias> (e.g. with sshfs).
    TmpMount,
}

/// The per-user configuration directory, also holding the listener
/// state files.
pub fn state_dir(home_dir: &str) -> PathBuf {
    let mut dir = PathBuf::from(home_dir);
    dir.push(".config");
    dir.push("bcvi");
    dir
}

/// Read a one line state file. A missing or empty file is treated
/// as absent rather than an error, since a stale or half-written
/// file is recovered from by just restarting the listener.
pub fn read_state_file(home_dir: &str, name: &str) -> anyhow::Result<Option<String>> {
    let path = state_dir(home_dir).join(name);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let contents = String::from(contents.trim_end());
            if contents.is_empty() {
                Ok(None)
            } else {
                Ok(Some(contents))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading state file {:?}", path)),
    }
}

/// Truncate-and-replace a one line state file, creating the
/// configuration directory on demand.
pub fn write_state_file(home_dir: &str, name: &str, value: &str) -> anyhow::Result<()> {
    let dir = state_dir(home_dir);
    fs::create_dir_all(&dir).with_context(|| format!("creating config dir {:?}", dir))?;
    let path = dir.join(name);
    fs::write(&path, format!("{}\n", value))
        .with_context(|| format!("writing state file {:?}", path))?;
    Ok(())
}

/// The well-known per-user port: spreads users out across the port
/// space while staying stable across listener restarts so that
/// long-lived remote shells keep working.
pub fn default_port(uid: u32) -> u16 {
    ((uid as u64 * 10 + 9) % 65536) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_port_formula() {
        let cases: Vec<(u32, u16)> = vec![
            (0, 9),
            (500, 5009),
            (1000, 10009),
            (6553, ((6553u64 * 10 + 9) % 65536) as u16),
            (70000, ((70000u64 * 10 + 9) % 65536) as u16),
        ];
        for (uid, want) in cases {
            assert_eq!(default_port(uid), want, "uid={}", uid);
        }
    }

    #[test]
    fn state_file_round_trip() {
        let tmp = tempfile::tempdir().expect("creating tmp dir");
        let home = tmp.path().to_str().expect("tmp dir to be utf8");

        assert_eq!(read_state_file(home, "listener_key").expect("read to succeed"), None);

        write_state_file(home, "listener_key", "deadbeef").expect("write to succeed");
        assert_eq!(
            read_state_file(home, "listener_key").expect("read to succeed"),
            Some(String::from("deadbeef"))
        );

        write_state_file(home, "listener_key", "cafebabe").expect("write to succeed");
        assert_eq!(
            read_state_file(home, "listener_key").expect("read to succeed"),
            Some(String::from("cafebabe"))
        );
    }

    #[test]
    fn empty_state_file_is_absent() {
        let tmp = tempfile::tempdir().expect("creating tmp dir");
        let home = tmp.path().to_str().expect("tmp dir to be utf8");
        write_state_file(home, "listener_pid", "").expect("write to succeed");
        assert_eq!(read_state_file(home, "listener_pid").expect("read to succeed"), None);
    }

    #[test]
    fn config_parses() {
        let config: Config = toml::from_str(
            r#"
            editor = "code --wait"
            path_rewrite = "tmp-mount"

            [[commands]]
            name = "open"
            run = "xdg-open"
            doc = "Open each path with the desktop handler"
            "#,
        )
        .expect("config to parse");

        assert_eq!(config.editor.as_deref(), Some("code --wait"));
        assert_eq!(config.path_rewrite, Some(PathRewrite::TmpMount));
        let commands = config.commands.expect("commands to be present");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "open");
    }
}
