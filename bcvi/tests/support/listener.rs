use std::{
    fs,
    net::TcpStream,
    os::unix::fs::PermissionsExt as _,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::bcvi_bin;

/// A hermetic home directory for a listener under test, with a stub
/// editor that records its arguments instead of opening anything.
pub struct Fixture {
    pub home: TempDir,
    pub port: u16,
    pub editor_log: PathBuf,
    config_path: PathBuf,
    subproc_counter: usize,
}

/// Proc is a helper handle for a `bcvi --listener` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub log_file: PathBuf,
}

impl Fixture {
    pub fn new(port: u16) -> anyhow::Result<Fixture> {
        let home = tempfile::Builder::new()
            .prefix("bcvi-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp home dir")?;

        let editor_log = home.path().join("editor.log");
        let editor_script = home.path().join("editor.sh");
        fs::write(
            &editor_script,
            format!("#!/bin/sh\nprintf '%s\\n' \"$@\" >> {}\n", editor_log.display()),
        )
        .context("writing stub editor")?;
        fs::set_permissions(&editor_script, fs::Permissions::from_mode(0o755))
            .context("marking stub editor executable")?;

        let config_path = home.path().join("config.toml");
        fs::write(
            &config_path,
            format!("editor = \"{}\"\npath_rewrite = \"tmp-mount\"\n", editor_script.display()),
        )
        .context("writing test config")?;

        Ok(Fixture { home, port, editor_log, config_path, subproc_counter: 0 })
    }

    /// Plant a known auth key so a listener started with
    /// --reuse-auth is predictable.
    pub fn seed_auth_key(&self, key: &str) -> anyhow::Result<()> {
        let dir = self.home.path().join(".config").join("bcvi");
        fs::create_dir_all(&dir).context("creating config dir")?;
        fs::write(dir.join("listener_key"), format!("{}\n", key)).context("seeding auth key")?;
        Ok(())
    }

    pub fn state_file(&self, name: &str) -> anyhow::Result<Option<String>> {
        let path = self.home.path().join(".config").join("bcvi").join(name);
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(String::from(contents.trim_end()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("reading state file"),
        }
    }

    pub fn spawn_listener(&mut self, reuse_auth: bool) -> anyhow::Result<Proc> {
        let log_file = self.home.path().join(format!("listener_{}.log", self.subproc_counter));
        eprintln!("spawning listener proc with log {:?}", &log_file);
        self.subproc_counter += 1;

        let mut cmd = Command::new(bcvi_bin()?);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("HOME", self.home.path())
            .arg("--verbose")
            .arg("--verbose")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--config-file")
            .arg(&self.config_path)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--listener");
        if reuse_auth {
            cmd.arg("--reuse-auth");
        }
        let proc = cmd.spawn().context("spawning listener process")?;

        // spin until we can dial the port successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if TcpStream::connect(("127.0.0.1", self.port)).is_ok() {
                break;
            } else {
                std::thread::sleep(sleep_dur);
                sleep_dur *= 2;
            }
        }

        Ok(Proc { proc, log_file })
    }

    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.port)).context("dialing listener under test")
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}
