use std::{
    fs,
    process::{Command, Stdio},
};

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn unpack_term_reexports_conf() -> anyhow::Result<()> {
    let out = Command::new(support::bcvi_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("TERM", "xterm\nBCVI_CONF=pluto:localhost:5009:deadbeef")
        .arg("--unpack-term")
        .output()
        .context("running bcvi --unpack-term")?;
    assert!(out.status.success());
    assert_eq!(
        String::from_utf8(out.stdout)?,
        "TERM=xterm\nexport BCVI_CONF=\"pluto:localhost:5009:deadbeef\"\n"
    );

    Ok(())
}

#[test]
#[timeout(30000)]
fn unpack_term_is_silent_without_payload() -> anyhow::Result<()> {
    let out = Command::new(support::bcvi_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("TERM", "xterm-256color")
        .arg("--unpack-term")
        .output()
        .context("running bcvi --unpack-term")?;
    assert!(out.status.success());
    assert_eq!(out.stdout.len(), 0);

    Ok(())
}

#[test]
#[timeout(30000)]
fn add_aliases_is_idempotent() -> anyhow::Result<()> {
    let home = tempfile::Builder::new()
        .prefix("bcvi-test")
        .rand_bytes(20)
        .tempdir()
        .context("creating tmp home dir")?;
    let bashrc = home.path().join(".bashrc");
    fs::write(&bashrc, "export PATH=$PATH:~/bin\n").context("seeding bashrc")?;

    let run = || -> anyhow::Result<()> {
        let status = Command::new(support::bcvi_bin()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("HOME", home.path())
            .arg("--add-aliases")
            .status()
            .context("running bcvi --add-aliases")?;
        assert!(status.success());
        Ok(())
    };

    run()?;
    let once = fs::read_to_string(&bashrc)?;
    assert!(once.starts_with("export PATH=$PATH:~/bin\n"));
    assert!(once.contains("## START-BCVI"));
    assert!(once.contains("## END-BCVI"));
    assert!(once.contains("alias vi='bcvi'"));

    run()?;
    let twice = fs::read_to_string(&bashrc)?;
    assert_eq!(once, twice);

    Ok(())
}

#[test]
#[timeout(30000)]
fn version_without_conf_prints_client_only() -> anyhow::Result<()> {
    let out = Command::new(support::bcvi_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_remove("BCVI_CONF")
        .arg("--version")
        .output()
        .context("running bcvi --version")?;
    assert!(out.status.success());

    let stdout = String::from_utf8(out.stdout)?;
    assert!(stdout.starts_with("bcvi "), "stdout was: {}", stdout);
    assert!(!stdout.contains("listener"), "stdout was: {}", stdout);

    Ok(())
}

#[test]
#[timeout(30000)]
fn help_renders_without_a_tty() -> anyhow::Result<()> {
    let home = tempfile::Builder::new()
        .prefix("bcvi-test")
        .rand_bytes(20)
        .tempdir()
        .context("creating tmp home dir")?;

    let out = Command::new(support::bcvi_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("HOME", home.path())
        .env_remove("BCVI_CONF")
        .arg("--help")
        .output()
        .context("running bcvi --help")?;
    assert!(out.status.success());

    let stdout = String::from_utf8(out.stdout)?;
    assert!(stdout.contains("=head1 NAME"), "stdout was: {}", stdout);
    assert!(stdout.contains("=item C<vi>"), "stdout was: {}", stdout);

    Ok(())
}
