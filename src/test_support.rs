//! Fake `flatpak` and `distrobox` executables for tests.
//!
//! Each fake logs its arguments to `calls.log` and then sources
//! `<tool>-<subcommand>.sh` from the same directory when a test provided one,
//! falling back to a canned successful answer.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::bus::CoreEvent;
use crate::config::Config;

const FAKE_FLATPAK: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "flatpak $*" >> "$dir/calls.log"
sub="$1"
if [ -f "$dir/flatpak-$sub.sh" ]; then
    . "$dir/flatpak-$sub.sh"
    exit $?
fi
case "$sub" in
    --version) echo "Flatpak 1.14.4" ;;
    install)
        echo "Installing 1/1 org.example.App"
        echo "Installing 1/1 100%"
        echo "Installation complete."
        ;;
    update) echo "Nothing to do." ;;
    uninstall) echo "Uninstall complete." ;;
    search) printf 'org.example.App\tstable\tflathub\t1.0\tExample\tAn example app\n' ;;
    remotes) echo "flathub" ;;
esac
exit 0
"#;

const FAKE_DISTROBOX: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "distrobox $*" >> "$dir/calls.log"
sub="$1"
if [ -f "$dir/distrobox-$sub.sh" ]; then
    . "$dir/distrobox-$sub.sh"
    exit $?
fi
case "$sub" in
    version) echo "distrobox: 1.7.0" ;;
    create) echo "Creating '$3' using image $5"; echo "Distrobox '$3' successfully created." ;;
    list) echo "ID           | NAME | STATUS | IMAGE" ;;
esac
exit 0
"#;

pub(crate) struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let tools = Self { dir };
        tools.write_executable("flatpak", FAKE_FLATPAK);
        tools.write_executable("distrobox", FAKE_DISTROBOX);
        tools
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn bin(&self, tool: &str) -> PathBuf {
        self.path().join(tool)
    }

    /// Configuration pointing at the fakes, with a short cancel grace.
    pub fn config(&self) -> Config {
        Config {
            flatpak_bin: self.bin("flatpak").display().to_string(),
            distrobox_bin: self.bin("distrobox").display().to_string(),
            cancel_grace_ms: 500,
            ..Config::default()
        }
    }

    /// Replace the behaviour of `<tool> <subcommand>` with a shell snippet.
    pub fn script(&self, tool: &str, subcommand: &str, body: &str) {
        fs::write(self.path().join(format!("{tool}-{subcommand}.sh")), body).expect("write override");
    }

    /// Every invocation so far, one `tool args...` line each.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn write_executable(&self, name: &str, body: &str) {
        let path = self.bin(name);
        fs::write(&path, body).expect("write fake tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
    }
}

/// Receive events until one matches, failing the test after ten seconds.
pub(crate) async fn next_event<F>(rx: &mut UnboundedReceiver<CoreEvent>, mut matches: F) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    let wait = async {
        while let Some(event) = rx.recv().await {
            if matches(&event) {
                return event;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}
