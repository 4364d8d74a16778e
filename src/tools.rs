//! Command lines for `flatpak` and `distrobox`.

use crate::config::Config;
use crate::model::{InstallScope, Intent};
use crate::parser::{CATALOG_COLUMNS, INSTALLED_COLUMNS, SEARCH_COLUMNS, UPDATE_COLUMNS};
use crate::process::CommandSpec;

/// Exit codes pkexec uses when authorization is dismissed or refused.
pub const PKEXEC_DENIED: [i32; 2] = [126, 127];

pub fn is_root() -> bool {
    std::env::var("USER").unwrap_or_default() == "root" || unsafe { libc::geteuid() == 0 }
}

fn is_gui_session() -> bool {
    std::env::var("DISPLAY").is_ok() || std::env::var("WAYLAND_DISPLAY").is_ok()
}

/// Whether the command goes through `pkexec` or `sudo`.
pub fn is_elevated(spec: &CommandSpec) -> bool {
    matches!(spec.program.as_str(), "pkexec" | "sudo")
}

/// System-wide changes need root. In a graphical session pkexec shows the
/// polkit dialog; elsewhere sudo asks on the terminal.
fn elevate(spec: CommandSpec, scope: InstallScope) -> CommandSpec {
    if scope == InstallScope::User || is_root() {
        return spec;
    }

    let wrapper = if is_gui_session() { "pkexec" } else { "sudo" };
    let mut elevated = CommandSpec::new(wrapper)
        .arg(spec.program)
        .args(spec.args)
        .interactive(spec.interactive);
    elevated.env = spec.env;

    if wrapper == "pkexec" {
        for key in ["DISPLAY", "XAUTHORITY", "WAYLAND_DISPLAY"] {
            if let Ok(value) = std::env::var(key) {
                elevated = elevated.env(key, value);
            }
        }
    }
    elevated
}

fn flatpak(config: &Config) -> CommandSpec {
    CommandSpec::new(&config.flatpak_bin)
}

fn distrobox(config: &Config) -> CommandSpec {
    CommandSpec::new(&config.distrobox_bin)
}

fn assume_yes(spec: CommandSpec, config: &Config) -> CommandSpec {
    if config.auto_confirm {
        spec.arg("-y")
    } else {
        spec
    }
}

/// The command that carries out `intent`.
pub fn command_for(intent: &Intent, config: &Config) -> CommandSpec {
    match intent {
        Intent::Search { query } => flatpak(config)
            .arg("search")
            .arg(format!("--columns={SEARCH_COLUMNS}"))
            .arg(query.trim()),
        Intent::Install { package, scope } => {
            let spec = assume_yes(flatpak(config).arg("install").arg(scope.flag()), config)
                .arg(&package.origin)
                .arg(package.flatpak_ref())
                .interactive(true);
            elevate(spec, *scope)
        }
        Intent::Update { package, scope } => {
            let mut spec =
                assume_yes(flatpak(config).arg("update").arg(scope.flag()), config).interactive(true);
            if let Some(package) = package {
                spec = spec.arg(package.flatpak_ref());
            }
            elevate(spec, *scope)
        }
        Intent::Remove { package, scope } => {
            let spec = assume_yes(flatpak(config).arg("uninstall").arg(scope.flag()), config)
                .arg(package.flatpak_ref())
                .interactive(true);
            elevate(spec, *scope)
        }
        Intent::CreateSandbox { name, image } => {
            let spec = distrobox(config)
                .arg("create")
                .arg("--name")
                .arg(name)
                .arg("--image")
                .arg(image)
                .interactive(true);
            if config.auto_confirm {
                spec.arg("--yes")
            } else {
                spec
            }
        }
        Intent::EnterSandbox { name, command } => {
            let command = if command.is_empty() {
                vec!["true".to_string()]
            } else {
                command.clone()
            };
            distrobox(config)
                .arg("enter")
                .arg(name)
                .arg("--no-tty")
                .arg("--")
                .args(command)
                .interactive(true)
        }
        Intent::DeleteSandbox { name } => distrobox(config).arg("rm").arg("--force").arg(name),
    }
}

pub fn list_installed(config: &Config) -> CommandSpec {
    flatpak(config)
        .arg("list")
        .arg("--app")
        .arg(format!("--columns={INSTALLED_COLUMNS}"))
}

pub fn list_updates(config: &Config) -> CommandSpec {
    flatpak(config)
        .arg("remote-ls")
        .arg("--updates")
        .arg("--app")
        .arg(format!("--columns={UPDATE_COLUMNS}"))
}

/// Every application the configured remote offers.
pub fn list_catalog(config: &Config) -> CommandSpec {
    flatpak(config)
        .arg("remote-ls")
        .arg("--app")
        .arg(&config.default_remote)
        .arg(format!("--columns={CATALOG_COLUMNS}"))
}

pub fn list_remotes(config: &Config) -> CommandSpec {
    flatpak(config).arg("remotes").arg("--columns=name")
}

pub fn add_remote(config: &Config) -> CommandSpec {
    let spec = flatpak(config)
        .arg("remote-add")
        .arg("--if-not-exists")
        .arg(config.scope.flag())
        .arg(&config.default_remote)
        .arg(&config.remote_url);
    elevate(spec, config.scope)
}

pub fn list_sandboxes(config: &Config) -> CommandSpec {
    distrobox(config).arg("list").arg("--no-color")
}

pub fn run_app(config: &Config, app_id: &str) -> CommandSpec {
    flatpak(config).arg("run").arg(app_id)
}

pub fn flatpak_version(config: &Config) -> CommandSpec {
    flatpak(config).arg("--version")
}

pub fn distrobox_version(config: &Config) -> CommandSpec {
    distrobox(config).arg("version")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageRef;

    fn package() -> PackageRef {
        PackageRef::new("flathub", "org.example.App", "stable")
    }

    #[test]
    fn user_install() {
        let config = Config::default();
        let spec = command_for(
            &Intent::Install {
                package: package(),
                scope: InstallScope::User,
            },
            &config,
        );
        assert_eq!(spec.program, "flatpak");
        assert_eq!(
            spec.args,
            ["install", "--user", "-y", "flathub", "org.example.App//stable"]
        );
        assert!(spec.interactive);
        assert!(!is_elevated(&spec));
    }

    #[test]
    fn prompts_are_left_to_the_user_without_auto_confirm() {
        let config = Config {
            auto_confirm: false,
            ..Config::default()
        };
        let spec = command_for(
            &Intent::Remove {
                package: package(),
                scope: InstallScope::User,
            },
            &config,
        );
        assert_eq!(spec.args, ["uninstall", "--user", "org.example.App//stable"]);
    }

    #[test]
    fn update_all_has_no_ref() {
        let spec = command_for(
            &Intent::Update {
                package: None,
                scope: InstallScope::User,
            },
            &Config::default(),
        );
        assert_eq!(spec.args, ["update", "--user", "-y"]);
    }

    #[test]
    fn system_scope_is_elevated_unless_root() {
        let spec = command_for(
            &Intent::Install {
                package: package(),
                scope: InstallScope::System,
            },
            &Config::default(),
        );
        if is_root() {
            assert_eq!(spec.program, "flatpak");
        } else {
            assert!(is_elevated(&spec));
            assert_eq!(spec.args[0], "flatpak");
            assert!(spec.args.contains(&"--system".to_string()));
        }
    }

    #[test]
    fn search_requests_known_columns() {
        let spec = command_for(&Intent::Search { query: " gimp ".into() }, &Config::default());
        assert_eq!(
            spec.args,
            ["search", &format!("--columns={SEARCH_COLUMNS}"), "gimp"]
        );
        assert!(!spec.interactive);
    }

    #[test]
    fn catalog_lists_the_configured_remote() {
        let spec = list_catalog(&Config::default());
        assert_eq!(
            spec.args,
            ["remote-ls", "--app", "flathub", "--columns=application,name,description"]
        );
    }

    #[test]
    fn sandbox_commands() {
        let config = Config::default();
        let create = command_for(
            &Intent::CreateSandbox {
                name: "dev".into(),
                image: "fedora:40".into(),
            },
            &config,
        );
        assert_eq!(
            create.args,
            ["create", "--name", "dev", "--image", "fedora:40", "--yes"]
        );

        let enter = command_for(
            &Intent::EnterSandbox {
                name: "dev".into(),
                command: Vec::new(),
            },
            &config,
        );
        assert_eq!(enter.args, ["enter", "dev", "--no-tty", "--", "true"]);

        let delete = command_for(&Intent::DeleteSandbox { name: "dev".into() }, &config);
        assert_eq!(delete.args, ["rm", "--force", "dev"]);
    }
}
