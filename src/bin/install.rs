//! Installer entry point.
//!
//! Installs the solver wrapper into a named environment: computes the
//! prefix path from the site settings' environments root, makes sure the
//! library directory exists, and hands off to the configured installer
//! command. Exit status is the installer's own.

use log::info;
use qeglue::settings::SiteSettings;
use std::process::{exit, Command};

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .init();

    let env_name = match std::env::args().nth(1) {
        Some(name) => name,
        None => {
            eprintln!("usage: qeglue-install <environment-name>");
            exit(2);
        }
    };

    let settings = match SiteSettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load site settings: {e}");
            exit(1);
        }
    };

    let prefix = settings.environments_root.join(&env_name);
    if !prefix.exists() {
        eprintln!("environment prefix does not exist: {}", prefix.display());
        exit(1);
    }

    let lib_path = prefix.join(&settings.lib_subdir);
    if !lib_path.exists() {
        if let Err(e) = std::fs::create_dir_all(&lib_path) {
            eprintln!("cannot create {}: {e}", lib_path.display());
            exit(1);
        }
    }

    info!("installing solver interface in: {}", lib_path.display());

    let command = settings
        .installer
        .replace("{prefix}", &prefix.display().to_string());
    let status = Command::new("sh").arg("-c").arg(&command).status();
    match status {
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(e) => {
            eprintln!("failed to run installer: {e}");
            exit(1);
        }
    }
}
