use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use std::process::ExitCode;

mod args;
mod cloudinit;
mod config;
mod mutations;
mod qmp;
mod status;
mod supervisor;
mod template;

/// Unusable configuration (EX_USAGE family).
const EXIT_MISCONFIGURATION: u8 = 64;

/// Internal failure (EX_SOFTWARE).
const EXIT_INTERNAL: u8 = 70;

/// QEMU could not be started (EX_TEMPFAIL).
const EXIT_QEMU_START: u8 = 75;

#[tokio::main]
async fn main() -> ExitCode {
    vmop_common::init();
    let args = args::Args::parse();

    let settings = match config::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", format!("❌ Configuration error: {:#}", e).red());
            return ExitCode::from(EXIT_MISCONFIGURATION);
        }
    };
    // Rendering validates the VM definition; refuse to start on garbage.
    let command = match template::render(&settings) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", format!("❌ Configuration error: {:#}", e).red());
            return ExitCode::from(EXIT_MISCONFIGURATION);
        }
    };

    let client = if args.no_status {
        None
    } else {
        match Client::try_default().await {
            Ok(client) => Some(client),
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("⚠️ No Kubernetes client; status reporting disabled: {}", e).yellow()
                );
                None
            }
        }
    };

    println!(
        "{}{}{}{}",
        "🖥️ Starting vmrunner • vm=".green(),
        settings.vm_name.green().dimmed(),
        " • namespace=".green(),
        settings.namespace.green().dimmed(),
    );

    match supervisor::run(settings, command, client).await {
        Ok(supervisor::Outcome::Clean) => {
            println!("{}", "✅ Shut down cleanly".green());
            ExitCode::SUCCESS
        }
        Ok(supervisor::Outcome::QemuExit(code)) => {
            ExitCode::from(code.clamp(1, 255) as u8)
        }
        Err(supervisor::Fatal::QemuEarlyExit(code)) => {
            eprintln!(
                "{}",
                format!("❌ QEMU exited with code {} before the monitor was up", code).red()
            );
            if code == 0 {
                ExitCode::from(EXIT_QEMU_START)
            } else {
                ExitCode::from(code.clamp(1, 255) as u8)
            }
        }
        Err(supervisor::Fatal::QemuStart(e)) => {
            eprintln!("{}", format!("❌ {:#}", e).red());
            ExitCode::from(EXIT_QEMU_START)
        }
        Err(e @ supervisor::Fatal::Tpm(_)) => {
            eprintln!("{}", format!("❌ {:#}", e).red());
            ExitCode::from(EXIT_INTERNAL)
        }
        Err(supervisor::Fatal::Internal(e)) => {
            eprintln!("{}", format!("❌ Internal error: {:#}", e).red());
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}
