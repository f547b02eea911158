#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use seahorse::{App, Command, Context, Flag, FlagType};
use tokio::runtime;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!(
            "{command} [subcommand]\n\
             \n\
             \tRun the node in the foreground:\n\
             \n\
             \t  {command} run -c /etc/ferryman/ferryman.json\n\
             \n\
             \tFor detailed logs, use the `FERRYMAN_LOG` environment variable.",
            command = env!("CARGO_PKG_NAME"),
        ))
        .command(run_command())
        .command(install_command())
        .command(update_command());

    app.run(std::env::args().collect());
}

fn run_command() -> Command {
    Command::new("run")
        .description("Run the relay node in the foreground")
        .usage("ferryman run [-c CONFIG] [--log-level LEVEL]")
        .flag(Flag::new("config", FlagType::String).alias("c").description("config file path"))
        .flag(Flag::new("log-level", FlagType::String).description("trace, debug, info, warn or error"))
        .action(|c: &Context| exit(run_action(c)))
}

fn run_action(c: &Context) -> anyhow::Result<()> {
    let config_path = c.string_flag("config").ok().map(PathBuf::from);
    let conf = ferryman::config::load(config_path.as_deref())?;

    let level = c
        .string_flag("log-level")
        .ok()
        .unwrap_or_else(|| conf.john.log.level.clone());
    let _logger_guard = ferryman::log::init(&level, conf.john.log.file.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"));

    block_on(ferryman::service::run(conf))
}

fn install_command() -> Command {
    Command::new("install")
        .description("Install the binary and the systemd service")
        .usage("ferryman install [-u USER] [-g GROUP]")
        .flag(Flag::new("user", FlagType::String).alias("u").description("run the service as this user"))
        .flag(Flag::new("group", FlagType::String).alias("g").description("run the service as this group"))
        .action(|c: &Context| {
            let _logger_guard = ferryman::log::init("info", None).ok();
            let user = c.string_flag("user").ok();
            let group = c.string_flag("group").ok();
            exit(ferryman::install::install(user.as_deref(), group.as_deref()));
        })
}

fn update_command() -> Command {
    Command::new("update")
        .description("Update the current binary to the latest release")
        .usage("ferryman update")
        .action(|_c: &Context| {
            let _logger_guard = ferryman::log::init("info", None).ok();
            exit(block_on(ferryman::update::update()));
        })
}

fn block_on(future: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    // Install the default crypto provider before any TLS config is built.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("default crypto provider is already installed");
    }

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;
    let result = rt.block_on(future);
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

fn exit(result: anyhow::Result<()>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    }
}
