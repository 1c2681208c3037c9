use std::{panic, path::PathBuf};

use clap::Parser;

use shiftdesk::{
    cli::{self, RootCommand},
    logging::{get_recent_log_path, init_logging},
    settings::Settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "shiftdesk",
    about = "Admin client for a shift-scheduling service",
    long_about = "Browse the week schedule, assign workers to shifts, plan upcoming days and manage the worker directory from the terminal.",
    version = env!("SHIFTDESK_BUILD_VERSION"),
    author
)]
struct Cli {
    /// Service root, e.g. https://shifts.example. Overrides SHIFTDESK_BASE_URL
    /// and the settings file.
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    /// Echo debug logs to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the most recent log file and exit.
    #[arg(long = "log-path")]
    log_path: bool,

    #[command(subcommand)]
    command: Option<RootCommand>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.log_path {
        match get_recent_log_path() {
            Some(path) => println!("{}", path.display()),
            None => {
                eprintln!("error[NO_LOG_FILE]: no log file found");
                std::process::exit(3);
            }
        }
        return;
    }

    let Some(command) = cli.command else {
        eprintln!("error[COMMAND_REQUIRED]: a subcommand is required; see --help");
        std::process::exit(2);
    };

    match init_logging(cli.verbose) {
        Ok(path) => install_panic_hook_with_log(path),
        Err(err) => eprintln!("warning: failed to initialize logging: {err}"),
    }

    let settings = Settings::load().with_overrides(cli.base_url.as_deref());
    let code = cli::run(settings, command, cli.json, cli.quiet).await;
    std::process::exit(code);
}

fn install_panic_hook_with_log(log_path: PathBuf) {
    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        eprintln!();
        eprintln!("  Log file: {}", log_path.display());
        eprintln!();
        previous_hook(panic_info);
    }));
}
