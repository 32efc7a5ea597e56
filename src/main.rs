use std::io;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use keys_lib::device::list_devices;
use keys_lib::dispatcher::Mode;

#[derive(Parser, Debug)]
#[command(name = "keys", about = "Run shell commands from a dedicated keyboard", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Keymap file (defaults to <config dir>/keys/keys.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for keys and run their commands (the default)
    Start,
    /// Print what each key press maps to instead of running anything
    TestKey,
    /// List keyboards that can be used
    ListDevices,
    /// Choose the keyboard to grab and save it to the keymap
    SelectKeyboard {
        /// Device path; prompts from the available keyboards when omitted
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    // .env is a development convenience; production uses the real environment
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config.unwrap_or_else(keys_lib::default_config_path);

    let result = match cli.command.unwrap_or(Command::Start) {
        Command::Start => serve(config, Mode::Normal).await,
        Command::TestKey => {
            println!("Press keys to see their codes, Ctrl+C to stop");
            serve(config, Mode::Diagnostic).await
        }
        Command::ListDevices => list_devices()
            .map(|devices| {
                for device in devices {
                    println!("{}", device.display());
                }
            })
            .map_err(Into::into),
        Command::SelectKeyboard { path } => list_devices()
            .map_err(Into::into)
            .and_then(|candidates| {
                keys_lib::select_keyboard(
                    &config,
                    path,
                    &candidates,
                    &mut io::stdin().lock(),
                    &mut io::stdout(),
                )
            })
            .map(|_| ()),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        process::exit(1);
    }
}

async fn serve(config: PathBuf, mode: Mode) -> Result<(), keys_lib::Error> {
    let cancel = CancellationToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Interrupted, shutting down");
                on_interrupt.cancel();
            }
            Err(e) => log::warn!("Cannot listen for Ctrl+C: {}", e),
        }
    });

    keys_lib::run(&config, mode, cancel).await
}
