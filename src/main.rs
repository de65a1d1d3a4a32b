use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use gattwalk::{
    Args, OutputFormat, RunSettings, SystemTerminalClient, fake_backend, real_backend,
    run_with_clients,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let output_format = args.output_format().unwrap_or(if stdout.is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let settings = RunSettings::builder()
            .maybe_log_level(args.log_level())
            .output_format(output_format)
            .session_config(args.session_config())
            .build();
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let backend = match maybe_fake_args {
            Some(fake_args) => fake_backend(fake_args),
            None => real_backend(),
        };

        run_with_clients(
            command,
            &mut stdout,
            &SystemTerminalClient,
            backend,
            settings,
        )
        .await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
