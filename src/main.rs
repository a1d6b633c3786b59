use std::process::ExitCode;

use clap::Parser;

use uubluetooth::{Args, RunOptions, fake_platform, real_platform, run_with_options};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let options = RunOptions::builder()
            .maybe_log_level(args.log_level())
            .maybe_output_format(args.output_format())
            .config(args.central_config()?)
            .build();
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let platform = match maybe_fake_args {
            Some(fake_args) => fake_platform(fake_args),
            None => real_platform().await?,
        };

        run_with_options(command, &mut stdout, platform, options).await
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
