use busq_cli::{run_cli, usage, CliError};

#[tokio::main]
async fn main() {
    let code = match run_cli(std::env::args_os()).await {
        Ok(()) => 0,
        Err(e @ CliError::Usage(_)) => {
            eprintln!("{}", e);
            println!("{}", usage());
            e.exit_code()
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}
