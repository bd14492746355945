use clap::Parser;

fn main() {
    let cli = autoreelctl::Cli::parse();
    let outcome = autoreelctl::init_tracing(cli.verbose).and_then(|()| autoreelctl::run(cli));
    if let Err(err) = outcome {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
