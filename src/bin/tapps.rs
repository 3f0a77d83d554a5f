use tapps::app::cli;

fn output_header() -> &'static str {
    "tapps\ntapps is a file-backed workflow orchestration engine for multi-agent software delivery."
}

fn main() {
    println!("{}\n", output_header());
    let args: Vec<String> = std::env::args().skip(1).collect();
    match cli::run(args) {
        Ok(outcome) => {
            println!("{}", outcome.output);
            std::process::exit(outcome.exit_code);
        }
        Err(failure) => {
            eprintln!("{}", failure.message);
            std::process::exit(failure.exit_code);
        }
    }
}
