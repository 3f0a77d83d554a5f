use crate::app::commands::{self, CliFailure, CliOutcome};

pub fn run(args: Vec<String>) -> Result<CliOutcome, CliFailure> {
    commands::run_cli(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_adapter_delegates_to_the_shared_command_engine() {
        let args = vec!["unknown-command".to_string()];
        assert_eq!(run(args.clone()), commands::run_cli(args));
    }
}
