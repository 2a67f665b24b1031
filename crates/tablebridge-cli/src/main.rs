mod commands;
mod daemon_client;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = run(&args);
    std::process::exit(code);
}

fn run(args: &[String]) -> i32 {
    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => cmd_help(),
        Some("query") => commands::query::cmd_query(&args[2..]),
        Some("chat") => commands::chat::cmd_chat(&args[2..]),
        Some("ping") => commands::status::cmd_ping(&args[2..]),
        Some("probe") => commands::status::cmd_probe(&args[2..]),
        Some("shutdown") => commands::status::cmd_shutdown(&args[2..]),
        Some("config") => commands::config::cmd_config(&args[2..]),
        Some("worker") => commands::worker::cmd_worker(&args[2..]),
        _ => {
            cmd_help();
            1
        }
    }
}

fn cmd_help() -> i32 {
    println!("tablebridge {}", env!("CARGO_PKG_VERSION"));
    println!("Talk to a table-assistant worker through the tablebridged daemon.");
    println!();
    println!("Usage: tablebridge <command> [options]");
    println!();
    println!("Commands:");
    println!("  query <text>        Run one query and print the answer");
    println!("  chat                Interactive session (type /exit to quit)");
    println!("  ping                Check that the daemon is up");
    println!("  probe               Time a round trip through a fresh worker");
    println!("  shutdown            Stop the daemon and all workers");
    println!("  config              Manage config file");
    println!("    path              Print config file path");
    println!("    init [--force]    Create config with defaults");
    println!("  worker <req> <resp> Run the reference echo worker");
    println!();
    println!("Examples:");
    println!("  tablebridge query \"how many orders shipped last week?\"");
    println!("  tablebridge chat");
    println!("  tablebridge config init");
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_help_variants() {
        assert_eq!(run(&["tablebridge".into(), "help".into()]), 0);
        assert_eq!(run(&["tablebridge".into(), "--help".into()]), 0);
        assert_eq!(run(&["tablebridge".into(), "-h".into()]), 0);
    }

    #[test]
    fn run_dispatches_subcommands() {
        // Missing arguments: non-zero, no daemon contact.
        assert_eq!(run(&["tablebridge".into(), "query".into()]), 1);
        assert_eq!(run(&["tablebridge".into(), "config".into()]), 1);
        assert_eq!(run(&["tablebridge".into(), "worker".into()]), 1);
        assert_eq!(run(&["tablebridge".into(), "probe".into(), "x".into()]), 1);
    }

    #[test]
    fn run_unknown_shows_help() {
        assert_eq!(run(&["tablebridge".into(), "bogus".into()]), 1);
    }

    #[test]
    fn run_no_args_shows_help() {
        assert_eq!(run(&["tablebridge".into()]), 1);
    }
}
