//! Reference worker: speaks the file protocol and echoes each query.
//!
//! Useful for exercising the daemon end to end without a real assistant
//! behind it. `tablebridged` starts it as `tablebridge worker <req> <resp>`.

use std::io;
use std::path::PathBuf;

use tablebridge_core::endpoint::WorkerEndpoint;
use tablebridge_core::layout::EXIT_COMMAND;

pub const BANNER: &str = "Table Assistant is ready for queries.";
pub const QUERY_PROMPT: &str = "Enter your Query (or type /exit to quit):";

pub fn cmd_worker(args: &[String]) -> i32 {
    let [request, response] = args else {
        eprintln!("Usage: tablebridge worker <request-file> <response-file>");
        return 1;
    };

    let endpoint = match WorkerEndpoint::open(PathBuf::from(request), PathBuf::from(response)) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("worker: cannot open channel files: {e}");
            return 1;
        }
    };
    match run_worker(&endpoint) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("worker: {e}");
            1
        }
    }
}

fn run_worker(endpoint: &WorkerEndpoint) -> io::Result<()> {
    endpoint.write_output(&format!("{BANNER}\n"))?;
    loop {
        let command = endpoint.read_command(QUERY_PROMPT)?;
        if command.eq_ignore_ascii_case(EXIT_COMMAND) {
            endpoint.write_output("Goodbye.\n")?;
            return Ok(());
        }
        endpoint.write_output(&format!("You asked: {command}\n"))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    fn wait_for(path: &std::path::Path, needle: &str) -> String {
        for _ in 0..300 {
            let text = fs::read_to_string(path).unwrap_or_default();
            if text.contains(needle) {
                return text;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("{needle:?} never appeared in {}", path.display());
    }

    #[test]
    fn worker_requires_two_paths() {
        assert_eq!(cmd_worker(&[]), 1);
        assert_eq!(cmd_worker(&["only-one".into()]), 1);
    }

    #[test]
    fn echoes_queries_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let req = dir.path().join("input_t.txt");
        let resp = dir.path().join("output_t.txt");
        let endpoint = WorkerEndpoint::open(req.clone(), resp.clone())
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let flag = endpoint.paths().request_flag.clone();
        let worker = thread::spawn(move || run_worker(&endpoint));

        let text = wait_for(&resp, QUERY_PROMPT);
        assert!(text.starts_with(BANNER));
        for _ in 0..300 {
            if flag.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(flag.exists());

        fs::write(&req, "list tables\n").unwrap();
        wait_for(&resp, "You asked: list tables");

        fs::write(&req, "/exit\n").unwrap();
        worker.join().unwrap().unwrap();
        assert!(fs::read_to_string(&resp).unwrap().ends_with("Goodbye.\n"));
    }
}
