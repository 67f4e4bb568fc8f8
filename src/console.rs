//! # Console Surface
//!
//! The evaluate-and-print side of the client: decoded responses are rendered
//! to the primary output channel, server-reported errors to the error
//! channel, and the interactive loop dispatches typed lines to the executor.
//!
//! ## Rendering
//!
//! - Scalars print to stdout.
//! - `Error` values print to stderr and abort the rest of the current
//!   response with a distinguishable outcome.
//! - Null (both the bulk and the array form) prints as the `(nil)` sentinel.
//! - Arrays render their elements in order; nested arrays recurse.
//! - `OK`/`PONG` acknowledgements may be suppressed when the output is not a
//!   terminal. This is a presentation choice only; machine consumers pass
//!   `suppress_acks = false`.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::resp::Response;
use crate::session::Session;

/// Tokens that end the interactive session (matched case-insensitively)
const QUIT_TOKENS: [&str; 3] = ["quit", "exit", "q"];

/// Command families that switch the console into push mode
const PUSH_PREFIXES: [&str; 3] = ["subscribe", "psubscribe", "monitor"];

/// Acknowledgement values eligible for non-interactive suppression
const ACK_ALLOW_LIST: [&str; 2] = ["OK", "PONG"];

/// The sentinel rendered for null responses, both bulk and array forms
const NULL_SENTINEL: &str = "(nil)";

/// What rendering a response amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The response rendered fully
    Done,
    /// The response carried a server error; rendering stopped there
    ServerError,
}

/// Renders one response into explicit primary and error channels.
pub fn render_to<W, E>(
    response: &Response,
    out: &mut W,
    err: &mut E,
    suppress_acks: bool,
) -> Outcome
where
    W: Write,
    E: Write,
{
    match response {
        Response::Error(message) => {
            let _ = writeln!(err, "(error) {}", message);
            Outcome::ServerError
        }
        Response::Simple(text) => {
            let suppressed = suppress_acks && ACK_ALLOW_LIST.iter().any(|ack| ack == text);
            if !suppressed {
                let _ = writeln!(out, "{}", text);
            }
            Outcome::Done
        }
        Response::Integer(value) => {
            let _ = writeln!(out, "(integer) {}", value);
            Outcome::Done
        }
        Response::Bulk(Some(data)) => {
            let _ = writeln!(out, "{}", data);
            Outcome::Done
        }
        Response::Bulk(None) | Response::Array(None) => {
            let _ = writeln!(out, "{}", NULL_SENTINEL);
            Outcome::Done
        }
        Response::Array(Some(items)) => {
            for item in items {
                if let Outcome::ServerError = render_to(item, out, err, suppress_acks) {
                    // An error element aborts the rest of this response
                    return Outcome::ServerError;
                }
            }
            Outcome::Done
        }
    }
}

/// Renders to the process stdout/stderr.
pub fn render(response: &Response, suppress_acks: bool) -> Outcome {
    render_to(
        response,
        &mut std::io::stdout(),
        &mut std::io::stderr(),
        suppress_acks,
    )
}

/// Runs the interactive loop until EOF or a quit token.
pub fn run_interactive(handle: &Handle, session: &Arc<Session>) -> i32 {
    let interactive = std::io::stdin().is_terminal();
    let suppress_acks = !interactive;
    let prompt = format!("{}> ", session.addr());

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if interactive {
            print!("{}", prompt);
            let _ = std::io::stdout().flush();
        }

        let command = match lines.next() {
            Some(Ok(line)) => line,
            _ => break, // EOF or a broken stdin both end the session
        };
        let command = command.trim();
        if command.is_empty() {
            continue;
        }
        if QUIT_TOKENS
            .iter()
            .any(|token| command.eq_ignore_ascii_case(token))
        {
            break;
        }

        if is_push_command(command) {
            run_push_mode(handle, session, command);
            continue;
        }

        match handle.block_on(session.execute(command)) {
            Ok(response) => {
                render(&response, suppress_acks);
            }
            Err(e) => {
                eprintln!("(error) {}", e);
            }
        }
    }

    0
}

/// Runs a single command and maps it onto the stable exit-code taxonomy:
/// 0 success, 1 server-reported error, 2 not-connected, 3 lock busy.
pub fn run_command(handle: &Handle, session: &Arc<Session>, command: &str) -> i32 {
    let suppress_acks = !std::io::stdout().is_terminal();

    match handle.block_on(session.execute(command)) {
        Ok(response) => match render(&response, suppress_acks) {
            Outcome::Done => 0,
            Outcome::ServerError => 1,
        },
        Err(e) => {
            eprintln!("(error) {}", e);
            e.exit_code()
        }
    }
}

fn is_push_command(command: &str) -> bool {
    let first = command.split_whitespace().next().unwrap_or("");
    PUSH_PREFIXES
        .iter()
        .any(|prefix| first.eq_ignore_ascii_case(prefix))
}

/// Push mode: echo every pushed response until Ctrl-C, which issues the
/// protocol reset and drops back to the prompt.
fn run_push_mode(handle: &Handle, session: &Arc<Session>, command: &str) {
    println!("Entering push mode; press Ctrl-C to return to the prompt");

    let result = handle.block_on(session.stream_responses(
        command,
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
        |response| {
            render(response, false);
        },
    ));

    if let Err(e) = result {
        eprintln!("(error) {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_captured(response: &Response, suppress_acks: bool) -> (String, String, Outcome) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = render_to(response, &mut out, &mut err, suppress_acks);
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
            outcome,
        )
    }

    #[test]
    fn test_scalars_go_to_the_primary_channel() {
        let (out, err, outcome) = render_captured(&Response::Integer(7), false);
        assert_eq!(out, "(integer) 7\n");
        assert!(err.is_empty());
        assert_eq!(outcome, Outcome::Done);
    }

    #[test]
    fn test_errors_go_to_the_error_channel() {
        let (out, err, outcome) =
            render_captured(&Response::Error("ERR no such key".to_string()), false);
        assert!(out.is_empty());
        assert_eq!(err, "(error) ERR no such key\n");
        assert_eq!(outcome, Outcome::ServerError);
    }

    #[test]
    fn test_both_null_forms_share_one_sentinel() {
        let (bulk_out, _, _) = render_captured(&Response::Bulk(None), false);
        let (array_out, _, _) = render_captured(&Response::Array(None), false);
        assert_eq!(bulk_out, "(nil)\n");
        assert_eq!(array_out, bulk_out);
    }

    #[test]
    fn test_arrays_render_in_order_and_recurse() {
        let response = Response::Array(Some(vec![
            Response::Integer(1),
            Response::Array(Some(vec![Response::Simple("x".to_string())])),
            Response::Bulk(Some("tail".to_string())),
        ]));
        let (out, _, outcome) = render_captured(&response, false);
        assert_eq!(out, "(integer) 1\nx\ntail\n");
        assert_eq!(outcome, Outcome::Done);
    }

    #[test]
    fn test_error_element_aborts_the_rest_of_the_response() {
        let response = Response::Array(Some(vec![
            Response::Integer(1),
            Response::Error("ERR mid-array".to_string()),
            Response::Integer(2),
        ]));
        let (out, err, outcome) = render_captured(&response, false);
        assert_eq!(out, "(integer) 1\n");
        assert_eq!(err, "(error) ERR mid-array\n");
        assert_eq!(outcome, Outcome::ServerError);
    }

    #[test]
    fn test_acks_suppressed_only_when_requested() {
        let ok = Response::Simple("OK".to_string());
        let (out, _, _) = render_captured(&ok, true);
        assert!(out.is_empty());
        let (out, _, _) = render_captured(&ok, false);
        assert_eq!(out, "OK\n");

        // Non-acknowledgement simple strings always print
        let other = Response::Simple("QUEUED".to_string());
        let (out, _, _) = render_captured(&other, true);
        assert_eq!(out, "QUEUED\n");
    }

    #[test]
    fn test_push_command_detection_is_case_insensitive() {
        assert!(is_push_command("SUBSCRIBE news"));
        assert!(is_push_command("psubscribe ch.*"));
        assert!(is_push_command("Monitor"));
        assert!(!is_push_command("get subscribe"));
        assert!(!is_push_command("SET k v"));
    }

    #[test]
    fn test_quit_tokens_match_case_insensitively() {
        for token in ["quit", "QUIT", "Exit", "q", "Q"] {
            assert!(QUIT_TOKENS
                .iter()
                .any(|quit| token.eq_ignore_ascii_case(quit)));
        }
        assert!(!QUIT_TOKENS.iter().any(|quit| "query".eq_ignore_ascii_case(quit)));
    }
}
