use qloop_core::CancellationToken;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

const CANCEL_CHECK: Duration = Duration::from_millis(100);

/// Ask the operator on a reader thread so Ctrl-C can abandon the question.
/// Cancellation and read errors count as "no".
pub fn confirm_degraded_or_cancel(
    service: &str,
    missing: &[String],
    cancel: &CancellationToken,
) -> bool {
    let (tx, rx) = mpsc::channel();
    let service_name = service.to_string();
    let missing = missing.to_vec();
    // Detached: a thread parked on stdin must not hold up process exit.
    std::thread::spawn(move || {
        let _ = tx.send(confirm_degraded(&service_name, &missing));
    });
    tokio::task::block_in_place(|| await_answer(service, &rx, cancel))
}

fn await_answer(service: &str, rx: &Receiver<io::Result<bool>>, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            tracing::warn!(service, "🛑 Degraded-mode prompt cancelled");
            return false;
        }
        match rx.recv_timeout(CANCEL_CHECK) {
            Ok(Ok(answer)) => return answer,
            Ok(Err(e)) => {
                tracing::warn!(service, error = %e, "could not read answer; declining");
                return false;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Ask whether to start `service` without `missing`. Re-asks until y or n.
fn confirm_degraded(service: &str, missing: &[String]) -> io::Result<bool> {
    println!();
    println!("⚠️  {} requires {}, which is not healthy.", service, missing.join(", "));
    println!("    It can start in degraded mode (in-memory fallbacks, reduced capability).");

    loop {
        print!("Start {} in degraded mode? (y/n): ", service);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF: no operator at the terminal.
            return Ok(false);
        }
        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => {
                tracing::warn!(service, "✅ Degraded mode accepted by operator");
                return Ok(true);
            }
            "n" | "no" => {
                tracing::info!(service, "❌ Degraded mode declined by operator");
                return Ok(false);
            }
            _ => println!("Invalid input. Please enter 'y' or 'n'."),
        }
    }
}
