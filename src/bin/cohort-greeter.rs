//! Sample worker: every rank greets every other rank and prints the
//! greetings it receives.
//!
//! An optional third argument makes the worker linger that many
//! milliseconds before exiting.

use std::time::Duration;

use cohort::process::{self, Criteria, Process};

fn main() {
    process::init(greet)
}

async fn greet(p: Process) -> cohort::Result<()> {
    for peer in (0..p.size()).filter(|peer| *peer != p.rank()) {
        p.send_to(peer, format!("Greetings P{} from P{}", peer, p.rank()))?;
    }

    for _ in 1..p.size() {
        let greeting = p.recv(Criteria::any()).await?;
        println!("{}", greeting.as_str().unwrap_or_default());
    }

    if let Some(ms) = std::env::args().nth(3).and_then(|a| a.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    Ok(())
}
