//! Console front-end
//!
//! Renders decision prompts on the terminal and publishes the operator's
//! allow/deny answer back onto the bus. Runs only in foreground mode;
//! prompts for a pid that resolved itself in the meantime are still
//! answered, and the containment handler treats the late decision as a
//! no-op.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::Bus;
use crate::event::{DecisionPrompt, Event, EventKind};

/// Subscribe to decision prompts and spawn the prompt loop. Consumes its
/// subscription directly because answering requires awaiting stdin.
pub fn spawn(bus: &Bus) -> JoinHandle<()> {
    let mut sub = bus.subscribe("console", &[EventKind::AskUserAllowOrDeny]);
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Some(event) = sub.rx.recv().await {
            match event {
                Event::Stop => break,
                Event::AskUserAllowOrDeny(prompt) => {
                    ask(&bus, &prompt, &mut stdin).await;
                }
                other => crate::bus::unexpected_event("console", &other),
            }
        }
        debug!("console stopped");
    })
}

async fn ask(
    bus: &Bus,
    prompt: &DecisionPrompt,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) {
    println!();
    println!("*** Crypto ransom behavior detected ***");
    println!("  PID:     {}", prompt.pid);
    println!("  Command: {}", prompt.cmdline);
    println!("  File:    {}", prompt.path.display());
    println!("***************************************");
    print!("> Kill it? (Y/n) ");
    use std::io::Write as _;
    let _ = std::io::stdout().flush();

    let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
    let allow = answer.trim().to_lowercase().starts_with('n');
    if allow {
        bus.publish(Event::UserAllowProcess { pid: prompt.pid });
    } else {
        bus.publish(Event::UserDenyProcess { pid: prompt.pid });
    }
}
