use std::io::{self, BufRead, Write};

use tracing::warn;

use super::{Dispatcher, InboundEvent, IncomingMessage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub handled: usize,
    pub skipped: usize,
}

/// Feeds one JSON message per line through `dispatcher`, writing each reply
/// as a JSON line to `out`. Unparsable lines and updates whose store work
/// fails are logged and skipped; only I/O errors stop the run.
pub fn replay<R: BufRead, W: Write>(
    dispatcher: &Dispatcher<'_>,
    input: R,
    mut out: W,
) -> io::Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: IncomingMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(line = idx + 1, error = %err, "unparsable update skipped");
                summary.skipped += 1;
                continue;
            }
        };
        let Some(event) = InboundEvent::classify(message) else {
            summary.skipped += 1;
            continue;
        };
        match dispatcher.dispatch(event) {
            Ok(reply) => {
                if let Some(reply) = reply {
                    serde_json::to_writer(&mut out, &reply)?;
                    writeln!(out)?;
                }
                summary.handled += 1;
            }
            Err(err) => {
                warn!(line = idx + 1, error = %err, "update failed, skipped");
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::ledger::{Ledger, LedgerError};

    const INPUT: &str = r#"
{"chat":{"id":1,"type":"private"},"from":{"id":1},"text":"/myid"}
not json at all
{"chat":{"id":1,"type":"private"},"from":{"id":1},"text":"/profile"}
{"chat":{"id":1,"type":"private"},"text":"no sender"}
{"chat":{"id":1,"type":"private"},"from":{"id":1},"text":"/chatid"}
"#;

    #[test]
    fn replies_are_written_as_json_lines() {
        let config = test_config();
        let ledger = Ledger::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(&config, &ledger);
        let mut out = Vec::new();
        let summary = replay(&dispatcher, INPUT.as_bytes(), &mut out).unwrap();
        assert_eq!(summary, ReplaySummary { handled: 3, skipped: 2 });
        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["text"], "Ваш ID: 1");
        assert!(lines[0].get("webapp_url").is_none());
    }

    #[test]
    fn store_failure_skips_only_that_update() {
        let config = test_config();
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .unit_of_work(|tx| {
                tx.execute_batch("ALTER TABLE users RENAME TO users_gone;")?;
                Ok::<_, LedgerError>(())
            })
            .unwrap();
        let dispatcher = Dispatcher::new(&config, &ledger);
        let mut out = Vec::new();
        let summary = replay(&dispatcher, INPUT.as_bytes(), &mut out).unwrap();
        assert_eq!(summary, ReplaySummary { handled: 2, skipped: 3 });
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("ID этого чата: 1"));
    }
}
