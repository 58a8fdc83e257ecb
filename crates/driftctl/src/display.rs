//! Human-readable event rendering

use drift_common::Event;
use owo_colors::OwoColorize;

/// One-line summary of an event
pub fn summary(event: &Event) -> String {
    let ts = event.timestamp().format("%H:%M:%S");
    let body = match event {
        Event::FlipFlop { setting, flip_count, .. } => format!(
            "{} {} flipping ({} observations in window)",
            "FLIP".red().bold(),
            setting.bold(),
            flip_count
        ),
        Event::Mutation { setting, old, new, .. } => format!(
            "{} {} '{}' -> '{}'",
            "MUT ".yellow().bold(),
            setting.bold(),
            old,
            new
        ),
        Event::LockViolation {
            setting,
            expected,
            actual,
            restored,
            ..
        } => {
            let outcome = if *restored {
                "restored".green().to_string()
            } else {
                "not restored".red().to_string()
            };
            format!(
                "{} {} expected '{}', found '{}' ({})",
                "LOCK".magenta().bold(),
                setting.bold(),
                expected,
                actual,
                outcome
            )
        }
        Event::ConnectionObserved {
            process,
            pid,
            remote_endpoint,
            ..
        } => format!(
            "{} {}[{}] -> {}",
            "CONN".cyan().bold(),
            process,
            pid,
            remote_endpoint
        ),
    };
    format!("{} {}", ts.dimmed(), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::{SettingRef, Value};

    #[test]
    fn test_lock_summary_mentions_values() {
        let event = Event::lock_violation(
            SettingRef::new("WindowsUpdate", "DeferDays"),
            Value::from("72h"),
            Value::from("24h"),
            true,
        );
        let line = summary(&event);
        assert!(line.contains("WindowsUpdate\\DeferDays"));
        assert!(line.contains("72h"));
        assert!(line.contains("24h"));
        assert!(line.contains("restored"));
    }

    #[test]
    fn test_connection_summary() {
        let line = summary(&Event::connection("sshd", 812, "10.0.0.4:22"));
        assert!(line.contains("sshd[812]"));
        assert!(line.contains("10.0.0.4:22"));
    }
}
