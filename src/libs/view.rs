use super::presence::{sources_to_string, TransitionRecord, UnifiedPresenceRecord};
use anyhow::Result;
use chrono::Local;
use prettytable::{row, Table};

pub struct View {}

impl View {
    pub fn transitions(transitions: &[TransitionRecord]) -> Result<()> {
        let mut table = Table::new();

        table.add_row(row!["ID", "TIME", "FROM", "TO", "CONTEXT", "CONFIDENCE", "IN PREVIOUS", "SOURCES"]);
        for transition in transitions {
            table.add_row(row![
                transition.id.unwrap_or(0),
                transition.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                transition.from_state,
                transition.to_state,
                transition.context,
                format!("{:.2}", transition.confidence),
                format_duration(transition.duration_secs),
                sources_to_string(&transition.contributing_sources)
            ]);
        }
        table.printstd();

        Ok(())
    }

    pub fn presence(record: &UnifiedPresenceRecord) -> Result<()> {
        let mut table = Table::new();

        table.add_row(row!["STATE", record.state]);
        table.add_row(row!["CONTEXT", record.context]);
        table.add_row(row!["CONFIDENCE", format!("{:.2}", record.confidence)]);
        table.add_row(row!["AVAILABILITY", format!("{:.2}", record.availability_score)]);
        table.add_row(row!["ATTENTION", format!("{:.2}", record.attention_level)]);
        table.add_row(row!["RECEPTIVITY", format!("{:.2}", record.interruption_receptivity)]);
        table.add_row(row![
            "RETURN IN",
            record
                .predicted_return_minutes
                .map_or_else(|| "-".to_string(), |minutes| format!("{:.0} min", minutes))
        ]);
        table.add_row(row!["IN STATE", format_duration(record.duration_in_state_secs)]);
        table.printstd();

        Ok(())
    }
}

/// `1h 05m`, `12m 30s` or `45s`.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45.2), "45s");
        assert_eq!(format_duration(750.0), "12m 30s");
        assert_eq!(format_duration(3900.0), "1h 05m");
        assert_eq!(format_duration(-3.0), "0s");
    }
}
