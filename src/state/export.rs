//! Accumulated per-subject per-period results and their rendering.
//!
//! One row is appended per subject at every iteration boundary; the buffer
//! is rendered whole at round rollovers (temporary snapshot) and at test end
//! (final flush). The `GlobalID` column is the real id a subject carried
//! when first admitted, stable across round reshuffles.

use crate::config::OutputFormat;
use crate::types::*;
use serde::Serialize;
use std::collections::BTreeMap;

pub const CSV_HEADER: &str = "GlobalID,PlayerID,GroupID,Choice,Payoff,Period,Round,Theta,X,Practice,x,Q";

/// One subject's record for one completed period.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CsvRow {
    pub global_id: RealId,
    pub player_id: ModId,
    pub group: GroupNo,
    /// 0 = time-varying stream, 1 = constant
    pub choice: u8,
    pub payoff: f64,
    pub period: IterNo,
    pub round: RoundNo,
    pub theta: f64,
    /// The group's visible average for the period
    pub x: f64,
    pub practice: u8,
    /// Candidate values offered going into the next period
    pub rand_offer: f64,
    pub const_offer: f64,
}

impl CsvRow {
    fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.global_id,
            self.player_id,
            self.group,
            self.choice,
            self.payoff,
            self.period,
            self.round,
            self.theta,
            self.x,
            self.practice,
            self.rand_offer,
            self.const_offer,
        )
    }
}

/// Rows grouped by round, then by global id (ascending), in append order
/// within a subject.
#[derive(Debug, Default, Serialize)]
pub struct OutputBuffer {
    rounds: BTreeMap<RoundNo, BTreeMap<RealId, Vec<CsvRow>>>,
}

impl OutputBuffer {
    pub fn push(&mut self, row: CsvRow) {
        self.rounds
            .entry(row.round)
            .or_default()
            .entry(row.global_id)
            .or_default()
            .push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn clear(&mut self) {
        self.rounds.clear();
    }

    pub fn row_count(&self) -> usize {
        self.rounds
            .values()
            .flat_map(|subjects| subjects.values())
            .map(Vec::len)
            .sum()
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Csv => self.render_csv(),
            OutputFormat::Json => self.render_json(),
        }
    }

    /// One section per round: a `Round N` title line, the column header,
    /// then every subject's rows.
    fn render_csv(&self) -> String {
        let mut out = String::new();
        for (round, subjects) in &self.rounds {
            out.push_str(&format!("Round {}\n{}\n", round, CSV_HEADER));
            for rows in subjects.values() {
                for row in rows {
                    out.push_str(&row.to_line());
                    out.push('\n');
                }
            }
        }
        out
    }

    fn render_json(&self) -> String {
        serde_json::to_string_pretty(&self.rounds).unwrap_or_else(|e| {
            tracing::error!("Failed to render output buffer as JSON: {}", e);
            String::from("{}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(round: RoundNo, global_id: RealId, period: IterNo) -> CsvRow {
        CsvRow {
            global_id,
            player_id: (global_id - 1) % 2 + 1,
            group: (global_id - 1) / 2 + 1,
            choice: 0,
            payoff: 101.25,
            period,
            round,
            theta: 100.0,
            x: 99.5,
            practice: 0,
            rand_offer: 101.25,
            const_offer: 80.0,
        }
    }

    #[test]
    fn test_csv_sections_and_ordering() {
        let mut buffer = OutputBuffer::default();
        buffer.push(row(1, 2, 1));
        buffer.push(row(1, 1, 1));
        buffer.push(row(1, 1, 2));
        buffer.push(row(2, 1, 1));

        let csv = buffer.render(OutputFormat::Csv);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Round 1");
        assert_eq!(lines[1], CSV_HEADER);
        // global id 1's rows come before global id 2's, in period order
        assert!(lines[2].starts_with("1,1,1,"));
        assert!(lines[3].starts_with("1,1,1,"));
        assert!(lines[4].starts_with("2,2,1,"));
        assert_eq!(lines[5], "Round 2");
        assert_eq!(lines[6], CSV_HEADER);
        assert_eq!(buffer.row_count(), 4);
    }

    #[test]
    fn test_csv_row_field_order() {
        let line = row(3, 4, 7).to_line();
        assert_eq!(line, "4,2,2,0,101.25,7,3,100,99.5,0,101.25,80");
    }

    #[test]
    fn test_json_render_is_valid() {
        let mut buffer = OutputBuffer::default();
        buffer.push(row(1, 1, 1));
        let json = buffer.render(OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.get("1").is_some());
    }

    #[test]
    fn test_clear() {
        let mut buffer = OutputBuffer::default();
        buffer.push(row(1, 1, 1));
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
