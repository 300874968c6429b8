//! Machine status report parsing
//!
//! Decodes real-time status reports of the form
//! `<Idle|WPos:0.000,0.000,0.000|FS:0,0>` into structured snapshots.
//! See the Real-time Status Reports section of the grbl interface docs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine state reported in the leading token of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)] // wire-defined state names
pub enum MachineState {
    Idle,
    Run,
    Hold(Option<u8>),
    Jog,
    Alarm,
    Door(Option<u8>),
    Check,
    Home,
    Sleep,
    /// State name this implementation does not know; kept verbatim so newer
    /// firmware states pass through instead of being dropped.
    Unknown(String),
}

impl MachineState {
    /// Parse a state token such as `Idle`, `Hold:0`, or `Door:3`.
    pub fn from_token(token: &str) -> MachineState {
        let (name, sub) = match token.split_once(':') {
            Some((name, sub)) => (name, sub.parse::<u8>().ok()),
            None => (token, None),
        };
        match name {
            "Idle" => MachineState::Idle,
            "Run" => MachineState::Run,
            "Hold" => MachineState::Hold(sub),
            "Jog" => MachineState::Jog,
            "Alarm" => MachineState::Alarm,
            "Door" => MachineState::Door(sub),
            "Check" => MachineState::Check,
            "Home" => MachineState::Home,
            "Sleep" => MachineState::Sleep,
            _ => MachineState::Unknown(token.to_string()),
        }
    }

    /// Name as it appears on the wire (sub-code stripped).
    pub fn name(&self) -> &str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Run => "Run",
            MachineState::Hold(_) => "Hold",
            MachineState::Jog => "Jog",
            MachineState::Alarm => "Alarm",
            MachineState::Door(_) => "Door",
            MachineState::Check => "Check",
            MachineState::Home => "Home",
            MachineState::Sleep => "Sleep",
            MachineState::Unknown(token) => token,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded status report.
///
/// Replaced wholesale on each report: a missing field means "unknown for this
/// snapshot", never "unchanged since the last one".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStateSnapshot {
    /// Machine state; always present (reports with no parseable leading state
    /// are discarded rather than turned into a snapshot).
    pub state: MachineState,
    /// `WPos:` work position, if reported.
    pub work_position: Option<[f64; 3]>,
    /// `MPos:` machine position, if reported.
    pub machine_position: Option<[f64; 3]>,
    /// `FS:` feed rate, if reported.
    pub feed_rate: Option<f64>,
    /// `FS:` spindle speed, if reported.
    pub spindle_speed: Option<f64>,
    /// When this report was observed locally.
    pub observed_at: DateTime<Utc>,
}

impl MachineStateSnapshot {
    /// Parse the raw text of a status report line.
    ///
    /// Returns `None` only when no leading state token exists. Malformed
    /// numeric fields cause that field to be omitted, not the whole parse to
    /// fail; unknown `|`-delimited fields are ignored for forward
    /// compatibility.
    pub fn parse(raw: &str) -> Option<MachineStateSnapshot> {
        let inner = raw
            .trim()
            .strip_prefix('<')
            .unwrap_or(raw)
            .trim_end_matches('>');
        let mut fields = inner.split('|');

        let state_token = fields.next().unwrap_or("").trim();
        if state_token.is_empty() {
            return None;
        }

        let mut snapshot = MachineStateSnapshot {
            state: MachineState::from_token(state_token),
            work_position: None,
            machine_position: None,
            feed_rate: None,
            spindle_speed: None,
            observed_at: Utc::now(),
        };

        for field in fields {
            if let Some(rest) = field.strip_prefix("WPos:") {
                snapshot.work_position = parse_triplet(rest);
            } else if let Some(rest) = field.strip_prefix("MPos:") {
                snapshot.machine_position = parse_triplet(rest);
            } else if let Some(rest) = field.strip_prefix("FS:") {
                let (feed, speed) = parse_feed_speed(rest);
                snapshot.feed_rate = feed;
                snapshot.spindle_speed = speed;
            } else if let Some(rest) = field.strip_prefix("F:") {
                // Feed-only variant, reported when spindle is absent.
                snapshot.feed_rate = rest.trim().parse().ok();
            }
            // Ov:, Pn:, Bf:, Ln:, A: and anything newer are ignored.
        }

        Some(snapshot)
    }
}

fn parse_triplet(text: &str) -> Option<[f64; 3]> {
    let mut parts = text.split(',');
    let x = parts.next()?.trim().parse().ok()?;
    let y = parts.next()?.trim().parse().ok()?;
    let z = parts.next()?.trim().parse().ok()?;
    Some([x, y, z])
}

fn parse_feed_speed(text: &str) -> (Option<f64>, Option<f64>) {
    let mut parts = text.split(',');
    let feed = parts.next().and_then(|p| p.trim().parse().ok());
    let speed = parts.next().and_then(|p| p.trim().parse().ok());
    (feed, speed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(raw: &str) -> Option<MachineStateSnapshot> {
        MachineStateSnapshot::parse(raw)
    }

    #[test]
    fn test_full_report() {
        let snap = parse("<Idle|WPos:1.000,2.000,3.000|FS:500,1000>").unwrap();
        assert_eq!(snap.state, MachineState::Idle);
        assert_eq!(snap.work_position, Some([1.0, 2.0, 3.0]));
        assert_eq!(snap.machine_position, None);
        assert_eq!(snap.feed_rate, Some(500.0));
        assert_eq!(snap.spindle_speed, Some(1000.0));
    }

    #[test]
    fn test_state_only() {
        let snap = parse("<Run>").unwrap();
        assert_eq!(snap.state, MachineState::Run);
        assert_eq!(snap.work_position, None);
        assert_eq!(snap.machine_position, None);
        assert_eq!(snap.feed_rate, None);
        assert_eq!(snap.spindle_speed, None);
    }

    #[test]
    fn test_state_with_sub_code() {
        let snap = parse("<Hold:0|MPos:0.000,0.000,0.000>").unwrap();
        assert_eq!(snap.state, MachineState::Hold(Some(0)));
        assert_eq!(snap.machine_position, Some([0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_fields_in_any_order() {
        let snap = parse("<Jog|FS:500,0|WPos:-1.500,0.000,2.000>").unwrap();
        assert_eq!(snap.state, MachineState::Jog);
        assert_eq!(snap.work_position, Some([-1.5, 0.0, 2.0]));
        assert_eq!(snap.feed_rate, Some(500.0));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let snap = parse("<Idle|MPos:0.000,0.000,0.000|Bf:15,128|Ov:100,100,100>").unwrap();
        assert_eq!(snap.state, MachineState::Idle);
        assert_eq!(snap.machine_position, Some([0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_malformed_triplet_omits_field_only() {
        let snap = parse("<Idle|WPos:abc,0.000,0.000|FS:500,1000>").unwrap();
        assert_eq!(snap.state, MachineState::Idle);
        assert_eq!(snap.work_position, None);
        assert_eq!(snap.feed_rate, Some(500.0));
    }

    #[test]
    fn test_empty_state_token_discards_report() {
        assert_eq!(parse("<>"), None);
        assert_eq!(parse("<|WPos:0.000,0.000,0.000>"), None);
    }

    #[test]
    fn test_unknown_state_kept_verbatim() {
        let snap = parse("<Tool|MPos:0.000,0.000,0.000>").unwrap();
        assert_eq!(snap.state, MachineState::Unknown("Tool".to_string()));
        assert_eq!(snap.state.name(), "Tool");
    }
}
