//! Plain-text rendering of a room.

use std::fmt::Write;

use estimo_core::{Celebration, TableView};

pub fn table(room: &str, view: &TableView) -> String {
    let mut out = String::new();
    let state = if view.revealed { "revealed" } else { "hidden" };
    let _ = writeln!(out, "── room {room} ({state}) ──");

    let width = view.rows.iter().map(|r| r.username.chars().count()).max().unwrap_or(0);
    for row in &view.rows {
        let marker = if row.is_self { "*" } else { " " };
        let _ = writeln!(out, " {marker} {:<width$}  {}", row.username, row.estimate);
    }
    if view.rows.is_empty() {
        let _ = writeln!(out, "   nobody is voting");
    }
    if !view.spectators.is_empty() {
        let _ = writeln!(out, "   watching: {}", view.spectators.join(", "));
    }
    out
}

pub fn celebration(c: &Celebration) -> String {
    format!("*** consensus on {} ({} votes) ***", c.estimate, c.voters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use estimo_core::{Estimate, EstimateView, ParticipantRow};

    fn row(username: &str, estimate: EstimateView, is_self: bool) -> ParticipantRow {
        ParticipantRow {
            id: username.to_lowercase(),
            username: username.into(),
            estimate,
            is_self,
        }
    }

    #[test]
    fn test_render_hidden_table() {
        let view = TableView {
            revealed: false,
            self_estimate: Some(Estimate::Five),
            rows: vec![
                row("Alice", EstimateView::Visible(Estimate::Five), true),
                row("Bob", EstimateView::Hidden, false),
                row("Carol", EstimateView::NotSubmitted, false),
            ],
            spectators: vec!["Sam".into()],
        };
        let text = table("3f9a1c07b2", &view);
        assert!(text.starts_with("── room 3f9a1c07b2 (hidden) ──"));
        assert!(text.contains(" * Alice  5"));
        assert!(text.contains("   Bob    ?"));
        assert!(text.contains("watching: Sam"));
    }

    #[test]
    fn test_render_celebration() {
        let c = Celebration {
            estimate: Estimate::Eight,
            voters: 3,
        };
        assert_eq!(celebration(&c), "*** consensus on 8 (3 votes) ***");
    }
}
