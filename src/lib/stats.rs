use serde::Serialize;
use tracing::info;

use crate::{
    events::AcceptEvent,
    utils::{paint, BOLD_GRAY, BOLD_WHITE},
};

/// Running share counters across all slots.
///
/// Donation verdicts only count towards `donated`; `accepted`, `rejected` and `total_diff`
/// cover the shares that went to the configured pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShareStats {
    pub accepted: u64,
    pub rejected: u64,
    pub donated: u64,
    /// Sum of the difficulty of accepted shares.
    pub total_diff: u64,
}

impl ShareStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: &AcceptEvent) {
        if event.donation {
            self.donated += 1;
        } else if event.is_rejected() {
            self.rejected += 1;
        } else {
            self.accepted += 1;
            self.total_diff = self.total_diff.saturating_add(event.result.diff);
        }
    }

    /// Submitted shares answered by the configured pools.
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    /// Logs one verdict the way verbose mode prints it.
    pub fn log(&self, event: &AcceptEvent, colors: bool) {
        if event.donation {
            return;
        }
        let verdict = match &event.error {
            Some(error) => format!("rejected ({error})"),
            None => "accepted".to_string(),
        };
        info!(
            "#{:03} {} ({}/{}) diff {} {}",
            event.mapper_id,
            paint(colors, BOLD_WHITE, &verdict),
            self.accepted,
            self.rejected,
            event.result.diff,
            paint(colors, BOLD_GRAY, &format!("({} ms)", event.result.elapsed_ms)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SubmitResult;

    fn event(diff: u64, donation: bool, error: Option<&str>) -> AcceptEvent {
        AcceptEvent {
            mapper_id: 1,
            session_id: Some(1),
            result: SubmitResult::new(1, diff),
            donation,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_counts_by_verdict_and_origin() {
        let mut stats = ShareStats::new();
        stats.add(&event(1000, false, None));
        stats.add(&event(2000, false, None));
        stats.add(&event(1000, false, Some("Low difficulty share")));
        stats.add(&event(500, true, None));

        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.donated, 1);
        assert_eq!(stats.total_diff, 3000);
        assert_eq!(stats.total(), 3);
    }
}
