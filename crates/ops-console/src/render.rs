use ops_protocol::{ProgressEvent, ScopeKey};
use ops_tracker::{OperationState, SessionView};

/// Single status line for the current view, or `None` while idle.
pub(crate) fn status_line(scope: &ScopeKey, view: &SessionView) -> Option<String> {
    if view.state == OperationState::Idle {
        return None;
    }
    let mut line = format!("[{scope}] {}", view.state);
    let message = view
        .progress
        .as_ref()
        .and_then(|progress| progress.message.as_deref())
        .or(view.message.as_deref());
    if let Some(message) = message {
        line.push_str(": ");
        line.push_str(message);
    }
    if let Some(progress) = view.progress.as_ref() {
        if let Some(percent) = progress.detail.percent_complete {
            line.push_str(&format!(" ({percent:.0}%)"));
        }
        if let Some(step) = progress.detail.current_step.as_deref() {
            line.push_str(&format!(" - {step}"));
        }
    }
    if let Some(reason) = view.failure_reason.as_deref() {
        line.push_str(&format!(" [{reason}]"));
    }
    if view.timed_out {
        line.push_str(" (taking longer than expected)");
    }
    if view.reconciling {
        line.push_str(" (refreshing)");
    }
    Some(line)
}

pub(crate) fn event_line(event: &ProgressEvent) -> String {
    let mut line = format!("{} {}", event.scope, event.status());
    if let Some(reason) = event.kind.reason() {
        line.push_str(&format!(" [{reason}]"));
    } else if let Some(message) = event.message.as_deref() {
        line.push_str(&format!(": {message}"));
    }
    if let Some(percent) = event.detail.percent_complete {
        line.push_str(&format!(" ({percent:.0}%)"));
    }
    line
}

/// Prints status lines to stderr, skipping repeats.
#[derive(Default)]
pub(crate) struct StatusPrinter {
    last: Option<String>,
}

impl StatusPrinter {
    pub(crate) fn print(&mut self, scope: &ScopeKey, view: &SessionView) {
        let Some(line) = status_line(scope, view) else {
            return;
        };
        if self.last.as_deref() == Some(line.as_str()) {
            return;
        }
        eprintln!("{line}");
        self.last = Some(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_protocol::{ProgressDetail, ProgressKind};
    use ops_tracker::ProgressDisplay;

    #[test]
    fn idle_view_prints_nothing() {
        assert!(status_line(&ScopeKey::agent("dock-1"), &SessionView::default()).is_none());
    }

    #[test]
    fn progress_line_includes_detail() {
        let view = SessionView {
            state: OperationState::InProgress,
            message: Some("Running discovery".to_string()),
            progress: Some(ProgressDisplay {
                state: OperationState::InProgress,
                message: None,
                detail: ProgressDetail {
                    current_step: Some("collecting facts".to_string()),
                    percent_complete: Some(42.4),
                    ..ProgressDetail::default()
                },
            }),
            timed_out: true,
            ..SessionView::default()
        };
        let scope: ScopeKey = "vm:pve1:101".parse().expect("scope");
        assert_eq!(
            status_line(&scope, &view).expect("line"),
            "[vm:pve1:101] in_progress: Running discovery (42%) - collecting facts (taking longer than expected)"
        );
    }

    #[test]
    fn event_line_shows_reason() {
        let event = ProgressEvent::new(
            ScopeKey::agent("dock-1"),
            ProgressKind::Expired {
                reason: Some("command expired before agent acknowledged it".to_string()),
            },
        );
        assert_eq!(
            event_line(&event),
            "agent:dock-1:dock-1 expired [command expired before agent acknowledged it]"
        );
    }
}
