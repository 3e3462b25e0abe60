use serde::Serialize;

/// Lifecycle of the supervised detector.
///
/// Starting and Started are distinct variants, so they can never hold at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SupervisorState {
    #[default]
    Uninitialized,
    Idle,
    Starting,
    Started,
}

impl SupervisorState {
    pub fn status(self) -> Status {
        Status {
            is_starting: self == SupervisorState::Starting,
            is_started: self == SupervisorState::Started,
        }
    }

    /// Human readable label used in log messages.
    pub fn label(self) -> &'static str {
        match self {
            SupervisorState::Uninitialized => "uninitialized",
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Started => "started",
        }
    }

    /// Numeric encoding exported as the `detector_state` gauge.
    pub(crate) fn gauge_value(self) -> f64 {
        match self {
            SupervisorState::Uninitialized => -1.0,
            SupervisorState::Idle => 0.0,
            SupervisorState::Starting => 1.0,
            SupervisorState::Started => 2.0,
        }
    }
}

/// Snapshot returned by `Supervisor::status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub is_starting: bool,
    pub is_started: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_and_started_are_never_reported_together() {
        for state in [
            SupervisorState::Uninitialized,
            SupervisorState::Idle,
            SupervisorState::Starting,
            SupervisorState::Started,
        ] {
            let status = state.status();
            assert!(
                !(status.is_starting && status.is_started),
                "{} reports both",
                state.label()
            );
        }
        assert!(SupervisorState::Starting.status().is_starting);
        assert!(SupervisorState::Started.status().is_started);
    }

    #[test]
    fn status_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(SupervisorState::Starting.status()).expect("serializes");
        assert_eq!(json, serde_json::json!({"isStarting": true, "isStarted": false}));
    }
}
