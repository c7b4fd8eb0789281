//! Error taxonomy for backup, restore, and failover operations.
//!
//! Destructive-path errors always carry the identifying manifest, session, or
//! event id plus the failing component. Notification errors exist only so
//! channels can report them; the dispatcher logs and drops them.

/// CLI surface an error is reported through. Exit codes differ per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
    Failover,
    Prune,
}

#[derive(thiserror::Error, Debug)]
pub enum DrError {
    #[error("prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("environment '{environment}' is busy: another backup or restore holds its lock")]
    Busy { environment: String },

    #[error("capture of '{component}' failed: {message}")]
    Capture { component: String, message: String },

    #[error("verification of '{component}' failed: {message}")]
    Verification { component: String, message: String },

    #[error("upload of '{component}' failed after {attempts} attempt(s): {message}")]
    Transport {
        component: String,
        attempts: u32,
        message: String,
    },

    #[error("restore session {session_id} failed at component '{component}': {message}")]
    Restore {
        session_id: String,
        component: String,
        message: String,
    },

    #[error("failover to '{site}' refused: {message}")]
    FailoverPrecondition { site: String, message: String },

    #[error("notification via {channel} failed: {message}")]
    Notification { channel: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type DrResult<T> = Result<T, DrError>;

impl DrError {
    /// Process exit code for an error that aborted `op` before it produced a
    /// manifest, session, or failover event.
    pub fn exit_code(&self, op: Operation) -> u8 {
        match (op, self) {
            (Operation::Failover, DrError::FailoverPrecondition { .. }) => 3,
            (Operation::Failover, _) => 1,
            (
                _,
                DrError::Prerequisite(_)
                | DrError::Busy { .. }
                | DrError::NotFound(_)
                | DrError::Config(_),
            ) => 2,
            _ => 1,
        }
    }

    /// Component named by the error, if any.
    pub fn component(&self) -> Option<&str> {
        match self {
            DrError::Capture { component, .. }
            | DrError::Verification { component, .. }
            | DrError::Transport { component, .. }
            | DrError::Restore { component, .. } => Some(component),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_prerequisite_map_to_two() {
        let busy = DrError::Busy {
            environment: "prod".into(),
        };
        assert_eq!(busy.exit_code(Operation::Restore), 2);
        assert_eq!(busy.exit_code(Operation::Backup), 2);
        assert_eq!(
            DrError::Prerequisite("kubectl missing".into()).exit_code(Operation::Backup),
            2
        );
    }

    #[test]
    fn failover_refusal_maps_to_three() {
        let refused = DrError::FailoverPrecondition {
            site: "dr".into(),
            message: "unhealthy".into(),
        };
        assert_eq!(refused.exit_code(Operation::Failover), 3);
        assert_eq!(
            DrError::Prerequisite("dns".into()).exit_code(Operation::Failover),
            1
        );
    }

    #[test]
    fn component_is_reported() {
        let err = DrError::Capture {
            component: "cache".into(),
            message: "snapshot timed out".into(),
        };
        assert_eq!(err.component(), Some("cache"));
        assert!(err.to_string().contains("cache"));
    }
}
