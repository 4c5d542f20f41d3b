use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::AppointmentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionVerb {
    Submit,
    Confirm,
    CheckIn,
    Start,
    Complete,
    MarkNoShow,
    Cancel,
    Reschedule,
}

impl TransitionVerb {
    pub const ALL: [TransitionVerb; 8] = [
        TransitionVerb::Submit,
        TransitionVerb::Confirm,
        TransitionVerb::CheckIn,
        TransitionVerb::Start,
        TransitionVerb::Complete,
        TransitionVerb::MarkNoShow,
        TransitionVerb::Cancel,
        TransitionVerb::Reschedule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionVerb::Submit => "submit",
            TransitionVerb::Confirm => "confirm",
            TransitionVerb::CheckIn => "check_in",
            TransitionVerb::Start => "start",
            TransitionVerb::Complete => "complete",
            TransitionVerb::MarkNoShow => "mark_no_show",
            TransitionVerb::Cancel => "cancel",
            TransitionVerb::Reschedule => "reschedule",
        }
    }

    pub fn target(self) -> AppointmentStatus {
        match self {
            TransitionVerb::Submit => AppointmentStatus::Pending,
            TransitionVerb::Confirm => AppointmentStatus::Confirmed,
            TransitionVerb::CheckIn => AppointmentStatus::CheckedIn,
            TransitionVerb::Start => AppointmentStatus::InProgress,
            TransitionVerb::Complete => AppointmentStatus::Completed,
            TransitionVerb::MarkNoShow => AppointmentStatus::NoShow,
            TransitionVerb::Cancel => AppointmentStatus::Cancelled,
            TransitionVerb::Reschedule => AppointmentStatus::Rescheduled,
        }
    }

    /// The verb that leads into `status`; `draft` has none.
    pub fn for_target(status: AppointmentStatus) -> Option<TransitionVerb> {
        TransitionVerb::ALL
            .into_iter()
            .find(|verb| verb.target() == status)
    }
}

impl fmt::Display for TransitionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Terminal {
        current: AppointmentStatus,
    },
    NotAllowed {
        current: AppointmentStatus,
        verb: TransitionVerb,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Terminal { current } => {
                write!(f, "{current} is terminal; book a new appointment instead")
            }
            Rejection::NotAllowed { current, verb } => {
                write!(f, "{verb} is not allowed from {current}")
            }
        }
    }
}

pub fn allowed_targets(from: AppointmentStatus) -> &'static [AppointmentStatus] {
    use AppointmentStatus::*;

    match from {
        Draft => &[Pending, Cancelled],
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[CheckedIn, Cancelled, NoShow, Rescheduled],
        CheckedIn => &[InProgress, Cancelled],
        InProgress => &[Completed, Cancelled],
        Rescheduled => &[Confirmed, Cancelled],
        Completed | Cancelled | NoShow => &[],
    }
}

pub fn is_allowed(from: AppointmentStatus, verb: TransitionVerb) -> bool {
    allowed_targets(from).contains(&verb.target())
}

/// Resolves `(current, verb)` to the next status or the reason it is refused.
pub fn check(current: AppointmentStatus, verb: TransitionVerb) -> Result<AppointmentStatus, Rejection> {
    if current.is_terminal() {
        return Err(Rejection::Terminal { current });
    }
    if is_allowed(current, verb) {
        Ok(verb.target())
    } else {
        Err(Rejection::NotAllowed { current, verb })
    }
}

/// Verbs a UI can offer for an appointment in `current`.
pub fn available_verbs(current: AppointmentStatus) -> Vec<TransitionVerb> {
    TransitionVerb::ALL
        .into_iter()
        .filter(|verb| is_allowed(current, *verb))
        .collect()
}
