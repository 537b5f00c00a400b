//! Content status state machine
//!
//! | transition   | from                        | to        |
//! |--------------|-----------------------------|-----------|
//! | `Schedule`   | draft                       | scheduled |
//! | `Publish`    | draft, scheduled            | published |
//! | `Activate`   | scheduled (due)             | published |
//! | `Archive`    | draft, scheduled, published | archived  |
//! | `Unpublish`  | scheduled, published, archived | draft  |
//! | `Reactivate` | archived                    | draft, published, scheduled |
//!
//! Anything else, including a transition to the current status, is
//! rejected with [`ConstraintViolation::InvalidTransition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::ContentStatus;
use crate::error::ConstraintViolation;

/// Status a reactivated archived row moves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReactivateTarget {
    Draft,
    Published,
    Scheduled { at: DateTime<Utc> },
}

/// An explicit status change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Schedule(DateTime<Utc>),
    Publish,
    /// Scheduled-publish sweep; only ever issued for due rows
    Activate,
    Archive,
    Unpublish,
    Reactivate(ReactivateTarget),
}

impl Transition {
    pub fn target(&self) -> ContentStatus {
        match self {
            Transition::Schedule(_) => ContentStatus::Scheduled,
            Transition::Publish | Transition::Activate => ContentStatus::Published,
            Transition::Archive => ContentStatus::Archived,
            Transition::Unpublish => ContentStatus::Draft,
            Transition::Reactivate(ReactivateTarget::Draft) => ContentStatus::Draft,
            Transition::Reactivate(ReactivateTarget::Published) => ContentStatus::Published,
            Transition::Reactivate(ReactivateTarget::Scheduled { .. }) => {
                ContentStatus::Scheduled
            }
        }
    }

    /// Audit action name.
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Schedule(_) => "schedule",
            Transition::Publish => "publish",
            Transition::Activate => "scheduled_publish",
            Transition::Archive => "archive",
            Transition::Unpublish => "unpublish",
            Transition::Reactivate(_) => "reactivate",
        }
    }

    fn allowed_from(&self, from: ContentStatus) -> bool {
        use ContentStatus::*;
        match self {
            Transition::Schedule(_) => from == Draft,
            Transition::Publish => matches!(from, Draft | Scheduled),
            Transition::Activate => from == Scheduled,
            Transition::Archive => matches!(from, Draft | Scheduled | Published),
            Transition::Unpublish => matches!(from, Scheduled | Published | Archived),
            Transition::Reactivate(_) => from == Archived,
        }
    }
}

/// Effect of a transition on `published_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishedAt {
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// Column values a valid transition writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ContentStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: PublishedAt,
}

impl StatusChange {
    /// Resolve the new `published_at` given the stored one.
    pub fn published_at(&self, current: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self.published_at {
            PublishedAt::Keep => current,
            PublishedAt::Set(at) => Some(at),
            PublishedAt::Clear => None,
        }
    }
}

/// Validate `transition` from `from` at time `now`.
pub fn plan(
    from: ContentStatus,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<StatusChange, ConstraintViolation> {
    if !transition.allowed_from(from) {
        return Err(ConstraintViolation::InvalidTransition {
            from,
            to: transition.target(),
        });
    }

    let schedule = |at: DateTime<Utc>| {
        if at <= now {
            return Err(ConstraintViolation::ScheduleInPast);
        }
        Ok(StatusChange {
            status: ContentStatus::Scheduled,
            scheduled_at: Some(at),
            published_at: PublishedAt::Clear,
        })
    };
    let publish = StatusChange {
        status: ContentStatus::Published,
        scheduled_at: None,
        published_at: PublishedAt::Set(now),
    };
    let draft = StatusChange {
        status: ContentStatus::Draft,
        scheduled_at: None,
        published_at: PublishedAt::Clear,
    };

    match transition {
        Transition::Schedule(at) => schedule(at),
        Transition::Publish | Transition::Activate => Ok(publish),
        Transition::Archive => Ok(StatusChange {
            status: ContentStatus::Archived,
            scheduled_at: None,
            published_at: PublishedAt::Keep,
        }),
        Transition::Unpublish => Ok(draft),
        Transition::Reactivate(ReactivateTarget::Draft) => Ok(draft),
        Transition::Reactivate(ReactivateTarget::Published) => Ok(publish),
        Transition::Reactivate(ReactivateTarget::Scheduled { at }) => schedule(at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ContentStatus::*;

    fn all_transitions(now: DateTime<Utc>) -> Vec<Transition> {
        let future = now + Duration::hours(1);
        vec![
            Transition::Schedule(future),
            Transition::Publish,
            Transition::Activate,
            Transition::Archive,
            Transition::Unpublish,
            Transition::Reactivate(ReactivateTarget::Draft),
            Transition::Reactivate(ReactivateTarget::Published),
            Transition::Reactivate(ReactivateTarget::Scheduled { at: future }),
        ]
    }

    #[test]
    fn matrix_matches_documented_table() {
        let now = Utc::now();
        let allowed: &[(ContentStatus, &str)] = &[
            (Draft, "schedule"),
            (Draft, "publish"),
            (Scheduled, "publish"),
            (Scheduled, "scheduled_publish"),
            (Draft, "archive"),
            (Scheduled, "archive"),
            (Published, "archive"),
            (Scheduled, "unpublish"),
            (Published, "unpublish"),
            (Archived, "unpublish"),
            (Archived, "reactivate"),
        ];

        for from in ContentStatus::ALL {
            for transition in all_transitions(now) {
                let expected = allowed.contains(&(from, transition.action()));
                let result = plan(from, transition, now);
                assert_eq!(
                    result.is_ok(),
                    expected,
                    "{from} via {}",
                    transition.action()
                );
                if let Err(error) = result {
                    assert!(matches!(
                        error,
                        ConstraintViolation::InvalidTransition { from: f, to }
                            if f == from && to == transition.target()
                    ));
                }
            }
        }
    }

    #[test]
    fn schedule_requires_future_time() {
        let now = Utc::now();
        let result = plan(Draft, Transition::Schedule(now - Duration::seconds(1)), now);
        assert!(matches!(result, Err(ConstraintViolation::ScheduleInPast)));
    }

    #[test]
    fn archived_cannot_be_scheduled_directly() {
        let now = Utc::now();
        let result = plan(Archived, Transition::Schedule(now + Duration::hours(1)), now);
        assert!(matches!(
            result,
            Err(ConstraintViolation::InvalidTransition {
                from: Archived,
                to: Scheduled
            })
        ));
    }

    #[test]
    fn publish_stamps_time_and_clears_schedule() {
        let now = Utc::now();
        let change = plan(Scheduled, Transition::Publish, now).unwrap();
        assert_eq!(change.status, Published);
        assert_eq!(change.scheduled_at, None);
        assert_eq!(change.published_at(None), Some(now));
    }

    #[test]
    fn archive_keeps_published_at_and_unpublish_clears_it() {
        let now = Utc::now();
        let earlier = now - Duration::days(3);
        let archived = plan(Published, Transition::Archive, now).unwrap();
        assert_eq!(archived.published_at(Some(earlier)), Some(earlier));

        let draft = plan(Archived, Transition::Unpublish, now).unwrap();
        assert_eq!(draft.published_at(Some(earlier)), None);
    }
}
