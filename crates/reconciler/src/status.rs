//! Status mutation helpers.

use chrono::Utc;

use crate::error::{Error, Result};
use crate::store::OperatorClient;
use crate::types::{OperatorCondition, OperatorStatus};

/// A single status mutation applied inside [`update_status`].
pub type UpdateStatusFn = Box<dyn Fn(&mut OperatorStatus) -> Result<()> + Send + Sync>;

/// Read the current status, apply `mutators` in order and write the result
/// back against the resource version it was read at.
///
/// Nothing is written when the mutators leave the status unchanged; the
/// returned flag tells whether a write happened.
///
/// # Errors
///
/// Propagates read and mutator errors, and [`crate::Error::Conflict`] when the
/// status was changed by someone else in between.
pub async fn update_status(
    client: &dyn OperatorClient,
    mutators: &[UpdateStatusFn],
) -> Result<(OperatorStatus, bool)> {
    let (_, original, resource_version) = client.get().await?;

    let mut status = original.clone();
    for mutate in mutators {
        mutate(&mut status)?;
    }

    if status == original {
        return Ok((original, false));
    }

    let updated = client.update_status(&resource_version, status).await?;
    Ok((updated, true))
}

/// Mutator that upserts `condition`.
pub fn update_condition_fn(condition: OperatorCondition) -> UpdateStatusFn {
    Box::new(move |status: &mut OperatorStatus| {
        set_condition(&mut status.conditions, condition.clone());
        Ok(())
    })
}

/// Mutator that moves the latest available revision from `expected` to
/// `next`.
///
/// Fails with [`Error::RevisionMoved`] when the stored revision is no longer
/// `expected`, so a revision recorded by another writer is never moved
/// backwards.
pub fn advance_revision_fn(expected: u32, next: u32) -> UpdateStatusFn {
    Box::new(move |status: &mut OperatorStatus| {
        if status.latest_available_revision != expected {
            return Err(Error::RevisionMoved {
                expected,
                actual: status.latest_available_revision,
                next,
            });
        }
        status.latest_available_revision = next;
        Ok(())
    })
}

/// Insert or update the condition with the same type.
///
/// The transition time moves only when the condition is new or its status
/// changes.
pub fn set_condition(conditions: &mut Vec<OperatorCondition>, mut new: OperatorCondition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = Some(Utc::now());
            }
            existing.reason = new.reason;
            existing.message = new.message;
        }
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(Utc::now());
            }
            conditions.push(new);
        }
    }
}

/// Find the condition with the given type.
pub fn find_condition<'a>(
    conditions: &'a [OperatorCondition],
    type_: &str,
) -> Option<&'a OperatorCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}
