//! TrainingJob status conditions

use ome_common::crd::{
    is_condition_true, set_condition, Condition, ConditionStatus, TrainingJob, TrainingJobStatus,
    TRAIN_JOB_CREATED, TRAIN_JOB_SUSPENDED,
};
use ome_common::events::reasons;

/// Reason of `Suspended=True`
pub const SUSPENDED_REASON: &str = "Suspended";
/// Reason of `Suspended=False` after a resume
pub const RESUMED_REASON: &str = "Resumed";

/// Outcome of materializing the runtime objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectOperation {
    /// Every object was created or updated
    Succeeded,
    /// The runtime could not build the objects
    BuildFailed,
    /// Creating an object failed
    CreateFailed,
    /// Updating an existing object failed
    UpdateFailed,
    /// The FineTunedWeight could not be created
    FineTunedWeightFailed,
}

/// Set `Created` from the object operation outcome
pub fn set_created_condition(status: &mut TrainingJobStatus, op: ObjectOperation) -> bool {
    let condition = match op {
        ObjectOperation::Succeeded => Condition::new(
            TRAIN_JOB_CREATED,
            ConditionStatus::True,
            reasons::JOBS_CREATION_SUCCEEDED,
            "Succeeded to create Jobs",
        ),
        ObjectOperation::BuildFailed => Condition::new(
            TRAIN_JOB_CREATED,
            ConditionStatus::False,
            reasons::JOBS_BUILD_FAILED,
            "Failed to build Jobs",
        ),
        ObjectOperation::CreateFailed
        | ObjectOperation::UpdateFailed
        | ObjectOperation::FineTunedWeightFailed => Condition::new(
            TRAIN_JOB_CREATED,
            ConditionStatus::False,
            reasons::JOBS_CREATION_FAILED,
            "Failed to create Jobs",
        ),
    };
    set_condition(&mut status.conditions, condition)
}

/// Mirror the suspend flag; a resume flips an existing `True` to `False`
pub fn set_suspended_condition(status: &mut TrainingJobStatus, job: &TrainingJob) -> bool {
    if job.is_suspended() {
        set_condition(
            &mut status.conditions,
            Condition::new(
                TRAIN_JOB_SUSPENDED,
                ConditionStatus::True,
                SUSPENDED_REASON,
                "TrainJob is suspended",
            ),
        )
    } else if is_condition_true(&status.conditions, TRAIN_JOB_SUSPENDED) {
        set_condition(
            &mut status.conditions,
            Condition::new(
                TRAIN_JOB_SUSPENDED,
                ConditionStatus::False,
                RESUMED_REASON,
                "TrainJob is resumed",
            ),
        )
    } else {
        false
    }
}

/// Record the runtime's terminal condition, if any
pub fn set_terminal_condition(status: &mut TrainingJobStatus, terminal: Option<Condition>) -> bool {
    terminal.is_some_and(|c| set_condition(&mut status.conditions, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ome_common::crd::{find_condition, TrainingJobSpec, TRAIN_JOB_COMPLETE};

    #[test]
    fn test_created_condition_per_outcome() {
        let mut status = TrainingJobStatus::default();
        assert!(set_created_condition(&mut status, ObjectOperation::Succeeded));
        assert!(!set_created_condition(&mut status, ObjectOperation::Succeeded));

        assert!(set_created_condition(&mut status, ObjectOperation::BuildFailed));
        let created = find_condition(&status.conditions, TRAIN_JOB_CREATED).unwrap();
        assert_eq!(created.status, ConditionStatus::False);
        assert_eq!(created.reason, "JobsBuildFailed");

        set_created_condition(&mut status, ObjectOperation::UpdateFailed);
        let created = find_condition(&status.conditions, TRAIN_JOB_CREATED).unwrap();
        assert_eq!(created.reason, "JobsCreationFailed");
    }

    /// Story: suspend then resume leaves Suspended=False with reason Resumed
    #[test]
    fn story_suspend_and_resume() {
        let mut job = TrainingJob::new("ft", TrainingJobSpec::default());
        let mut status = TrainingJobStatus::default();

        assert!(!set_suspended_condition(&mut status, &job));
        assert!(status.conditions.is_empty());

        job.spec.suspend = Some(true);
        assert!(set_suspended_condition(&mut status, &job));
        assert!(is_condition_true(&status.conditions, TRAIN_JOB_SUSPENDED));

        job.spec.suspend = Some(false);
        assert!(set_suspended_condition(&mut status, &job));
        let suspended = find_condition(&status.conditions, TRAIN_JOB_SUSPENDED).unwrap();
        assert_eq!(suspended.status, ConditionStatus::False);
        assert_eq!(suspended.reason, RESUMED_REASON);

        assert!(!set_suspended_condition(&mut status, &job));
    }

    #[test]
    fn test_terminal_condition() {
        let mut status = TrainingJobStatus::default();
        assert!(!set_terminal_condition(&mut status, None));
        assert!(set_terminal_condition(
            &mut status,
            Some(Condition::new(
                TRAIN_JOB_COMPLETE,
                ConditionStatus::True,
                "JobSetCompleted",
                ""
            ))
        ));
        assert!(is_condition_true(&status.conditions, TRAIN_JOB_COMPLETE));
    }
}
