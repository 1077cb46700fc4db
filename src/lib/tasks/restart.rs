//! Restart policy evaluation and backoff computation.
//!
//! Everything here works on a task value owned by the caller; nothing reads
//! or writes the store.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{DesiredState, RestartPolicy, State, Task};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

impl RestartPolicy {
    pub fn should_restart(&self, state: State) -> bool {
        match self {
            RestartPolicy::Always => state == State::Finished || state.is_failure(),
            RestartPolicy::OnFailure => state.is_failure(),
            RestartPolicy::Never => false,
        }
    }
}

/// Restart event a reported state leads to, if the task's policy asks for one.
pub fn restart_kind(task: &Task) -> Option<DesiredState> {
    if !task.container.restart_policy.should_restart(task.state) {
        return None;
    }

    match task.state {
        State::FailedOnStartup => Some(DesiredState::RestartingWithBackOff),
        _ => Some(DesiredState::RestartingImmediately),
    }
}

/// Delay before the next backoff restart. Expects the current restart to be
/// the last entry of `task.restarts` already.
pub fn backoff_delay(task: &Task, long_uptime: Duration, max_delay: Duration) -> Duration {
    let [.., previous, last] = task.restarts.as_slice() else {
        return INITIAL_BACKOFF;
    };

    if last_run_exceeded(task, long_uptime) {
        return INITIAL_BACKOFF;
    }

    let since_previous = (*last - *previous).to_std().unwrap_or_default();
    since_previous
        .saturating_mul(2)
        .max(INITIAL_BACKOFF)
        .min(max_delay)
}

fn last_run_exceeded(task: &Task, long_uptime: Duration) -> bool {
    let (Some(started), Some(finished)) = (task.started_at, task.finished_at) else {
        return false;
    };

    uptime(started, finished) > long_uptime
}

fn uptime(started: DateTime<Utc>, finished: DateTime<Utc>) -> Duration {
    (finished - started).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::{ContainerSpec, Image};
    use chrono::TimeDelta;

    const LONG: Duration = Duration::from_secs(60);
    const MAX: Duration = Duration::from_secs(300);

    fn task(policy: RestartPolicy, state: State) -> Task {
        let mut task = Task::new("job", ContainerSpec::new(Image::parse("busybox")));
        task.container.restart_policy = policy;
        task.state = state;
        task
    }

    #[test]
    fn policies_decide_on_reported_state() {
        assert!(RestartPolicy::Always.should_restart(State::Finished));
        assert!(RestartPolicy::Always.should_restart(State::FailedAfterStartup));
        assert!(!RestartPolicy::OnFailure.should_restart(State::Finished));
        assert!(RestartPolicy::OnFailure.should_restart(State::FailedOnStartup));
        assert!(!RestartPolicy::Never.should_restart(State::FailedOnStartup));
        assert!(!RestartPolicy::Always.should_restart(State::Running));
    }

    #[test]
    fn startup_failures_back_off() {
        let t = task(RestartPolicy::OnFailure, State::FailedOnStartup);
        assert_eq!(restart_kind(&t), Some(DesiredState::RestartingWithBackOff));

        let t = task(RestartPolicy::OnFailure, State::FailedAfterStartup);
        assert_eq!(restart_kind(&t), Some(DesiredState::RestartingImmediately));

        let t = task(RestartPolicy::Always, State::Finished);
        assert_eq!(restart_kind(&t), Some(DesiredState::RestartingImmediately));

        let t = task(RestartPolicy::Never, State::FailedAfterStartup);
        assert_eq!(restart_kind(&t), None);
    }

    #[test]
    fn first_restart_waits_one_second() {
        let mut t = task(RestartPolicy::OnFailure, State::FailedOnStartup);
        t.restarts.push(Utc::now());
        assert_eq!(backoff_delay(&t, LONG, MAX), Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_time_since_previous_restart() {
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(3);
        let mut t = task(RestartPolicy::OnFailure, State::FailedOnStartup);
        t.restarts = vec![t0, t1];

        assert_eq!(backoff_delay(&t, LONG, MAX), Duration::from_secs(6));
    }

    #[test]
    fn long_uptime_resets_backoff() {
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(120);
        let mut t = task(RestartPolicy::Always, State::FailedAfterStartup);
        t.restarts = vec![t0, t1];
        t.started_at = Some(t0 + TimeDelta::seconds(1));
        t.finished_at = Some(t0 + TimeDelta::seconds(100));

        assert_eq!(backoff_delay(&t, LONG, MAX), INITIAL_BACKOFF);
    }

    #[test]
    fn backoff_is_capped() {
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(400);
        let mut t = task(RestartPolicy::OnFailure, State::FailedOnStartup);
        t.restarts = vec![t0, t1];

        assert_eq!(backoff_delay(&t, LONG, MAX), MAX);
    }
}
