use super::types::{State, Task, TaskError, TaskResult};

fn allowed_transitions(src: State) -> &'static [State] {
    match src {
        State::Pending => &[State::Scheduled],
        State::Scheduled => &[State::Running, State::FailedOnStartup],
        State::Running => &[State::Finished, State::FailedAfterStartup],
        State::Finished | State::FailedOnStartup | State::FailedAfterStartup => {
            &[State::RestartingImmediately, State::RestartingWithBackOff]
        }
        State::RestartingImmediately | State::RestartingWithBackOff => &[State::Scheduled],
    }
}

/// Staying in the same state is always allowed.
pub fn valid_state_transition(src: State, dst: State) -> bool {
    src == dst || allowed_transitions(src).contains(&dst)
}

impl Task {
    pub fn transition(&mut self, to: State) -> TaskResult<()> {
        if !valid_state_transition(self.state, to) {
            return Err(TaskError::StateTransitionNotAllowed {
                from: self.state,
                to,
            });
        }

        self.state = to;
        Ok(())
    }
}
