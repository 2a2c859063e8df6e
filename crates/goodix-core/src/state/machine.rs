//! Sequential state machine engine.
//!
//! A machine runs states `0..nr_states` in order. Each state handler starts
//! whatever asynchronous operation it needs and returns a [`Step`] telling
//! the engine what to do next; `Step::Wait` parks the machine until a
//! continuation delivers the real step through [`resume`].
//!
//! A state may start a child machine. The child's success advances the
//! parent and its failure fails the parent. Only the innermost machine is
//! driven at any time.
//!
//! The completion callback of a top-level run is invoked exactly once,
//! after the run has been removed from the stack.

use std::fmt;

use tracing::{debug, trace, warn};

use crate::dispatch::Continuation;
use crate::error::DriverError;
use crate::protocol::Reply;

/// Outcome of a state handler or of the operation it waited on.
pub enum Step<C> {
    /// An operation is in flight; its continuation will resume the machine.
    Wait,
    /// Advance to the next state, completing after the last one.
    Next,
    /// Continue at an explicit state.
    Jump(usize),
    /// Abort the whole run.
    Fail(DriverError),
    /// Run a child machine; its result decides this state.
    Child(Ssm<C>),
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Wait => write!(f, "Wait"),
            Step::Next => write!(f, "Next"),
            Step::Jump(state) => write!(f, "Jump({state})"),
            Step::Fail(e) => write!(f, "Fail({e})"),
            Step::Child(ssm) => write!(f, "Child({})", ssm.name),
        }
    }
}

impl<C> From<Result<(), DriverError>> for Step<C> {
    fn from(result: Result<(), DriverError>) -> Self {
        match result {
            Ok(()) => Step::Wait,
            Err(e) => Step::Fail(e),
        }
    }
}

pub type StateFn<C> = fn(&mut C, usize) -> Step<C>;

pub type Completion<C> = Box<dyn FnOnce(&mut C, Result<(), DriverError>)>;

/// One run of a state machine.
pub struct Ssm<C> {
    name: &'static str,
    nr_states: usize,
    cur_state: usize,
    run_state: StateFn<C>,
    on_complete: Option<Completion<C>>,
}

impl<C> Ssm<C> {
    pub fn new(name: &'static str, nr_states: usize, run_state: StateFn<C>) -> Self {
        Self {
            name,
            nr_states,
            cur_state: 0,
            run_state,
            on_complete: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cur_state(&self) -> usize {
        self.cur_state
    }
}

/// The running machine and its ancestors, innermost last.
pub struct SsmStack<C> {
    runs: Vec<Ssm<C>>,
}

impl<C> SsmStack<C> {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn is_idle(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.runs.len()
    }

    /// Name and state of the innermost machine.
    pub fn current(&self) -> Option<(&'static str, usize)> {
        self.runs.last().map(|ssm| (ssm.name, ssm.cur_state))
    }
}

impl<C> Default for SsmStack<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Context the machines run against.
pub trait SsmHost: Sized {
    fn machines(&mut self) -> &mut SsmStack<Self>;
}

/// Start a top-level run.
///
/// Fails with `InvalidState` if a machine is already running; the callback
/// is dropped uncalled in that case.
pub fn start<C, F>(host: &mut C, mut ssm: Ssm<C>, on_complete: F) -> Result<(), DriverError>
where
    C: SsmHost,
    F: FnOnce(&mut C, Result<(), DriverError>) + 'static,
{
    if let Some((name, state)) = host.machines().current() {
        warn!(running = name, state, requested = ssm.name, "State machine already running");
        return Err(DriverError::InvalidState);
    }

    debug!(machine = ssm.name, states = ssm.nr_states, "Starting state machine");
    if ssm.nr_states == 0 {
        on_complete(host, Ok(()));
        return Ok(());
    }
    ssm.on_complete = Some(Box::new(on_complete));
    host.machines().runs.push(ssm);
    let step = enter(host);
    resume(host, step);
    Ok(())
}

/// Deliver a step to the innermost machine and keep driving until it waits
/// or the top-level run completes.
pub fn resume<C: SsmHost>(host: &mut C, mut step: Step<C>) {
    loop {
        let Some(top) = host.machines().runs.last_mut() else {
            if !matches!(step, Step::Wait) {
                warn!(step = ?step, "Step delivered with no running state machine");
            }
            return;
        };

        step = match step {
            Step::Wait => return,
            Step::Next => {
                top.cur_state += 1;
                if top.cur_state < top.nr_states {
                    enter(host)
                } else {
                    match finish(host, Ok(())) {
                        Some(step) => step,
                        None => return,
                    }
                }
            }
            Step::Jump(state) if state >= top.nr_states => {
                warn!(machine = top.name, state, "Jump out of range");
                Step::Fail(DriverError::InvalidState)
            }
            Step::Jump(state) => {
                top.cur_state = state;
                enter(host)
            }
            Step::Fail(err) => match finish(host, Err(err)) {
                Some(step) => step,
                None => return,
            },
            Step::Child(child) if child.nr_states == 0 => Step::Next,
            Step::Child(child) => {
                trace!(parent = top.name, child = child.name, "Starting child machine");
                host.machines().runs.push(child);
                enter(host)
            }
        };
    }
}

/// Fail every running machine; the top-level callback receives `err()`.
pub fn abort_all<C: SsmHost>(host: &mut C, err: impl Fn() -> DriverError) {
    let runs: Vec<Ssm<C>> = host.machines().runs.drain(..).collect();
    for run in runs.into_iter().rev() {
        if let Some(on_complete) = run.on_complete {
            debug!(machine = run.name, state = run.cur_state, "Aborting state machine");
            on_complete(host, Err(err()));
        }
    }
}

/// Wrap a reply handler into a continuation that resumes the machine.
///
/// An error result fails the machine without calling `f`.
pub fn then<C, F>(f: F) -> Continuation<C>
where
    C: SsmHost + 'static,
    F: FnOnce(&mut C, Reply) -> Step<C> + 'static,
{
    Box::new(move |host: &mut C, result: Result<Reply, DriverError>| {
        let step = match result {
            Ok(reply) => f(host, reply),
            Err(e) => Step::Fail(e),
        };
        resume(host, step);
    })
}

fn enter<C: SsmHost>(host: &mut C) -> Step<C> {
    let Some(top) = host.machines().runs.last() else {
        return Step::Wait;
    };
    let (run_state, state, name) = (top.run_state, top.cur_state, top.name);
    trace!(machine = name, state, "Entering state");
    run_state(host, state)
}

/// Pop the innermost run. Returns the step for its parent, or `None` once
/// a top-level run has reported completion.
fn finish<C: SsmHost>(host: &mut C, result: Result<(), DriverError>) -> Option<Step<C>> {
    let done = host.machines().runs.pop()?;
    match &result {
        Ok(()) => debug!(machine = done.name, "State machine completed"),
        Err(e) => debug!(machine = done.name, state = done.cur_state, error = %e, "State machine failed"),
    }

    match done.on_complete {
        Some(on_complete) => {
            on_complete(host, result);
            None
        }
        None => Some(match result {
            Ok(()) => Step::Next,
            Err(e) => Step::Fail(e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[derive(Default)]
    struct Host {
        machines: SsmStack<Host>,
        visited: Vec<(&'static str, usize)>,
        completions: Vec<Result<(), String>>,
    }

    impl SsmHost for Host {
        fn machines(&mut self) -> &mut SsmStack<Self> {
            &mut self.machines
        }
    }

    fn record(host: &mut Host, result: Result<(), DriverError>) {
        host.completions.push(result.map_err(|e| e.to_string()));
    }

    fn fail_at_two(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("main", state));
        if state == 2 {
            Step::Fail(ProtocolError::CommandFailed { command: 2 }.into())
        } else {
            Step::Next
        }
    }

    #[test]
    fn test_failure_short_circuits() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("main", 5, fail_at_two), record).unwrap();

        assert_eq!(host.visited, vec![("main", 0), ("main", 1), ("main", 2)]);
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].as_ref().unwrap_err().contains("0x02"));
        assert!(host.machines.is_idle());
    }

    fn waits(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("wait", state));
        Step::Wait
    }

    #[test]
    fn test_wait_and_resume() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("wait", 2, waits), record).unwrap();
        assert_eq!(host.machines.current(), Some(("wait", 0)));

        resume(&mut host, Step::Next);
        assert_eq!(host.machines.current(), Some(("wait", 1)));
        assert!(host.completions.is_empty());

        resume(&mut host, Step::Next);
        assert_eq!(host.completions, vec![Ok(())]);

        // Stale steps after completion are ignored.
        resume(&mut host, Step::Next);
        assert_eq!(host.completions.len(), 1);
    }

    fn child_states(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("child", state));
        Step::Next
    }

    fn failing_child(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("child", state));
        Step::Fail(DriverError::Cancelled)
    }

    fn parent_states(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("parent", state));
        match state {
            1 => Step::Child(Ssm::new("child", 2, child_states)),
            _ => Step::Next,
        }
    }

    fn parent_with_failing_child(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("parent", state));
        match state {
            0 => Step::Child(Ssm::new("child", 3, failing_child)),
            _ => Step::Next,
        }
    }

    #[test]
    fn test_child_success_advances_parent() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("parent", 3, parent_states), record).unwrap();

        assert_eq!(
            host.visited,
            vec![
                ("parent", 0),
                ("parent", 1),
                ("child", 0),
                ("child", 1),
                ("parent", 2)
            ]
        );
        assert_eq!(host.completions, vec![Ok(())]);
    }

    #[test]
    fn test_child_failure_fails_parent() {
        let mut host = Host::default();
        start(
            &mut host,
            Ssm::new("parent", 3, parent_with_failing_child),
            record,
        )
        .unwrap();

        assert_eq!(host.visited, vec![("parent", 0), ("child", 0)]);
        assert_eq!(
            host.completions,
            vec![Err("Operation cancelled".to_string())]
        );
    }

    fn jumps(host: &mut Host, state: usize) -> Step<Host> {
        host.visited.push(("jump", state));
        match state {
            0 => Step::Jump(2),
            _ => Step::Jump(7),
        }
    }

    #[test]
    fn test_jump_out_of_range_fails() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("jump", 3, jumps), record).unwrap();

        assert_eq!(host.visited, vec![("jump", 0), ("jump", 2)]);
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].is_err());
    }

    #[test]
    fn test_second_start_rejected() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("wait", 2, waits), record).unwrap();
        let err = start(&mut host, Ssm::new("wait", 2, waits), record).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState));
        assert!(host.completions.is_empty());
    }

    #[test]
    fn test_abort_all_reports_once() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("wait", 2, waits), record).unwrap();
        resume(&mut host, Step::Child(Ssm::new("wait", 1, waits)));
        assert_eq!(host.machines.depth(), 2);

        abort_all(&mut host, || DriverError::Cancelled);
        assert!(host.machines.is_idle());
        assert_eq!(
            host.completions,
            vec![Err("Operation cancelled".to_string())]
        );
    }

    #[test]
    fn test_then_routes_errors_to_failure() {
        let mut host = Host::default();
        start(&mut host, Ssm::new("wait", 3, waits), record).unwrap();

        let continuation = then(|_: &mut Host, _reply| Step::Next);
        continuation(&mut host, Ok(Reply::None));
        assert_eq!(host.machines.current(), Some(("wait", 1)));

        let continuation = then(|_: &mut Host, _reply| Step::Next);
        continuation(&mut host, Err(DriverError::NotActivated));
        assert_eq!(
            host.completions,
            vec![Err("Device is not activated".to_string())]
        );
    }
}
