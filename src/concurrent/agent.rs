//! Cooperative agents and the runners that drive them.
//!
//! An agent is a unit of duty-cycle work: `do_work` returns how much it did
//! and the composing runner idles proportionally. There is no ambient task
//! scheduling; every suspension point is an explicit idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::error::CountedErrorHandler;

use super::idle::{IdleStrategy, Idler};

#[derive(Error, Debug)]
pub enum AgentError {
    /// The agent has finished and its runner should stop.
    #[error("agent terminated")]
    Terminated,
    /// A work-cycle failure; routed to the error sink, the agent keeps running.
    #[error(transparent)]
    Failed(#[from] crate::error::Error),
}

pub trait Agent: Send {
    /// One duty cycle. Returns units of work done.
    fn do_work(&mut self) -> Result<usize, AgentError>;

    fn role_name(&self) -> &'static str;

    /// Called once when the runner or invoker stops driving the agent.
    fn on_close(&mut self) {}
}

/// Spawns one thread per agent and drives it with an idle strategy until
/// the agent terminates or the handle is closed.
pub struct AgentRunner;

impl AgentRunner {
    pub fn start<A: Agent + 'static>(
        mut agent: A,
        strategy: IdleStrategy,
        errors: CountedErrorHandler,
    ) -> std::io::Result<AgentRunnerHandle> {
        let role = agent.role_name();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = std::thread::Builder::new().name(role.to_string()).spawn(
            move || {
                tracing::debug!(role, "agent started");
                let mut idler = Idler::new(strategy);
                while thread_running.load(Ordering::Acquire) {
                    match agent.do_work() {
                        Ok(work_count) => idler.idle(work_count),
                        Err(AgentError::Terminated) => break,
                        Err(AgentError::Failed(error)) => {
                            errors.on_error(&error);
                            idler.idle(0);
                        }
                    }
                }
                agent.on_close();
                tracing::debug!(role, "agent stopped");
            },
        )?;

        Ok(AgentRunnerHandle {
            role,
            running,
            thread: Some(thread),
        })
    }
}

pub struct AgentRunnerHandle {
    role: &'static str,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AgentRunnerHandle {
    pub fn role_name(&self) -> &'static str {
        self.role
    }

    /// Signal the agent to stop and wait for its thread to exit.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AgentRunnerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drives an agent cooperatively from a caller's own duty cycle, for
/// deployments where the agent must not have its own thread.
pub struct AgentInvoker<A: Agent> {
    agent: A,
    errors: CountedErrorHandler,
    closed: bool,
}

impl<A: Agent> AgentInvoker<A> {
    pub fn new(agent: A, errors: CountedErrorHandler) -> Self {
        Self {
            agent,
            errors,
            closed: false,
        }
    }

    /// One cooperative invocation. Returns units of work done.
    pub fn invoke(&mut self) -> usize {
        if self.closed {
            return 0;
        }

        match self.agent.do_work() {
            Ok(work_count) => work_count,
            Err(AgentError::Terminated) => {
                self.closed = true;
                self.agent.on_close();
                0
            }
            Err(AgentError::Failed(error)) => {
                self.errors.on_error(&error);
                0
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingAgent {
        cycles: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        terminate_at: Option<usize>,
    }

    impl Agent for CountingAgent {
        fn do_work(&mut self) -> Result<usize, AgentError> {
            let n = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if self.terminate_at == Some(n) {
                return Err(AgentError::Terminated);
            }
            if self.fail_at == Some(n) {
                return Err(AgentError::Failed(crate::error::Error::Client(
                    crate::client::ClientError::ClientClosed,
                )));
            }
            Ok(1)
        }

        fn role_name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn runner_stops_on_termination() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let handle = AgentRunner::start(
            CountingAgent {
                cycles: Arc::clone(&cycles),
                fail_at: None,
                terminate_at: Some(3),
            },
            IdleStrategy::BusySpin,
            CountedErrorHandler::default(),
        )
        .unwrap();

        while cycles.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }
        handle.close();
        assert_eq!(cycles.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invoker_routes_failures_to_sink_and_continues() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let errors = CountedErrorHandler::new(Arc::new(|_| {}));
        let mut invoker = AgentInvoker::new(
            CountingAgent {
                cycles,
                fail_at: Some(2),
                terminate_at: Some(4),
            },
            errors.clone(),
        );

        assert_eq!(invoker.invoke(), 1);
        assert_eq!(invoker.invoke(), 0);
        assert_eq!(errors.error_count(), 1);
        assert_eq!(invoker.invoke(), 1);
        assert_eq!(invoker.invoke(), 0);
        assert!(invoker.is_closed());
        assert_eq!(invoker.invoke(), 0);
    }
}
