//! Command Handoff
//!
//! Moves commands from connection tasks onto the single thread that owns
//! simulation state. Submission never waits: the queue is unbounded and
//! there is no completion signal back to the submitter.

use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::game::command::CommandRequest;

/// Name given to the authoritative thread.
pub const SIMULATION_THREAD_NAME: &str = "simulation";

/// Executes commands against authoritative state.
///
/// Only ever called from the simulation thread, one request at a time.
pub trait CommandExecutor: Send + 'static {
    /// Apply one command.
    fn execute(&mut self, request: CommandRequest);
}

/// Handoff errors.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The simulation thread is gone and can no longer accept work.
    #[error("simulation thread stopped, `{command}` command dropped")]
    SimulationStopped {
        /// Name of the command that could not be queued.
        command: &'static str,
    },
    /// The OS refused to start the simulation thread.
    #[error("failed to spawn simulation thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The simulation thread panicked.
    #[error("simulation thread panicked")]
    Panicked,
}

/// Submission side of the handoff. Cheap to clone, one per connection.
#[derive(Debug, Clone)]
pub struct CommandHandoff {
    tx: mpsc::UnboundedSender<CommandRequest>,
}

impl CommandHandoff {
    /// Queue a command for the simulation thread.
    ///
    /// `Ok` means the command was accepted, not that it was applied.
    pub fn submit(&self, request: CommandRequest) -> Result<(), HandoffError> {
        let command = request.name();
        self.tx
            .send(request)
            .map_err(|_| HandoffError::SimulationStopped { command })?;
        debug!(command, "Command handed off to simulation thread");
        Ok(())
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of the handoff, owned by whoever runs the simulation.
#[derive(Debug)]
pub struct CommandQueue {
    rx: mpsc::UnboundedReceiver<CommandRequest>,
}

impl CommandQueue {
    /// Take the next queued command without blocking.
    pub fn try_next(&mut self) -> Option<CommandRequest> {
        self.rx.try_recv().ok()
    }

    /// Block the current thread until a command arrives.
    ///
    /// Returns `None` once every [`CommandHandoff`] has been dropped.
    /// Must not be called from inside the async runtime.
    pub fn blocking_next(&mut self) -> Option<CommandRequest> {
        self.rx.blocking_recv()
    }
}

/// Create a connected handoff/queue pair.
pub fn command_channel() -> (CommandHandoff, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandHandoff { tx }, CommandQueue { rx })
}

/// The authoritative simulation thread.
pub struct SimulationThread<E: CommandExecutor> {
    handle: JoinHandle<E>,
}

impl<E: CommandExecutor> SimulationThread<E> {
    /// Start draining `queue` into `executor` on a dedicated thread.
    ///
    /// The thread runs until every handoff for the queue is dropped.
    pub fn spawn(mut queue: CommandQueue, mut executor: E) -> Result<Self, HandoffError> {
        let handle = thread::Builder::new()
            .name(SIMULATION_THREAD_NAME.to_string())
            .spawn(move || {
                info!("Simulation thread started");
                let mut executed = 0u64;
                while let Some(request) = queue.blocking_next() {
                    executor.execute(request);
                    executed += 1;
                }
                info!(executed, "Simulation thread stopped");
                executor
            })?;

        Ok(Self { handle })
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit and take back the executor.
    pub fn join(self) -> Result<E, HandoffError> {
        self.handle.join().map_err(|_| HandoffError::Panicked)
    }
}

/// Spawn a simulation thread and return the handoff that feeds it.
pub fn spawn_simulation<E: CommandExecutor>(
    executor: E,
) -> Result<(CommandHandoff, SimulationThread<E>), HandoffError> {
    let (handoff, queue) = command_channel();
    let thread = SimulationThread::spawn(queue, executor)?;
    Ok((handoff, thread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::command::{CompanionId, EntityCommand};

    #[derive(Default)]
    struct RecordingExecutor {
        seen: Vec<(CommandRequest, Option<String>)>,
    }

    impl CommandExecutor for RecordingExecutor {
        fn execute(&mut self, request: CommandRequest) {
            let thread_name = thread::current().name().map(str::to_string);
            self.seen.push((request, thread_name));
        }
    }

    #[test]
    fn test_submit_reaches_queue() {
        let (handoff, mut queue) = command_channel();
        handoff
            .submit(CommandRequest::skin(CompanionId::new("e1"), "custom", "/x.png"))
            .unwrap();

        let request = queue.try_next().unwrap();
        assert_eq!(request.companion_id, CompanionId::new("e1"));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_submit_after_queue_dropped_fails() {
        let (handoff, queue) = command_channel();
        drop(queue);

        assert!(handoff.is_closed());
        let result = handoff.submit(CommandRequest::skin(CompanionId::new("e1"), "default", ""));
        assert!(matches!(
            result,
            Err(HandoffError::SimulationStopped { command: "skin" })
        ));
    }

    #[test]
    fn test_commands_run_on_simulation_thread_in_order() {
        let (handoff, thread) = spawn_simulation(RecordingExecutor::default()).unwrap();

        for i in 0..10 {
            handoff
                .submit(CommandRequest::skin(
                    CompanionId::new(format!("e{}", i)),
                    "custom",
                    format!("/skins/{}.png", i),
                ))
                .unwrap();
        }
        drop(handoff);

        let executor = thread.join().unwrap();
        assert_eq!(executor.seen.len(), 10);
        for (i, (request, thread_name)) in executor.seen.iter().enumerate() {
            assert_eq!(request.companion_id, CompanionId::new(format!("e{}", i)));
            assert_eq!(thread_name.as_deref(), Some(SIMULATION_THREAD_NAME));
            let EntityCommand::Skin(change) = &request.command;
            assert_eq!(change.skin_path, format!("/skins/{}.png", i));
        }
    }

    #[test]
    fn test_thread_stops_when_handoffs_dropped() {
        let (handoff, thread) = spawn_simulation(RecordingExecutor::default()).unwrap();
        let second = handoff.clone();
        drop(handoff);
        drop(second);

        let executor = thread.join().unwrap();
        assert!(executor.seen.is_empty());
    }
}
