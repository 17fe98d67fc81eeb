use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::Error;
use crate::value::Value;

pub(crate) type Slot = oneshot::Sender<Result<Value, Error>>;

/// A command waiting for its response.
#[derive(Debug)]
pub struct QueuedCommand {
    command: Value,
    slot: Option<Slot>,
    sent: bool,
    handshake: bool,
}

impl QueuedCommand {
    pub fn new(command: Value) -> (QueuedCommand, oneshot::Receiver<Result<Value, Error>>) {
        let (tx, rx) = oneshot::channel();
        let queued = QueuedCommand {
            command,
            slot: Some(tx),
            sent: false,
            handshake: false,
        };
        (queued, rx)
    }

    pub fn handshake(command: Value) -> (QueuedCommand, oneshot::Receiver<Result<Value, Error>>) {
        let (mut queued, rx) = QueuedCommand::new(command);
        queued.handshake = true;
        (queued, rx)
    }

    pub fn command(&self) -> &Value {
        &self.command
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn mark_sent(&mut self) {
        debug_assert!(!self.sent, "command transmitted twice");
        self.sent = true;
    }

    pub fn is_handshake(&self) -> bool {
        self.handshake
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_none()
    }

    /// Delivers the result to whoever holds the receiving end. Only the first call has an
    /// effect; a dropped receiver is not an error.
    pub fn resolve(&mut self, result: Result<Value, Error>) {
        match self.slot.take() {
            Some(slot) => {
                let _ = slot.send(result);
            }
            None => {
                debug_assert!(false, "command resolved twice");
                warn!("ignoring second resolution of command {}", self.command);
            }
        }
    }
}

/// FIFO of outstanding commands. Only the head is ever in flight.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> CommandQueue {
        CommandQueue::default()
    }

    pub fn push(&mut self, command: QueuedCommand) {
        self.commands.push_back(command);
    }

    /// Only used for the handshake, which must precede anything queued while connecting.
    pub fn push_front(&mut self, command: QueuedCommand) {
        debug_assert!(
            self.commands.front().map_or(true, |head| !head.is_sent()),
            "cannot jump ahead of a transmitted command"
        );
        self.commands.push_front(command);
    }

    pub fn head(&self) -> Option<&QueuedCommand> {
        self.commands.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut QueuedCommand> {
        self.commands.front_mut()
    }

    /// Returns the head if it has been transmitted and is therefore awaiting a response.
    pub fn awaiting_response(&self) -> Option<&QueuedCommand> {
        self.head().filter(|head| head.is_sent())
    }

    /// Removes the head and resolves it with `result`.
    pub fn resolve_head(&mut self, result: Result<Value, Error>) -> Option<QueuedCommand> {
        let mut head = self.commands.pop_front()?;
        head.resolve(result);
        Some(head)
    }

    /// Fails every queued command with `err`, oldest first.
    pub fn fail_all(&mut self, err: &Error) {
        while let Some(mut command) = self.commands.pop_front() {
            command.resolve(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
