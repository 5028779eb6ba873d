//! Single-task runtime for one daemon's collective engine
//!
//! All engine state lives inside [`CollectiveRuntime`], which drains one
//! queue of events: inbound messages, topology changes and local commands.
//! [`CollectiveHandle`] is the cloneable front door; fence and group calls
//! return a [`Pending`] that resolves when the collective is released.
//!
//! ```ignore
//! let (handle, events) = CollectiveHandle::channel();
//! let runtime = CollectiveRuntime::new(engine, effects, events);
//! tokio::join!(runtime.run(), async {
//!     let pending = handle.fence(signature, FenceOptions::default(), data).await?;
//!     let bucket = pending.wait().await?;
//!     handle.shutdown();
//! });
//! ```

use crate::engine::CollectiveEngine;
use crate::errors::{CollectiveError, CollectiveResult};
use crate::fence::FenceOptions;
use crate::group::{GroupOutcome, GroupRequest};
use crate::signature::FenceSignature;
use crate::tracker::Completion;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use trellis_core::{CollectiveEffects, DaemonId, Status, Tag, TopologyChange};

/// Local request queued for the runtime
#[derive(Debug)]
pub enum Command {
    /// Start a broadcast
    Xcast {
        tag: Tag,
        payload: Vec<u8>,
        reply: oneshot::Sender<CollectiveResult<()>>,
    },
    /// Contribute to a fence
    Fence {
        signature: FenceSignature,
        options: FenceOptions,
        data: Vec<u8>,
        completion: Completion<Vec<u8>>,
        reply: oneshot::Sender<CollectiveResult<()>>,
    },
    /// Take part in a group operation
    Group {
        request: GroupRequest,
        completion: Completion<GroupOutcome>,
        reply: oneshot::Sender<CollectiveResult<()>>,
    },
    /// Stop the runtime
    Shutdown,
}

/// Everything the runtime reacts to
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A message from the transport
    Inbound {
        from: DaemonId,
        tag: Tag,
        payload: Vec<u8>,
    },
    /// The topology provider reported a change
    Topology(TopologyChange),
    /// A local caller
    Command(Command),
}

/// Result of a submitted collective, available once it is released
#[derive(Debug)]
pub struct Pending<T> {
    completion: oneshot::Receiver<CollectiveResult<T>>,
}

impl<T> Pending<T> {
    fn new(completion: oneshot::Receiver<CollectiveResult<T>>) -> Self {
        Self { completion }
    }

    /// Wait for the release
    pub async fn wait(self) -> CollectiveResult<T> {
        self.completion
            .await
            .map_err(|_| CollectiveError::ChannelClosed)?
    }

    /// Wait for the release, giving up after `limit`
    pub async fn wait_for(self, limit: Duration) -> CollectiveResult<T> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(CollectiveError::Status(Status::Timeout)),
        }
    }
}

/// Cloneable handle feeding a [`CollectiveRuntime`]
#[derive(Debug, Clone)]
pub struct CollectiveHandle {
    events: mpsc::UnboundedSender<RuntimeEvent>,
}

impl CollectiveHandle {
    /// Create a handle and the event queue a runtime drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }

    fn post(&self, event: RuntimeEvent) -> CollectiveResult<()> {
        self.events
            .send(event)
            .map_err(|_| CollectiveError::ChannelClosed)
    }

    /// Queue an inbound transport message
    pub fn inbound(&self, from: DaemonId, tag: Tag, payload: Vec<u8>) -> CollectiveResult<()> {
        self.post(RuntimeEvent::Inbound { from, tag, payload })
    }

    /// Queue a topology change notification
    pub fn topology_changed(&self, change: TopologyChange) -> CollectiveResult<()> {
        self.post(RuntimeEvent::Topology(change))
    }

    async fn submit<F>(&self, command: F) -> CollectiveResult<()>
    where
        F: FnOnce(oneshot::Sender<CollectiveResult<()>>) -> Command,
    {
        let (reply, accepted) = oneshot::channel();
        self.post(RuntimeEvent::Command(command(reply)))?;
        accepted.await.map_err(|_| CollectiveError::ChannelClosed)?
    }

    /// Broadcast to every daemon; resolves once the broadcast is submitted
    pub async fn xcast(&self, tag: Tag, payload: Vec<u8>) -> CollectiveResult<()> {
        self.submit(|reply| Command::Xcast {
            tag,
            payload,
            reply,
        })
        .await
    }

    /// Submit a fence contribution
    pub async fn fence(
        &self,
        signature: FenceSignature,
        options: FenceOptions,
        data: Vec<u8>,
    ) -> CollectiveResult<Pending<Vec<u8>>> {
        let (completion, released) = oneshot::channel();
        self.submit(|reply| Command::Fence {
            signature,
            options,
            data,
            completion,
            reply,
        })
        .await?;
        Ok(Pending::new(released))
    }

    /// Submit a group construct or destruct
    pub async fn group(&self, request: GroupRequest) -> CollectiveResult<Pending<GroupOutcome>> {
        let (completion, released) = oneshot::channel();
        self.submit(|reply| Command::Group {
            request,
            completion,
            reply,
        })
        .await?;
        Ok(Pending::new(released))
    }

    /// Ask the runtime to stop after the events already queued
    pub fn shutdown(&self) {
        if self.post(RuntimeEvent::Command(Command::Shutdown)).is_err() {
            tracing::debug!("collective runtime already stopped");
        }
    }
}

/// Owner of one daemon's engine and effects
pub struct CollectiveRuntime<E> {
    engine: CollectiveEngine,
    effects: E,
    events: mpsc::UnboundedReceiver<RuntimeEvent>,
}

impl<E: CollectiveEffects> CollectiveRuntime<E> {
    pub fn new(
        engine: CollectiveEngine,
        effects: E,
        events: mpsc::UnboundedReceiver<RuntimeEvent>,
    ) -> Self {
        Self {
            engine,
            effects,
            events,
        }
    }

    pub fn engine(&self) -> &CollectiveEngine {
        &self.engine
    }

    pub fn effects(&self) -> &E {
        &self.effects
    }

    /// Process events until shutdown or until every handle is gone, then
    /// hand back the engine
    pub async fn run(mut self) -> CollectiveEngine {
        while let Some(event) = self.events.recv().await {
            if !self.step(event) {
                break;
            }
        }
        tracing::debug!(daemon = %self.effects.local_daemon(), "collective runtime stopped");
        self.engine
    }

    /// Apply one event; false once shutdown was requested
    pub fn step(&mut self, event: RuntimeEvent) -> bool {
        match event {
            RuntimeEvent::Inbound { from, tag, payload } => {
                self.engine.handle_message(&self.effects, from, tag, &payload);
            }
            RuntimeEvent::Topology(change) => {
                self.engine.on_topology_change(&self.effects, &change);
            }
            RuntimeEvent::Command(Command::Xcast {
                tag,
                payload,
                reply,
            }) => {
                answer(reply, self.engine.xcast(&self.effects, tag, payload), "xcast");
            }
            RuntimeEvent::Command(Command::Fence {
                signature,
                options,
                data,
                completion,
                reply,
            }) => {
                let submitted = self
                    .engine
                    .fence(&self.effects, signature, options, data, completion);
                answer(reply, submitted, "fence");
            }
            RuntimeEvent::Command(Command::Group {
                request,
                completion,
                reply,
            }) => {
                answer(reply, self.engine.group(&self.effects, request, completion), "group");
            }
            RuntimeEvent::Command(Command::Shutdown) => return false,
        }
        true
    }
}

/// Report a submission result to a caller that may have stopped listening
fn answer(reply: oneshot::Sender<CollectiveResult<()>>, result: CollectiveResult<()>, op: &str) {
    if let Err(unheard) = reply.send(result) {
        tracing::debug!(op, result = ?unheard, "collective caller went away before its submission was answered");
    }
}
