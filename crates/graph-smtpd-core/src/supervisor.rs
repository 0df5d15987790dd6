//! Run group for the relay's long-lived actors
//!
//! Every actor is a future paired with an interrupt. When the first actor
//! returns, every other actor is interrupted and the group waits for all of
//! them before returning.

use anyhow::anyhow;
use std::future::Future;
use std::pin::Pin;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

type Actor = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Interrupt = Box<dyn FnOnce(Option<&anyhow::Error>) + Send>;

struct Member {
    name: String,
    actor: Actor,
    interrupt: Interrupt,
}

/// A set of actors that stop together
#[derive(Default)]
pub struct RunGroup {
    members: Vec<Member>,
}

impl RunGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor. `interrupt` is called at most once, with the error
    /// of the actor that stopped first (if it failed).
    pub fn add<F, I>(&mut self, name: impl Into<String>, actor: F, interrupt: I)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        I: FnOnce(Option<&anyhow::Error>) + Send + 'static,
    {
        self.members.push(Member {
            name: name.into(),
            actor: Box::pin(actor),
            interrupt: Box::new(interrupt),
        });
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Run all actors and return the first error observed.
    ///
    /// A panicking actor counts as failed.
    pub async fn run(self) -> anyhow::Result<()> {
        if self.members.is_empty() {
            return Ok(());
        }

        let mut names = Vec::with_capacity(self.members.len());
        let mut interrupts = Vec::with_capacity(self.members.len());
        let mut tasks = JoinSet::new();

        for (index, member) in self.members.into_iter().enumerate() {
            debug!("Starting {}", member.name);
            names.push(member.name);
            interrupts.push(Some(member.interrupt));

            let handle = tokio::spawn(member.actor);
            tasks.spawn(async move { (index, handle.await) });
        }

        let mut first_error = None;

        let (first, result) = match tasks.join_next().await {
            Some(joined) => settle(joined),
            None => return Ok(()),
        };

        if let Some(index) = first {
            match &result {
                Ok(()) => info!("{} stopped", names[index]),
                Err(e) => error!("{} failed: {:#}", names[index], e),
            }
        }

        let cause = result.as_ref().err();
        for (index, interrupt) in interrupts.iter_mut().enumerate() {
            if Some(index) == first {
                continue;
            }
            if let Some(interrupt) = interrupt.take() {
                debug!("Interrupting {}", names[index]);
                interrupt(cause);
            }
        }

        if let Err(e) = result {
            first_error = Some(e);
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = settle(joined);
            let name = index.map(|i| names[i].as_str()).unwrap_or("actor");
            match result {
                Ok(()) => debug!("{} stopped", name),
                Err(e) => {
                    error!("{} failed: {:#}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

type Joined = Result<(usize, Result<anyhow::Result<()>, JoinError>), JoinError>;

fn settle(joined: Joined) -> (Option<usize>, anyhow::Result<()>) {
    match joined {
        Ok((index, Ok(result))) => (Some(index), result),
        Ok((index, Err(e))) => (Some(index), Err(anyhow!("actor panicked: {}", e))),
        Err(e) => (None, Err(anyhow!("actor task failed: {}", e))),
    }
}
