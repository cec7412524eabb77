//! Member registry owned by a single actor thread.
//!
//! Every registration, lookup and disconnect goes through the actor's
//! command queue, so identity assignment is race-free without locks.
//! A disconnected member keeps its id reserved until it reconnects
//! (reclaiming the id) or the periodic sweep drops it as stale.

use crate::cluster::fanout::Chunk;
use crate::config::types::{NodeId, Result, XprocError};
use crate::wire::types::{Res, StartArg};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// One dispatch handed to a member's session thread.
pub struct SessionJob {
    pub arg: Arc<StartArg>,
    pub data: Receiver<Chunk>,
    pub reply: Sender<Res>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected(Instant),
}

struct SlaveInfo {
    addr: String,
    session: Sender<SessionJob>,
    generation: u64,
    state: LinkState,
}

/// Read-only view of one registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveSummary {
    pub id: NodeId,
    pub addr: String,
    pub connected: bool,
}

/// Registry state; the actor thread is its only owner.
pub struct RegistryState {
    slaves: BTreeMap<NodeId, SlaveInfo>,
    next_id: NodeId,
    generation: u64,
    stale_after: Duration,
}

impl RegistryState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slaves: BTreeMap::new(),
            next_id: 1,
            generation: 0,
            stale_after,
        }
    }

    /// Returns the assigned id and the generation of this registration.
    ///
    /// Id 0 belongs to the root and is never handed out. Fresh ids count up
    /// from the highest id seen and wrap back to 1 past `NodeId::MAX`.
    pub fn register(
        &mut self,
        presented: Option<NodeId>,
        addr: String,
        session: Sender<SessionJob>,
    ) -> Result<(NodeId, u64)> {
        let id = match presented {
            Some(0) => {
                return Err(XprocError::Parse(
                    "node id 0 is reserved for the root".to_string(),
                ))
            }
            Some(id) => {
                if self.slaves.contains_key(&id) {
                    debug!("node {} reclaims its identity", id);
                }
                id
            }
            None => self.free_id()?,
        };
        if id >= self.next_id {
            self.next_id = id.checked_add(1).unwrap_or(1);
        }
        self.generation += 1;
        let generation = self.generation;
        self.slaves.insert(
            id,
            SlaveInfo {
                addr,
                session,
                generation,
                state: LinkState::Connected,
            },
        );
        Ok((id, generation))
    }

    fn free_id(&mut self) -> Result<NodeId> {
        let mut candidate = self.next_id.max(1);
        // Each id in 1..=MAX is tried at most once.
        for _ in 0..NodeId::MAX {
            if !self.slaves.contains_key(&candidate) {
                self.next_id = candidate;
                return Ok(candidate);
            }
            candidate = candidate.checked_add(1).unwrap_or(1);
        }
        Err(XprocError::Transport("no free node ids left".to_string()))
    }

    pub fn lookup(&self, id: NodeId) -> Option<Sender<SessionJob>> {
        self.slaves
            .get(&id)
            .filter(|s| s.state == LinkState::Connected)
            .map(|s| s.session.clone())
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.slaves
            .iter()
            .filter(|(_, s)| s.state == LinkState::Connected)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mark `id` disconnected unless a newer registration replaced it.
    pub fn mark_lost(&mut self, id: NodeId, generation: u64, now: Instant) -> bool {
        match self.slaves.get_mut(&id) {
            Some(slave) if slave.generation == generation => {
                slave.state = LinkState::Disconnected(now);
                true
            }
            _ => false,
        }
    }

    /// Drop records that have been disconnected for longer than the stale limit.
    pub fn sweep(&mut self, now: Instant) -> Vec<NodeId> {
        let stale_after = self.stale_after;
        let stale: Vec<NodeId> = self
            .slaves
            .iter()
            .filter(|(_, s)| match s.state {
                LinkState::Disconnected(since) => now.saturating_duration_since(since) >= stale_after,
                LinkState::Connected => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.slaves.remove(id);
        }
        stale
    }

    pub fn snapshot(&self) -> Vec<SlaveSummary> {
        self.slaves
            .iter()
            .map(|(id, s)| SlaveSummary {
                id: *id,
                addr: s.addr.clone(),
                connected: s.state == LinkState::Connected,
            })
            .collect()
    }
}

enum Command {
    Register {
        presented: Option<NodeId>,
        addr: String,
        session: Sender<SessionJob>,
        reply: Sender<Result<(NodeId, u64)>>,
    },
    Lookup {
        id: NodeId,
        reply: Sender<Option<Sender<SessionJob>>>,
    },
    Connected {
        reply: Sender<Vec<NodeId>>,
    },
    Lost {
        id: NodeId,
        generation: u64,
    },
    Snapshot {
        reply: Sender<Vec<SlaveSummary>>,
    },
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct Registry {
    tx: Sender<Command>,
}

fn actor_gone() -> XprocError {
    XprocError::Process("registry actor has stopped".to_string())
}

impl Registry {
    /// Start the actor. It runs until every handle is dropped.
    pub fn spawn(stale_after: Duration) -> Self {
        let (tx, rx) = unbounded::<Command>();
        let sweep_every = (stale_after / 4).clamp(Duration::from_millis(50), Duration::from_secs(30));
        thread::spawn(move || {
            let mut state = RegistryState::new(stale_after);
            let ticker = tick(sweep_every);
            loop {
                select! {
                    recv(rx) -> cmd => match cmd {
                        Ok(cmd) => Self::handle(&mut state, cmd),
                        Err(_) => break,
                    },
                    recv(ticker) -> _ => {
                        for id in state.sweep(Instant::now()) {
                            info!("node {} was gone too long; identity released", id);
                        }
                    }
                }
            }
            debug!("registry actor stopped");
        });
        Self { tx }
    }

    fn handle(state: &mut RegistryState, cmd: Command) {
        match cmd {
            Command::Register {
                presented,
                addr,
                session,
                reply,
            } => {
                let _ = reply.send(state.register(presented, addr, session));
            }
            Command::Lookup { id, reply } => {
                let _ = reply.send(state.lookup(id));
            }
            Command::Connected { reply } => {
                let _ = reply.send(state.connected());
            }
            Command::Lost { id, generation } => {
                if state.mark_lost(id, generation, Instant::now()) {
                    info!("node {} disconnected", id);
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
        }
    }

    fn ask<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, answer) = bounded(1);
        self.tx.send(build(reply)).map_err(|_| actor_gone())?;
        answer.recv().map_err(|_| actor_gone())
    }

    pub fn register(
        &self,
        presented: Option<NodeId>,
        addr: String,
        session: Sender<SessionJob>,
    ) -> Result<(NodeId, u64)> {
        self.ask(|reply| Command::Register {
            presented,
            addr,
            session,
            reply,
        })?
    }

    pub fn lookup(&self, id: NodeId) -> Option<Sender<SessionJob>> {
        self.ask(|reply| Command::Lookup { id, reply }).ok().flatten()
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.ask(|reply| Command::Connected { reply })
            .unwrap_or_default()
    }

    pub fn mark_lost(&self, id: NodeId, generation: u64) {
        let _ = self.tx.send(Command::Lost { id, generation });
    }

    pub fn snapshot(&self) -> Vec<SlaveSummary> {
        self.ask(|reply| Command::Snapshot { reply })
            .unwrap_or_default()
    }
}
