//! The per-site command queue: the durable channel carrying operator
//! writes down to an appliance. Two interchangeable back-ends implement
//! [`CmdQueue`]; this module holds the trait and the in-memory one.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdState {
    #[serde(rename = "ENQD")]
    Enqd,
    #[serde(rename = "WORK")]
    Work,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CNCL")]
    Cncl,
}

impl CmdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmdState::Enqd => "ENQD",
            CmdState::Work => "WORK",
            CmdState::Done => "DONE",
            CmdState::Cncl => "CNCL",
        }
    }

    pub fn parse(source: &str) -> Option<CmdState> {
        match source {
            "ENQD" => Some(CmdState::Enqd),
            "WORK" => Some(CmdState::Work),
            "DONE" => Some(CmdState::Done),
            "CNCL" => Some(CmdState::Cncl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub state: CmdState,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub done: Option<OffsetDateTime>,
    pub query: Value,
    #[serde(default)]
    pub response: Option<Value>,
}

#[derive(Debug, Error)]
pub enum CmdQueueError {
    #[error("command queue database error: {0}")]
    Db(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// ENQD → CNCL (or the command was already cancelled).
    Canceled,
    /// Already fetched; left in WORK but hidden from future fetches.
    InProgress,
    /// Completed before the cancel arrived.
    AlreadyDone,
    /// No such command.
    Unknown,
}

/// One site's command queue. Fetch order is strictly increasing by id;
/// completions may arrive out of order and are matched by id. A blocked
/// fetch is cancelled by dropping its future; queue state is unchanged.
#[async_trait]
pub trait CmdQueue: Send + Sync {
    /// Enqueues a query, returning its (per-site monotone) id.
    async fn submit(&self, query: Value) -> Result<i64, CmdQueueError>;

    /// Returns up to `max` commands with id > `since` in id order, marking
    /// them WORK. With `block`, waits for the queue to gain entries.
    async fn fetch(&self, since: i64, max: u32, block: bool)
        -> Result<Vec<Command>, CmdQueueError>;

    /// Posts a response. Returns the completed command (including its
    /// original query) the first time; duplicates and unknown ids are
    /// logged and return `None`.
    async fn complete(&self, id: i64, response: Value)
        -> Result<Option<Command>, CmdQueueError>;

    async fn cancel(&self, id: i64) -> Result<CancelOutcome, CmdQueueError>;

    /// Current state, `None` for unknown ids.
    async fn status(&self, id: i64) -> Result<Option<Command>, CmdQueueError>;

    /// Trims completed commands past the retention cap; returns how many
    /// were collected.
    async fn gc(&self) -> Result<usize, CmdQueueError>;
}

/// Completed-command retention before the garbage collector trims.
pub const DEFAULT_RETENTION: usize = 128;

struct MemInner {
    pending: VecDeque<Command>,
    completed: VecDeque<Command>,
    hidden: HashSet<i64>,
    next_id: i64,
}

/// The in-memory back-end: a pending deque plus a bounded completion ring.
pub struct MemQueue {
    inner: Mutex<MemInner>,
    notify: Notify,
    retention: usize,
}

impl MemQueue {
    pub fn new(retention: usize) -> MemQueue {
        MemQueue {
            inner: Mutex::new(MemInner {
                pending: VecDeque::new(),
                completed: VecDeque::new(),
                hidden: HashSet::new(),
                next_id: 0,
            }),
            notify: Notify::new(),
            retention,
        }
    }

    fn fetch_ready(&self, since: i64, max: u32) -> Vec<Command> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().unwrap();
        let hidden = inner.hidden.clone();
        let mut out = Vec::new();
        for command in inner.pending.iter_mut() {
            if out.len() >= max as usize {
                break;
            }
            if command.id <= since || hidden.contains(&command.id) {
                continue;
            }
            command.state = CmdState::Work;
            command.sent.get_or_insert(now);
            out.push(command.clone());
        }
        out
    }
}

impl Default for MemQueue {
    fn default() -> Self {
        MemQueue::new(DEFAULT_RETENTION)
    }
}

#[async_trait]
impl CmdQueue for MemQueue {
    async fn submit(&self, query: Value) -> Result<i64, CmdQueueError> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.pending.push_back(Command {
                id,
                state: CmdState::Enqd,
                enqueued: OffsetDateTime::now_utc(),
                sent: None,
                done: None,
                query,
                response: None,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn fetch(
        &self,
        since: i64,
        max: u32,
        block: bool,
    ) -> Result<Vec<Command>, CmdQueueError> {
        loop {
            // Register for wake-ups before checking so a concurrent submit
            // cannot slip between the check and the await.
            let notified = self.notify.notified();

            let ready = self.fetch_ready(since, max);
            if !ready.is_empty() || !block {
                return Ok(ready);
            }

            notified.await;
        }
    }

    async fn complete(
        &self,
        id: i64,
        response: Value,
    ) -> Result<Option<Command>, CmdQueueError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner.pending.iter().position(|c| c.id == id) {
            let mut command = inner.pending.remove(pos).expect("position is valid");
            command.state = CmdState::Done;
            command.done = Some(OffsetDateTime::now_utc());
            command.response = Some(response);
            inner.hidden.remove(&id);
            inner.completed.push_back(command.clone());
            return Ok(Some(command));
        }

        if inner.completed.iter().any(|c| c.id == id) {
            log::warn!("duplicate completion for command {id}");
        } else {
            log::warn!("completion for unknown command {id}");
        }
        Ok(None)
    }

    async fn cancel(&self, id: i64) -> Result<CancelOutcome, CmdQueueError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner.pending.iter().position(|c| c.id == id) {
            return Ok(match inner.pending[pos].state {
                CmdState::Enqd => {
                    let mut command = inner.pending.remove(pos).expect("position is valid");
                    command.state = CmdState::Cncl;
                    command.done = Some(OffsetDateTime::now_utc());
                    inner.completed.push_back(command);
                    CancelOutcome::Canceled
                }
                // Already on its way to the appliance; just stop
                // re-offering it.
                _ => {
                    inner.hidden.insert(id);
                    CancelOutcome::InProgress
                }
            });
        }

        match inner.completed.iter().find(|c| c.id == id) {
            Some(c) if c.state == CmdState::Cncl => Ok(CancelOutcome::Canceled),
            Some(_) => Ok(CancelOutcome::AlreadyDone),
            None => Ok(CancelOutcome::Unknown),
        }
    }

    async fn status(&self, id: i64) -> Result<Option<Command>, CmdQueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pending
            .iter()
            .chain(inner.completed.iter())
            .find(|c| c.id == id)
            .cloned())
    }

    async fn gc(&self) -> Result<usize, CmdQueueError> {
        let mut inner = self.inner.lock().unwrap();
        let mut collected = 0;
        while inner.completed.len() > self.retention {
            inner.completed.pop_front();
            collected += 1;
        }
        Ok(collected)
    }
}
