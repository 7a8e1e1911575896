//! The database-backed command queue: appliance-keyed rows with state
//! columns and lifecycle timestamps, satisfying the same [`CmdQueue`]
//! contract (and tests) as the in-memory back-end.

use async_trait::async_trait;
use libsql::{params, Connection, Database, Row};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::cmdqueue::{CancelOutcome, CmdQueue, CmdQueueError, CmdState, Command};

impl From<libsql::Error> for CmdQueueError {
    fn from(err: libsql::Error) -> CmdQueueError {
        CmdQueueError::Db(err.to_string())
    }
}

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS commands (
    uuid          TEXT NOT NULL,
    id            INTEGER NOT NULL,
    state         TEXT NOT NULL,
    fetchable     INTEGER NOT NULL DEFAULT 1,
    enqueued_time TEXT NOT NULL,
    sent_time     TEXT,
    done_time     TEXT,
    query_json    TEXT NOT NULL,
    response_json TEXT,
    PRIMARY KEY (uuid, id)
)";

/// One appliance's queue rows inside a shared libsql database.
pub struct DbQueue {
    conn: Connection,
    uuid: Uuid,
    /// Serializes id allocation and state transitions.
    write_lock: Mutex<()>,
    notify: Notify,
    retention: usize,
}

impl DbQueue {
    pub async fn open(
        db: &Database,
        uuid: Uuid,
        retention: usize,
    ) -> Result<DbQueue, CmdQueueError> {
        let conn = db.connect()?;
        conn.execute(SCHEMA_SQL, ()).await?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS commands_state ON commands (uuid, state, id)",
            (),
        )
        .await?;

        Ok(DbQueue {
            conn,
            uuid,
            write_lock: Mutex::new(()),
            notify: Notify::new(),
            retention,
        })
    }

    fn now() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .expect("current time formats as RFC 3339")
    }

    fn parse_time(raw: Option<String>) -> Option<OffsetDateTime> {
        raw.and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok())
    }

    fn decode_row(row: &Row) -> Result<Command, CmdQueueError> {
        let id: i64 = row.get(0)?;
        let state: String = row.get(1)?;
        let enqueued: String = row.get(2)?;
        let sent: Option<String> = row.get(3)?;
        let done: Option<String> = row.get(4)?;
        let query_json: String = row.get(5)?;
        let response_json: Option<String> = row.get(6)?;

        let state = CmdState::parse(&state)
            .ok_or_else(|| CmdQueueError::Internal(format!("bad command state '{state}'")))?;
        let query: Value = serde_json::from_str(&query_json)
            .map_err(|e| CmdQueueError::Internal(format!("bad query json: {e}")))?;
        let response = match response_json {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| CmdQueueError::Internal(format!("bad response json: {e}")))?,
            ),
            None => None,
        };

        Ok(Command {
            id,
            state,
            enqueued: Self::parse_time(Some(enqueued)).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            sent: Self::parse_time(sent),
            done: Self::parse_time(done),
            query,
            response,
        })
    }

    async fn get_row(&self, id: i64) -> Result<Option<Command>, CmdQueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, state, enqueued_time, sent_time, done_time, query_json, response_json
                 FROM commands WHERE uuid = ?1 AND id = ?2",
                params![self.uuid.to_string(), id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::decode_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_ready(&self, since: i64, max: u32) -> Result<Vec<Command>, CmdQueueError> {
        let _guard = self.write_lock.lock().await;

        let mut rows = self
            .conn
            .query(
                "SELECT id, state, enqueued_time, sent_time, done_time, query_json, response_json
                 FROM commands
                 WHERE uuid = ?1 AND id > ?2 AND fetchable = 1 AND state IN ('ENQD', 'WORK')
                 ORDER BY id LIMIT ?3",
                params![self.uuid.to_string(), since, max as i64],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(Self::decode_row(&row)?);
        }
        drop(rows);

        let now = Self::now();
        for command in &mut out {
            self.conn
                .execute(
                    "UPDATE commands
                     SET state = 'WORK', sent_time = COALESCE(sent_time, ?3)
                     WHERE uuid = ?1 AND id = ?2",
                    params![self.uuid.to_string(), command.id, now.clone()],
                )
                .await?;
            command.state = CmdState::Work;
            command.sent.get_or_insert(
                Self::parse_time(Some(now.clone())).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            );
        }

        Ok(out)
    }
}

#[async_trait]
impl CmdQueue for DbQueue {
    async fn submit(&self, query: Value) -> Result<i64, CmdQueueError> {
        let query_json = serde_json::to_string(&query)
            .map_err(|e| CmdQueueError::Internal(format!("query marshal failed: {e}")))?;

        let id = {
            let _guard = self.write_lock.lock().await;

            let mut rows = self
                .conn
                .query(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM commands WHERE uuid = ?1",
                    params![self.uuid.to_string()],
                )
                .await?;
            let id: i64 = match rows.next().await? {
                Some(row) => row.get(0)?,
                None => 1,
            };
            drop(rows);

            self.conn
                .execute(
                    "INSERT INTO commands
                       (uuid, id, state, fetchable, enqueued_time, query_json)
                     VALUES (?1, ?2, 'ENQD', 1, ?3, ?4)",
                    params![self.uuid.to_string(), id, Self::now(), query_json],
                )
                .await?;
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
            let notified = self.notify.notified();

            let ready = self.fetch_ready(since, max).await?;
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
        let _guard = self.write_lock.lock().await;

        let Some(mut command) = self.get_row(id).await? else {
            log::warn!("completion for unknown command {id}");
            return Ok(None);
        };
        if matches!(command.state, CmdState::Done | CmdState::Cncl) {
            log::warn!("duplicate completion for command {id}");
            return Ok(None);
        }

        let response_json = serde_json::to_string(&response)
            .map_err(|e| CmdQueueError::Internal(format!("response marshal failed: {e}")))?;
        let done = Self::now();
        self.conn
            .execute(
                "UPDATE commands
                 SET state = 'DONE', done_time = ?3, response_json = ?4
                 WHERE uuid = ?1 AND id = ?2",
                params![self.uuid.to_string(), id, done.clone(), response_json],
            )
            .await?;

        command.state = CmdState::Done;
        command.done = Self::parse_time(Some(done));
        command.response = Some(response);
        Ok(Some(command))
    }

    async fn cancel(&self, id: i64) -> Result<CancelOutcome, CmdQueueError> {
        let _guard = self.write_lock.lock().await;

        let Some(command) = self.get_row(id).await? else {
            return Ok(CancelOutcome::Unknown);
        };

        match command.state {
            CmdState::Enqd => {
                self.conn
                    .execute(
                        "UPDATE commands SET state = 'CNCL', done_time = ?3
                         WHERE uuid = ?1 AND id = ?2",
                        params![self.uuid.to_string(), id, Self::now()],
                    )
                    .await?;
                Ok(CancelOutcome::Canceled)
            }
            CmdState::Work => {
                self.conn
                    .execute(
                        "UPDATE commands SET fetchable = 0 WHERE uuid = ?1 AND id = ?2",
                        params![self.uuid.to_string(), id],
                    )
                    .await?;
                Ok(CancelOutcome::InProgress)
            }
            CmdState::Done => Ok(CancelOutcome::AlreadyDone),
            CmdState::Cncl => Ok(CancelOutcome::Canceled),
        }
    }

    async fn status(&self, id: i64) -> Result<Option<Command>, CmdQueueError> {
        self.get_row(id).await
    }

    async fn gc(&self) -> Result<usize, CmdQueueError> {
        let _guard = self.write_lock.lock().await;

        let collected = self
            .conn
            .execute(
                "DELETE FROM commands
                 WHERE uuid = ?1 AND state IN ('DONE', 'CNCL') AND id NOT IN (
                     SELECT id FROM commands
                     WHERE uuid = ?1 AND state IN ('DONE', 'CNCL')
                     ORDER BY id DESC LIMIT ?2
                 )",
                params![self.uuid.to_string(), self.retention as i64],
            )
            .await?;
        Ok(collected as usize)
    }
}
