//! SQLite work ledger.
//!
//! Single source of truth for unit state, outputs, dependency edges, tag and
//! unique-name indices, and the event log, kept in WAL mode.
//! All writes go through the engine inside a [`TxContext`].

use chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::KeyValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::constraint::Constraints;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::telemetry::metrics;

const UNIT_COLUMNS: &str = "
    u.id, u.instance_id, i.unique_name, u.kind, u.position, u.state,
    u.input, u.effective_input, u.output, u.constraints,
    u.backoff_policy, u.backoff_delay_ms, u.max_attempts, u.attempts,
    u.run_at, u.failure, u.created_at, u.updated_at, u.finished_at
";

/// The work ledger. Owns the SQLite connection the scheduler writes through.
pub struct Storage {
    conn: Connection,
}

/// Ledger operations bound to one open transaction.
///
/// Every unit whose state or output changes is remembered in `touched` so
/// the engine can publish the change after commit.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
    touched: Vec<WorkId>,
}

impl TxContext<'_> {
    pub fn insert_instance(&self, id: InstanceId, unique_name: Option<&str>) -> Result<()> {
        self.tx.execute(
            "INSERT INTO instances (id, unique_name, created_at) VALUES (?1, ?2, ?3)",
            params![id.0.to_string(), unique_name, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Point `name` at `instance`, replacing any previous binding.
    pub fn bind_unique_name(&self, name: &str, instance: InstanceId) -> Result<()> {
        self.tx.execute(
            "INSERT INTO unique_names (name, instance_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET instance_id = excluded.instance_id,
                                             updated_at = excluded.updated_at",
            params![name, instance.0.to_string(), timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn instance_for_name(&self, name: &str) -> Result<Option<InstanceId>> {
        instance_for_name_on(self.tx, name)
    }

    pub fn insert_unit(&mut self, unit: &WorkUnit, upstream: &[WorkId]) -> Result<()> {
        insert_unit_on(self.tx, unit, upstream)?;
        self.touched.push(unit.id);
        Ok(())
    }

    pub fn get_unit(&self, id: WorkId) -> Result<WorkUnit> {
        get_unit_on(self.tx, id)
    }

    pub fn find_unit(&self, id: WorkId) -> Result<Option<WorkUnit>> {
        find_unit_on(self.tx, id)
    }

    pub fn units_in_instance(&self, instance: InstanceId) -> Result<Vec<WorkUnit>> {
        units_in_instance_on(self.tx, instance)
    }

    pub fn units_by_tag(&self, tag: &str) -> Result<Vec<WorkUnit>> {
        units_by_tag_on(self.tx, tag)
    }

    pub fn units_in_states(&self, states: &[State]) -> Result<Vec<WorkUnit>> {
        units_in_states_on(self.tx, states)
    }

    /// Units of `instance` that nothing else in the instance depends on.
    pub fn leaves(&self, instance: InstanceId) -> Result<Vec<WorkUnit>> {
        let units = units_in_instance_on(self.tx, instance)?;
        let mut leaves = Vec::new();
        for unit in units {
            if downstream_on(self.tx, unit.id)?.is_empty() {
                leaves.push(unit);
            }
        }
        Ok(leaves)
    }

    pub fn upstream(&self, id: WorkId) -> Result<Vec<WorkId>> {
        upstream_on(self.tx, id)
    }

    pub fn downstream(&self, id: WorkId) -> Result<Vec<WorkId>> {
        downstream_on(self.tx, id)
    }

    pub fn update_state(&mut self, id: WorkId, new_state: State) -> Result<State> {
        let old = update_state_on(self.tx, id, new_state)?;
        self.touched.push(id);
        Ok(old)
    }

    /// Enter Running: bump the attempt count and store the input handed to
    /// the executable. Returns the new attempt count.
    pub fn start_attempt(&mut self, id: WorkId, effective_input: &Data) -> Result<u32> {
        update_state_on(self.tx, id, State::Running)?;
        self.tx.execute(
            "UPDATE work_units SET attempts = attempts + 1, effective_input = ?1, updated_at = ?2
             WHERE id = ?3",
            params![
                serde_json::to_string(effective_input)?,
                timestamp(Utc::now()),
                id.0.to_string()
            ],
        )?;
        self.touched.push(id);

        let attempts: u32 = self.tx.query_row(
            "SELECT attempts FROM work_units WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Record a unit's output. Output is written at most once.
    pub fn set_output(&mut self, id: WorkId, output: &Data) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE work_units SET output = ?1, updated_at = ?2 WHERE id = ?3 AND output IS NULL",
            params![
                serde_json::to_string(output)?,
                timestamp(Utc::now()),
                id.0.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(Error::Other(format!("output of {id} already recorded")));
        }
        self.touched.push(id);
        Ok(())
    }

    pub fn set_failure(&self, id: WorkId, reason: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE work_units SET failure = ?1 WHERE id = ?2",
            params![reason, id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn set_run_at(&self, id: WorkId, at: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE work_units SET run_at = ?1 WHERE id = ?2",
            params![timestamp(at), id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn record_event(&mut self, kind: EventKind) -> Result<Event> {
        record_event_on(self.tx, kind)
    }
}

impl Storage {
    /// Open or create a ledger at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // Readers in other processes (the CLI) must not block the pool.
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.busy_timeout(Duration::from_secs(5))?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS instances (
                id              TEXT PRIMARY KEY,
                unique_name     TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS unique_names (
                name            TEXT PRIMARY KEY,
                instance_id     TEXT NOT NULL REFERENCES instances(id),
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS work_units (
                id                  TEXT PRIMARY KEY,
                instance_id         TEXT NOT NULL REFERENCES instances(id),
                kind                TEXT NOT NULL,
                position            INTEGER NOT NULL DEFAULT 0,
                state               TEXT NOT NULL,
                input               TEXT NOT NULL DEFAULT '{}',
                effective_input     TEXT,
                output              TEXT,
                constraints         TEXT NOT NULL DEFAULT '{}',
                backoff_policy      TEXT NOT NULL,
                backoff_delay_ms    INTEGER NOT NULL,
                max_attempts        INTEGER,
                attempts            INTEGER NOT NULL DEFAULT 0,
                run_at              TEXT NOT NULL,
                failure             TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                finished_at         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_units_instance ON work_units(instance_id);
            CREATE INDEX IF NOT EXISTS idx_units_active ON work_units(state)
                WHERE state NOT IN ('succeeded', 'failed', 'cancelled');

            CREATE TABLE IF NOT EXISTS work_tags (
                work_id     TEXT NOT NULL REFERENCES work_units(id),
                tag         TEXT NOT NULL,
                PRIMARY KEY (work_id, tag)
            );

            CREATE INDEX IF NOT EXISTS idx_tags_tag ON work_tags(tag);

            CREATE TABLE IF NOT EXISTS dependencies (
                work_id     TEXT NOT NULL REFERENCES work_units(id),
                upstream_id TEXT NOT NULL REFERENCES work_units(id),
                ordinal     INTEGER NOT NULL,
                PRIMARY KEY (work_id, upstream_id)
            );

            CREATE INDEX IF NOT EXISTS idx_deps_upstream ON dependencies(upstream_id);

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` inside an immediate SQLite transaction. `Ok` commits and
    /// returns the value with the ids of every unit touched; `Err` rolls back.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<(T, Vec<WorkId>)>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut ctx = TxContext {
            tx: &tx,
            touched: Vec::new(),
        };
        let result = f(&mut ctx)?;
        let mut touched = ctx.touched;
        tx.commit()?;

        let mut seen = BTreeSet::new();
        touched.retain(|id| seen.insert(*id));
        Ok((result, touched))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get a work unit by ID.
    pub fn get_unit(&self, id: WorkId) -> Result<WorkUnit> {
        get_unit_on(&self.conn, id)
    }

    pub fn find_unit(&self, id: WorkId) -> Result<Option<WorkUnit>> {
        find_unit_on(&self.conn, id)
    }

    /// Units of the instance currently bound to `name`.
    pub fn units_by_name(&self, name: &str) -> Result<Vec<WorkUnit>> {
        match instance_for_name_on(&self.conn, name)? {
            Some(instance) => units_in_instance_on(&self.conn, instance),
            None => Ok(Vec::new()),
        }
    }

    pub fn units_by_tag(&self, tag: &str) -> Result<Vec<WorkUnit>> {
        units_by_tag_on(&self.conn, tag)
    }

    pub fn units_in_states(&self, states: &[State]) -> Result<Vec<WorkUnit>> {
        units_in_states_on(&self.conn, states)
    }

    pub fn upstream(&self, id: WorkId) -> Result<Vec<WorkId>> {
        upstream_on(&self.conn, id)
    }

    /// Events with `seq` greater than `since_seq`, oldest first.
    pub fn get_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: parse_time(&row.get::<_, String>(1)?).unwrap_or_else(Utc::now),
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Queries shared by `Storage` reads and `TxContext` writes.
// ---------------------------------------------------------------------------

fn insert_unit_on(conn: &Connection, unit: &WorkUnit, upstream: &[WorkId]) -> Result<()> {
    let id = unit.id.0.to_string();
    conn.execute(
        "INSERT INTO work_units (
            id, instance_id, kind, position, state, input, constraints,
            backoff_policy, backoff_delay_ms, max_attempts, attempts, run_at,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            unit.instance_id.0.to_string(),
            unit.kind,
            unit.position,
            unit.state.to_string(),
            serde_json::to_string(&unit.input)?,
            serde_json::to_string(&unit.constraints)?,
            unit.backoff.policy.to_string(),
            unit.backoff.delay.as_millis() as i64,
            unit.max_attempts,
            unit.attempts,
            timestamp(unit.run_at),
            timestamp(unit.created_at),
            timestamp(unit.updated_at),
        ],
    )?;

    for tag in &unit.tags {
        conn.execute(
            "INSERT INTO work_tags (work_id, tag) VALUES (?1, ?2)",
            params![id, tag],
        )?;
    }

    for (ordinal, up) in upstream.iter().enumerate() {
        conn.execute(
            "INSERT INTO dependencies (work_id, upstream_id, ordinal) VALUES (?1, ?2, ?3)",
            params![id, up.0.to_string(), ordinal as i64],
        )?;
    }

    Ok(())
}

fn instance_for_name_on(conn: &Connection, name: &str) -> Result<Option<InstanceId>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT instance_id FROM unique_names WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;

    id.map(|s| {
        s.parse()
            .map(InstanceId)
            .map_err(|e: uuid::Error| Error::Corrupt(format!("instance id: {e}")))
    })
    .transpose()
}

fn get_state_on(conn: &Connection, id: WorkId) -> Result<State> {
    let state_str: String = conn
        .query_row(
            "SELECT state FROM work_units WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

    state_str.parse()
}

fn find_unit_on(conn: &Connection, id: WorkId) -> Result<Option<WorkUnit>> {
    let mut units = query_units(
        conn,
        "WHERE u.id = ?1",
        &[&id.0.to_string() as &dyn rusqlite::ToSql],
    )?;
    Ok(units.pop())
}

fn get_unit_on(conn: &Connection, id: WorkId) -> Result<WorkUnit> {
    find_unit_on(conn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))
}

fn units_in_instance_on(conn: &Connection, instance: InstanceId) -> Result<Vec<WorkUnit>> {
    query_units(
        conn,
        "WHERE u.instance_id = ?1",
        &[&instance.0.to_string() as &dyn rusqlite::ToSql],
    )
}

fn units_by_tag_on(conn: &Connection, tag: &str) -> Result<Vec<WorkUnit>> {
    query_units(
        conn,
        "WHERE u.id IN (SELECT work_id FROM work_tags WHERE tag = ?1)",
        &[&tag as &dyn rusqlite::ToSql],
    )
}

fn units_in_states_on(conn: &Connection, states: &[State]) -> Result<Vec<WorkUnit>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let filter = format!("WHERE u.state IN ({})", placeholders.join(", "));
    let args: Vec<&dyn rusqlite::ToSql> =
        names.iter().map(|n| n as &dyn rusqlite::ToSql).collect();
    query_units(conn, &filter, &args)
}

fn upstream_on(conn: &Connection, id: WorkId) -> Result<Vec<WorkId>> {
    id_column(
        conn,
        "SELECT upstream_id FROM dependencies WHERE work_id = ?1 ORDER BY ordinal ASC",
        id,
    )
}

fn downstream_on(conn: &Connection, id: WorkId) -> Result<Vec<WorkId>> {
    id_column(
        conn,
        "SELECT d.work_id FROM dependencies d JOIN work_units u ON u.id = d.work_id
         WHERE d.upstream_id = ?1 ORDER BY u.rowid ASC",
        id,
    )
}

fn id_column(conn: &Connection, sql: &str, id: WorkId) -> Result<Vec<WorkId>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params![id.0.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.iter()
        .map(|s| {
            s.parse()
                .map_err(|e: uuid::Error| Error::Corrupt(format!("work id {s}: {e}")))
        })
        .collect()
}

fn update_state_on(conn: &Connection, id: WorkId, new_state: State) -> Result<State> {
    let old_state = get_state_on(conn, id)?;

    if !old_state.can_transition_to(new_state) {
        return Err(Error::InvalidTransition {
            from: old_state,
            to: new_state,
        });
    }

    let now = timestamp(Utc::now());
    let finished_at = if new_state.is_terminal() {
        Some(now.clone())
    } else {
        None
    };

    conn.execute(
        "UPDATE work_units SET state = ?1, updated_at = ?2, finished_at = COALESCE(?3, finished_at)
         WHERE id = ?4",
        params![new_state.to_string(), now, finished_at, id.0.to_string()],
    )?;

    metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", old_state.to_string()),
            KeyValue::new("to", new_state.to_string()),
        ],
    );

    record_event_on(
        conn,
        EventKind::StateTransition {
            id,
            from: old_state,
            to: new_state,
        },
    )?;

    Ok(old_state)
}

fn record_event_on(conn: &Connection, kind: EventKind) -> Result<Event> {
    let now = Utc::now();

    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![timestamp(now), serde_json::to_string(&kind)?],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn query_units(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<WorkUnit>> {
    let sql = format!(
        "SELECT {UNIT_COLUMNS} FROM work_units u JOIN instances i ON i.id = u.instance_id
         {filter} ORDER BY u.rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(args, |row| Ok(row_to_unit(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut units = Vec::with_capacity(rows.len());
    for row in rows {
        let mut unit = row.map_err(|e| Error::Corrupt(format!("work unit row: {e}")))?;
        unit.tags = tags_on(conn, unit.id)?;
        units.push(unit);
    }
    Ok(units)
}

fn tags_on(conn: &Connection, id: WorkId) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM work_tags WHERE work_id = ?1")?;
    let tags = stmt
        .query_map(params![id.0.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(tags)
}

fn row_to_unit(row: &rusqlite::Row) -> std::result::Result<WorkUnit, String> {
    let get_str = |i: usize| row.get::<_, String>(i).map_err(|e| e.to_string());
    let get_opt = |i: usize| row.get::<_, Option<String>>(i).map_err(|e| e.to_string());

    let id_str = get_str(0)?;
    let instance_str = get_str(1)?;
    let effective_input = get_opt(7)?;
    let output = get_opt(8)?;
    let delay_ms: i64 = row.get(11).map_err(|e| e.to_string())?;
    let policy: BackoffPolicy = get_str(10)?.parse().map_err(|e: Error| e.to_string())?;

    Ok(WorkUnit {
        id: WorkId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        instance_id: InstanceId(instance_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        unique_name: get_opt(2)?,
        kind: get_str(3)?,
        position: row.get(4).map_err(|e| e.to_string())?,
        state: get_str(5)?.parse().map_err(|e: Error| e.to_string())?,
        tags: BTreeSet::new(),
        input: json::<Data>(&get_str(6)?)?,
        effective_input: effective_input.as_deref().map(json::<Data>).transpose()?,
        output: output.as_deref().map(json::<Data>).transpose()?,
        constraints: json::<Constraints>(&get_str(9)?)?,
        backoff: Backoff {
            policy,
            delay: Duration::from_millis(delay_ms.max(0) as u64),
        },
        max_attempts: row.get(12).map_err(|e| e.to_string())?,
        attempts: row.get(13).map_err(|e| e.to_string())?,
        run_at: parse_time(&get_str(14)?).ok_or("invalid run_at")?,
        failure: get_opt(15)?,
        created_at: parse_time(&get_str(16)?).ok_or("invalid created_at")?,
        updated_at: parse_time(&get_str(17)?).ok_or("invalid updated_at")?,
        finished_at: get_opt(18)?.as_deref().and_then(parse_time),
    })
}

fn json<T: serde::de::DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_json::from_str(s).map_err(|e| e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_in(instance: InstanceId, state: State) -> WorkUnit {
        let now = Utc::now();
        WorkUnit {
            id: WorkId::new(),
            instance_id: instance,
            unique_name: None,
            kind: "blur".to_string(),
            position: 0,
            state,
            tags: ["OUTPUT".to_string()].into_iter().collect(),
            input: Data::new().with("KEY_IMAGE_URI", "file:///in.png"),
            effective_input: None,
            output: None,
            constraints: Default::default(),
            backoff: Backoff::default(),
            max_attempts: Some(3),
            attempts: 0,
            run_at: now,
            failure: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn unit_round_trips_through_ledger() {
        let mut storage = Storage::in_memory().unwrap();
        let instance = InstanceId::new();
        let unit = unit_in(instance, State::Enqueued);
        let id = unit.id;

        let (_, touched) = storage
            .with_transaction(|tx| {
                tx.insert_instance(instance, Some("image_manipulation_work"))?;
                tx.bind_unique_name("image_manipulation_work", instance)?;
                tx.insert_unit(&unit, &[])
            })
            .unwrap();
        assert_eq!(touched, vec![id]);

        let loaded = storage.get_unit(id).unwrap();
        assert_eq!(loaded.kind, "blur");
        assert_eq!(loaded.state, State::Enqueued);
        assert_eq!(loaded.unique_name.as_deref(), Some("image_manipulation_work"));
        assert!(loaded.tags.contains("OUTPUT"));
        assert_eq!(loaded.input.get_str("KEY_IMAGE_URI"), Some("file:///in.png"));
        assert_eq!(loaded.max_attempts, Some(3));

        assert_eq!(storage.units_by_name("image_manipulation_work").unwrap().len(), 1);
        assert_eq!(storage.units_by_tag("OUTPUT").unwrap().len(), 1);
        assert!(storage.units_by_tag("missing").unwrap().is_empty());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut storage = Storage::in_memory().unwrap();
        let instance = InstanceId::new();
        let unit = unit_in(instance, State::Enqueued);
        let id = unit.id;

        let result = storage.with_transaction(|tx| {
            tx.insert_instance(instance, None)?;
            tx.insert_unit(&unit, &[])?;
            // Enqueued -> Succeeded is not a legal transition
            tx.update_state(id, State::Succeeded)
        });
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert!(storage.find_unit(id).unwrap().is_none());
    }

    #[test]
    fn output_is_written_once() {
        let mut storage = Storage::in_memory().unwrap();
        let instance = InstanceId::new();
        let unit = unit_in(instance, State::Enqueued);
        let id = unit.id;

        storage
            .with_transaction(|tx| {
                tx.insert_instance(instance, None)?;
                tx.insert_unit(&unit, &[])?;
                tx.set_output(id, &Data::new().with("uri", "X"))
            })
            .unwrap();

        let second = storage.with_transaction(|tx| tx.set_output(id, &Data::new().with("uri", "Y")));
        assert!(second.is_err());
        let loaded = storage.get_unit(id).unwrap();
        assert_eq!(loaded.output.unwrap().get_str("uri"), Some("X"));
    }

    #[test]
    fn dependencies_keep_declaration_order() {
        let mut storage = Storage::in_memory().unwrap();
        let instance = InstanceId::new();
        let a = unit_in(instance, State::Enqueued);
        let b = unit_in(instance, State::Enqueued);
        let c = unit_in(instance, State::Blocked);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        storage
            .with_transaction(|tx| {
                tx.insert_instance(instance, None)?;
                tx.insert_unit(&b, &[])?;
                tx.insert_unit(&a, &[])?;
                tx.insert_unit(&c, &[a_id, b_id])?;
                let leaves = tx.leaves(instance)?;
                assert_eq!(leaves.len(), 1);
                assert_eq!(leaves[0].id, c_id);
                assert_eq!(tx.downstream(a_id)?, vec![c_id]);
                Ok(())
            })
            .unwrap();

        assert_eq!(storage.upstream(c_id).unwrap(), vec![a_id, b_id]);
    }

    #[test]
    fn state_changes_are_logged_as_events() {
        let mut storage = Storage::in_memory().unwrap();
        let instance = InstanceId::new();
        let unit = unit_in(instance, State::Enqueued);
        let id = unit.id;

        storage
            .with_transaction(|tx| {
                tx.insert_instance(instance, None)?;
                tx.insert_unit(&unit, &[])?;
                tx.start_attempt(id, &Data::new())
            })
            .unwrap();

        let events = storage.get_events_since(0).unwrap();
        assert!(events.iter().any(|e| matches!(
            e.kind,
            EventKind::StateTransition {
                from: State::Enqueued,
                to: State::Running,
                ..
            }
        )));
        assert_eq!(storage.get_unit(id).unwrap().attempts, 1);
    }

    #[test]
    fn malformed_event_json_returns_unknown_variant() {
        let storage = Storage::in_memory().unwrap();

        storage
            .conn
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![timestamp(Utc::now()), "this is not valid json {{{"],
            )
            .unwrap();

        let events = storage.get_events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Unknown { raw } => {
                assert_eq!(raw, "this is not valid json {{{");
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
