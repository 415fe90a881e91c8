//! SQLite-backed fleet store
//!
//! # Tables
//!
//! ```text
//! devices          - registry + explicit current status columns
//! device_readings  - bounded telemetry history per device
//! jobs             - work units
//! queue_entries    - ordering wrapper, at most one open entry per job
//! energy_settings  - singleton row
//! energy_readings  - bounded load history
//! power_events     - append-only gate/breach log
//! conflicts        - inconsistencies awaiting an operator
//! ```
//!
//! Two partial unique indexes back the core invariants: one printing/paused
//! job per device, and one non-`done` queue entry per job.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{
    Conflict, ConflictKind, Device, DeviceReading, DeviceStatus, EnergyReading, EnergySettings,
    JobStatus, NewDevice, NewWorkUnit, PowerEvent, QueueEntry, QueueStatus, Resolution, WorkUnit,
};

const DEVICE_COLUMNS: &str = "id, name, address, max_extruder_temp, max_bed_temp, rated_power_kw, \
     active, current_status, current_power_kw, idle_streak, status_changed_at, created_at";

const JOB_COLUMNS: &str = "id, name, status, priority, weight, estimated_duration_secs, \
     assigned_device_id, started_at, completed_at, created_at";

const QUEUE_COLUMNS: &str = "id, job_id, priority_rank, enqueued_at, status, device_id";

const READING_COLUMNS: &str = "device_id, temperature_extruder, temperature_bed, progress, \
     status, fan_speed, power_draw_kw, recorded_at";

const CONFLICT_COLUMNS: &str =
    "id, kind, job_id, device_id, detail, detected_at, resolved_at, resolution";

// ============================================================================
// Result types
// ============================================================================

/// Outcome of appending a telemetry reading
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingAppend {
    pub previous_status: DeviceStatus,
    pub idle_streak: u32,
    /// Job printing or paused on the device whose start signal has gone out
    pub signaled_job_id: Option<String>,
}

/// Aggregate of the latest per-device power estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FleetLoad {
    pub devices_kw: f64,
    pub active_device_count: u32,
}

// ============================================================================
// Fleet Store
// ============================================================================

/// SQLite implementation of the fleet store
///
/// Uses a `Mutex` around a single connection; every statement is short.
pub struct FleetStore {
    conn: Mutex<Connection>,
}

impl FleetStore {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "Fleet store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                max_extruder_temp REAL NOT NULL,
                max_bed_temp REAL NOT NULL,
                rated_power_kw REAL NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                current_status TEXT NOT NULL DEFAULT 'offline',
                current_power_kw REAL NOT NULL DEFAULT 0,
                idle_streak INTEGER NOT NULL DEFAULT 0,
                status_changed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL REFERENCES devices(id),
                temperature_extruder REAL NOT NULL,
                temperature_bed REAL NOT NULL,
                progress REAL NOT NULL,
                status TEXT NOT NULL,
                fan_speed REAL NOT NULL,
                power_draw_kw REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_device_readings_device
                ON device_readings(device_id, id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 0,
                estimated_duration_secs INTEGER NOT NULL DEFAULT 0,
                assigned_device_id TEXT REFERENCES devices(id),
                started_at TEXT,
                start_signaled_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_per_device
                ON jobs(assigned_device_id) WHERE status IN ('printing', 'paused');

            CREATE TABLE IF NOT EXISTS queue_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                priority_rank INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                device_id TEXT REFERENCES devices(id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_one_open_per_job
                ON queue_entries(job_id) WHERE status != 'done';

            CREATE INDEX IF NOT EXISTS idx_queue_order
                ON queue_entries(status, priority_rank, enqueued_at, seq);

            CREATE TABLE IF NOT EXISTS energy_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_load_kw REAL NOT NULL,
                peak_protection_enabled INTEGER NOT NULL,
                stagger_enabled INTEGER NOT NULL,
                stagger_delay_secs INTEGER NOT NULL,
                base_load_kw REAL NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS energy_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                current_kw REAL NOT NULL,
                max_kw REAL NOT NULL,
                active_device_count INTEGER NOT NULL,
                source TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS power_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                current_kw REAL NOT NULL,
                limit_kw REAL NOT NULL,
                threshold_kw REAL NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                device_id TEXT,
                detail TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_one_open
                ON conflicts(job_id, kind) WHERE resolved_at IS NULL;
            "#,
        )?;

        let defaults = EnergySettings::default();
        conn.execute(
            "INSERT OR IGNORE INTO energy_settings
                (id, max_load_kw, peak_protection_enabled, stagger_enabled, stagger_delay_secs, base_load_kw, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                defaults.max_load_kw,
                defaults.peak_protection_enabled,
                defaults.stagger_enabled,
                defaults.stagger_delay_secs,
                defaults.base_load_kw,
                fmt_ts(&Utc::now()),
            ],
        )?;

        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Register a new device (starts offline)
    pub fn insert_device(&self, new: &NewDevice) -> StoreResult<Device> {
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: new.name.clone(),
            address: new.address.clone(),
            max_extruder_temp: new.max_extruder_temp,
            max_bed_temp: new.max_bed_temp,
            rated_power_kw: new.rated_power_kw,
            active: true,
            current_status: DeviceStatus::Offline,
            current_power_kw: 0.0,
            idle_streak: 0,
            status_changed_at: None,
            created_at: Utc::now(),
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (id, name, address, max_extruder_temp, max_bed_temp, rated_power_kw, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                device.id,
                device.name,
                device.address,
                device.max_extruder_temp,
                device.max_bed_temp,
                device.rated_power_kw,
                fmt_ts(&device.created_at),
            ],
        )?;

        Ok(device)
    }

    pub fn get_device(&self, id: &str) -> StoreResult<Option<Device>> {
        let conn = self.conn()?;
        Ok(query_device(&conn, id)?)
    }

    /// List devices; inactive ones only when asked
    pub fn list_devices(&self, include_inactive: bool) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;
        let sql = if include_inactive {
            format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY created_at, id")
        } else {
            format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE active = 1 ORDER BY created_at, id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], map_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Soft-deactivate a device. Returns false if it was already inactive.
    pub fn deactivate_device(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        if query_device(&conn, id)?.is_none() {
            return Err(StoreError::not_found("device", id));
        }
        let changed = conn.execute(
            "UPDATE devices SET active = 0 WHERE id = ?1 AND active = 1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Devices eligible for new work: active, idle, and not holding a job
    pub fn idle_devices(&self) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE active = 1
               AND current_status = 'idle'
               AND id NOT IN (
                   SELECT assigned_device_id FROM jobs
                   WHERE status IN ('printing', 'paused') AND assigned_device_id IS NOT NULL)
               AND id NOT IN (
                   SELECT device_id FROM queue_entries
                   WHERE status = 'assigned' AND device_id IS NOT NULL)
             ORDER BY status_changed_at, id"
        ))?;
        let devices = stmt
            .query_map([], map_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Job printing or paused on a device, if any
    pub fn device_active_job(&self, device_id: &str) -> StoreResult<Option<WorkUnit>> {
        let conn = self.conn()?;
        Ok(query_active_job(&conn, device_id)?)
    }

    /// Append a reading, evict past `cap`, and update the device status columns
    /// in one transaction.
    pub fn append_reading(&self, reading: &DeviceReading, cap: usize) -> StoreResult<ReadingAppend> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let previous_status: DeviceStatus = tx
            .query_row(
                "SELECT current_status FROM devices WHERE id = ?1",
                params![reading.device_id],
                |row| enum_col(row, 0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("device", &reading.device_id))?;

        tx.execute(
            "INSERT INTO device_readings
                (device_id, temperature_extruder, temperature_bed, progress, status, fan_speed, power_draw_kw, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reading.device_id,
                reading.temperature_extruder,
                reading.temperature_bed,
                reading.progress,
                reading.status.as_str(),
                reading.fan_speed,
                reading.power_draw_kw,
                fmt_ts(&reading.recorded_at),
            ],
        )?;

        tx.execute(
            "DELETE FROM device_readings
             WHERE device_id = ?1
               AND id <= (SELECT id FROM device_readings WHERE device_id = ?1
                          ORDER BY id DESC LIMIT 1 OFFSET ?2)",
            params![reading.device_id, cap as i64],
        )?;

        let status = reading.status.as_str();
        tx.execute(
            "UPDATE devices SET
                status_changed_at = CASE WHEN current_status != ?2 OR status_changed_at IS NULL
                                         THEN ?4 ELSE status_changed_at END,
                idle_streak = CASE WHEN ?2 = 'idle' THEN idle_streak + 1 ELSE 0 END,
                current_status = ?2,
                current_power_kw = ?3
             WHERE id = ?1",
            params![
                reading.device_id,
                status,
                reading.power_draw_kw,
                fmt_ts(&reading.recorded_at)
            ],
        )?;

        let idle_streak: i64 = tx.query_row(
            "SELECT idle_streak FROM devices WHERE id = ?1",
            params![reading.device_id],
            |row| row.get(0),
        )?;
        let signaled_job_id: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE assigned_device_id = ?1 AND status IN ('printing', 'paused')
                   AND start_signaled_at IS NOT NULL",
                params![reading.device_id],
                |row| row.get(0),
            )
            .optional()?;

        tx.commit()?;

        Ok(ReadingAppend {
            previous_status,
            idle_streak: idle_streak.max(0) as u32,
            signaled_job_id,
        })
    }

    /// Most recent readings first
    pub fn device_history(&self, device_id: &str, limit: usize) -> StoreResult<Vec<DeviceReading>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM device_readings
             WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let readings = stmt
            .query_map(params![device_id, limit as i64], map_reading)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(readings)
    }

    pub fn reading_count(&self, device_id: &str) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM device_readings WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Sum of the latest power estimates over active devices
    pub fn fleet_load(&self) -> StoreResult<FleetLoad> {
        let conn = self.conn()?;
        let (devices_kw, active): (f64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(current_power_kw), 0),
                    COALESCE(SUM(CASE WHEN current_status IN ('printing', 'paused') THEN 1 ELSE 0 END), 0)
             FROM devices WHERE active = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(FleetLoad {
            devices_kw,
            active_device_count: active.max(0) as u32,
        })
    }

    // ========================================================================
    // Jobs and queue
    // ========================================================================

    /// Create a job and its queue entry atomically
    pub fn enqueue(&self, new: &NewWorkUnit, rank: i64) -> StoreResult<(WorkUnit, QueueEntry)> {
        let now = Utc::now();
        let job = WorkUnit {
            id: Uuid::new_v4().to_string(),
            name: new.name.clone(),
            status: JobStatus::Queued,
            priority: new.priority,
            weight: new.weight,
            estimated_duration_secs: new.estimated_duration_secs,
            assigned_device_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
        };
        let entry = QueueEntry {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            priority_rank: rank,
            enqueued_at: now,
            status: QueueStatus::Queued,
            device_id: None,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, name, status, priority, weight, estimated_duration_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id,
                job.name,
                job.status.as_str(),
                job.priority.as_str(),
                job.weight,
                job.estimated_duration_secs as i64,
                fmt_ts(&job.created_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO queue_entries (id, job_id, priority_rank, enqueued_at, status)
             VALUES (?1, ?2, ?3, ?4, 'queued')",
            params![entry.id, entry.job_id, entry.priority_rank, fmt_ts(&entry.enqueued_at)],
        )?;
        tx.commit()?;

        Ok((job, entry))
    }

    pub fn get_job(&self, id: &str) -> StoreResult<Option<WorkUnit>> {
        let conn = self.conn()?;
        Ok(query_job(&conn, id)?)
    }

    pub fn get_queue_entry(&self, id: &str) -> StoreResult<Option<QueueEntry>> {
        let conn = self.conn()?;
        Ok(query_entry(&conn, id)?)
    }

    /// Most recent queue entry for a job
    pub fn entry_for_job(&self, job_id: &str) -> StoreResult<Option<QueueEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries
                     WHERE job_id = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![job_id],
                map_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Open entries (queued and assigned), in service order
    pub fn list_queue(&self) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries
             WHERE status != 'done'
             ORDER BY status DESC, priority_rank ASC, enqueued_at ASC, seq ASC"
        ))?;
        let entries = stmt
            .query_map([], map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Queued entries without a device, lowest rank first, FIFO within a rank
    pub fn candidate_entries(&self) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries
             WHERE status = 'queued' AND device_id IS NULL
             ORDER BY priority_rank ASC, enqueued_at ASC, seq ASC"
        ))?;
        let entries = stmt
            .query_map([], map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Commit one assignment: entry -> assigned, job -> printing, as one unit
    pub fn commit_assignment(
        &self,
        entry_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(QueueEntry, WorkUnit)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let entry = query_entry(&tx, entry_id)?
            .ok_or_else(|| StoreError::not_found("queue entry", entry_id))?;
        if entry.status != QueueStatus::Queued || entry.device_id.is_some() {
            return Err(StoreError::entry_not_queued(
                entry_id,
                entry.status,
                entry.device_id,
            ));
        }

        let job = query_job(&tx, &entry.job_id)?
            .ok_or_else(|| StoreError::not_found("job", &entry.job_id))?;
        if job.status != JobStatus::Queued {
            return Err(StoreError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to: JobStatus::Printing,
            });
        }

        ensure_device_free(&tx, device_id)?;

        tx.execute(
            "UPDATE queue_entries SET status = 'assigned', device_id = ?2 WHERE id = ?1",
            params![entry_id, device_id],
        )?;
        set_job_printing(&tx, &job.id, device_id, now)?;

        let entry = query_entry(&tx, entry_id)?
            .ok_or_else(|| StoreError::not_found("queue entry", entry_id))?;
        let job = query_job(&tx, &job.id)?.ok_or_else(|| StoreError::not_found("job", &job.id))?;
        tx.commit()?;

        Ok((entry, job))
    }

    /// Change the rank of a queued entry
    pub fn change_priority(&self, entry_id: &str, rank: i64) -> StoreResult<QueueEntry> {
        let conn = self.conn()?;
        let entry = query_entry(&conn, entry_id)?
            .ok_or_else(|| StoreError::not_found("queue entry", entry_id))?;
        if entry.status != QueueStatus::Queued {
            return Err(StoreError::entry_not_queued(
                entry_id,
                entry.status,
                entry.device_id,
            ));
        }
        conn.execute(
            "UPDATE queue_entries SET priority_rank = ?2 WHERE id = ?1",
            params![entry_id, rank],
        )?;
        Ok(QueueEntry {
            priority_rank: rank,
            ..entry
        })
    }

    /// Remove a queued entry and cancel its job
    pub fn remove_entry(&self, entry_id: &str, now: DateTime<Utc>) -> StoreResult<QueueEntry> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let entry = query_entry(&tx, entry_id)?
            .ok_or_else(|| StoreError::not_found("queue entry", entry_id))?;
        if entry.status != QueueStatus::Queued {
            return Err(StoreError::entry_not_queued(
                entry_id,
                entry.status,
                entry.device_id,
            ));
        }

        tx.execute(
            "UPDATE queue_entries SET status = 'done' WHERE id = ?1",
            params![entry_id],
        )?;
        tx.execute(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?2 WHERE id = ?1 AND status = 'queued'",
            params![entry.job_id, fmt_ts(&now)],
        )?;
        tx.commit()?;

        Ok(QueueEntry {
            status: QueueStatus::Done,
            ..entry
        })
    }

    /// Apply an operator job transition, closing the queue entry on terminal states
    pub fn update_job_status(
        &self,
        job_id: &str,
        next: JobStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<WorkUnit> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let job = transition_job(&tx, job_id, next, now)?;
        tx.commit()?;
        Ok(job)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Entries left `assigned` while their job never reached printing
    /// Stamp the start signal of a job still active on `device_id`. Stale
    /// detection counts idle readings from here.
    pub fn mark_start_signaled(
        &self,
        job_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE jobs SET start_signaled_at = ?3
             WHERE id = ?1 AND assigned_device_id = ?2 AND status IN ('printing', 'paused')
               AND start_signaled_at IS NULL",
            params![job_id, device_id, fmt_ts(&now)],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE devices SET idle_streak = 0 WHERE id = ?1",
                params![device_id],
            )?;
        }

        tx.commit()?;
        Ok(changed > 0)
    }

    /// Stamp active jobs whose start signal was dropped, e.g. by a shutdown
    /// during the stagger delay. Returns the job ids.
    pub fn stamp_unsignaled_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let pending: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, assigned_device_id FROM jobs
                 WHERE status IN ('printing', 'paused') AND start_signaled_at IS NULL
                   AND assigned_device_id IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (job_id, device_id) in &pending {
            tx.execute(
                "UPDATE jobs SET start_signaled_at = ?2 WHERE id = ?1",
                params![job_id, fmt_ts(&now)],
            )?;
            tx.execute(
                "UPDATE devices SET idle_streak = 0 WHERE id = ?1",
                params![device_id],
            )?;
        }

        tx.commit()?;
        Ok(pending.into_iter().map(|(job_id, _)| job_id).collect())
    }

    pub fn interrupted_assignments(&self) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT q.id, q.job_id, q.priority_rank, q.enqueued_at, q.status, q.device_id
             FROM queue_entries q JOIN jobs j ON j.id = q.job_id
             WHERE q.status = 'assigned' AND j.status = 'queued'
             ORDER BY q.seq",
        )?;
        let entries = stmt
            .query_map([], map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Finish the second half of an interrupted commit
    pub fn replay_assignment(&self, entry_id: &str, now: DateTime<Utc>) -> StoreResult<WorkUnit> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let entry = query_entry(&tx, entry_id)?
            .ok_or_else(|| StoreError::not_found("queue entry", entry_id))?;
        let device_id = match (&entry.status, &entry.device_id) {
            (QueueStatus::Assigned, Some(device_id)) => device_id.clone(),
            _ => {
                return Err(StoreError::entry_not_queued(
                    entry_id,
                    entry.status,
                    entry.device_id,
                ))
            }
        };

        let device = query_device(&tx, &device_id)?
            .ok_or_else(|| StoreError::not_found("device", &device_id))?;
        if !device.active {
            return Err(StoreError::DeviceInactive { device_id });
        }
        if let Some(other) = query_active_job(&tx, &device_id)? {
            return Err(StoreError::DeviceOccupied {
                device_id,
                job_id: other.id,
            });
        }

        set_job_printing(&tx, &entry.job_id, &device_id, now)?;
        let job = query_job(&tx, &entry.job_id)?
            .ok_or_else(|| StoreError::not_found("job", &entry.job_id))?;
        tx.commit()?;
        Ok(job)
    }

    /// Undo the first half of an interrupted commit
    pub fn revert_assignment(&self, entry_id: &str) -> StoreResult<QueueEntry> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE queue_entries SET status = 'queued', device_id = NULL
             WHERE id = ?1 AND status = 'assigned'",
            params![entry_id],
        )?;
        query_entry(&conn, entry_id)?.ok_or_else(|| StoreError::not_found("queue entry", entry_id))
    }

    // ========================================================================
    // Energy
    // ========================================================================

    pub fn energy_settings(&self) -> StoreResult<EnergySettings> {
        let conn = self.conn()?;
        let settings = conn.query_row(
            "SELECT max_load_kw, peak_protection_enabled, stagger_enabled, stagger_delay_secs, base_load_kw
             FROM energy_settings WHERE id = 1",
            [],
            |row| {
                Ok(EnergySettings {
                    max_load_kw: row.get(0)?,
                    peak_protection_enabled: row.get(1)?,
                    stagger_enabled: row.get(2)?,
                    stagger_delay_secs: row.get(3)?,
                    base_load_kw: row.get(4)?,
                })
            },
        )?;
        Ok(settings)
    }

    pub fn save_energy_settings(&self, settings: &EnergySettings) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE energy_settings SET
                max_load_kw = ?1, peak_protection_enabled = ?2, stagger_enabled = ?3,
                stagger_delay_secs = ?4, base_load_kw = ?5, updated_at = ?6
             WHERE id = 1",
            params![
                settings.max_load_kw,
                settings.peak_protection_enabled,
                settings.stagger_enabled,
                settings.stagger_delay_secs,
                settings.base_load_kw,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Append a load sample, keeping at most `cap` rows
    pub fn insert_energy_reading(&self, reading: &EnergyReading, cap: usize) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO energy_readings (current_kw, max_kw, active_device_count, source, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reading.current_kw,
                reading.max_kw,
                reading.active_device_count,
                reading.source.as_str(),
                fmt_ts(&reading.recorded_at),
            ],
        )?;
        tx.execute(
            "DELETE FROM energy_readings
             WHERE id <= (SELECT id FROM energy_readings ORDER BY id DESC LIMIT 1 OFFSET ?1)",
            params![cap as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn latest_energy_reading(&self) -> StoreResult<Option<EnergyReading>> {
        let conn = self.conn()?;
        let reading = conn
            .query_row(
                "SELECT current_kw, max_kw, active_device_count, source, recorded_at
                 FROM energy_readings ORDER BY id DESC LIMIT 1",
                [],
                map_energy_reading,
            )
            .optional()?;
        Ok(reading)
    }

    /// Most recent samples first
    pub fn energy_history(&self, limit: usize) -> StoreResult<Vec<EnergyReading>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT current_kw, max_kw, active_device_count, source, recorded_at
             FROM energy_readings ORDER BY id DESC LIMIT ?1",
        )?;
        let readings = stmt
            .query_map(params![limit as i64], map_energy_reading)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(readings)
    }

    pub fn energy_reading_count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM energy_readings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn insert_power_event(&self, event: &PowerEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO power_events (kind, current_kw, limit_kw, threshold_kw, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.kind.as_str(),
                event.current_kw,
                event.limit_kw,
                event.threshold_kw,
                event.reason,
                fmt_ts(&event.created_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent events first
    pub fn list_power_events(&self, limit: usize) -> StoreResult<Vec<PowerEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, current_kw, limit_kw, threshold_kw, reason, created_at
             FROM power_events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PowerEvent {
                    kind: enum_col(row, 0)?,
                    current_kw: row.get(1)?,
                    limit_kw: row.get(2)?,
                    threshold_kw: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: ts_col(row, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Record an open conflict; `None` if one is already open for the job and kind
    pub fn open_conflict(
        &self,
        kind: ConflictKind,
        job_id: &str,
        device_id: Option<&str>,
        detail: &str,
    ) -> StoreResult<Option<Conflict>> {
        let conn = self.conn()?;
        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            kind,
            job_id: job_id.to_string(),
            device_id: device_id.map(str::to_string),
            detail: detail.to_string(),
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO conflicts (id, kind, job_id, device_id, detail, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conflict.id,
                kind.as_str(),
                conflict.job_id,
                conflict.device_id,
                conflict.detail,
                fmt_ts(&conflict.detected_at),
            ],
        )?;
        Ok((inserted > 0).then_some(conflict))
    }

    /// Record a conflict that recovery already settled
    pub fn record_resolved_conflict(
        &self,
        kind: ConflictKind,
        job_id: &str,
        device_id: Option<&str>,
        detail: &str,
        resolution: Resolution,
    ) -> StoreResult<Conflict> {
        let now = Utc::now();
        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            kind,
            job_id: job_id.to_string(),
            device_id: device_id.map(str::to_string),
            detail: detail.to_string(),
            detected_at: now,
            resolved_at: Some(now),
            resolution: Some(resolution),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conflicts (id, kind, job_id, device_id, detail, detected_at, resolved_at, resolution)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![
                conflict.id,
                kind.as_str(),
                conflict.job_id,
                conflict.device_id,
                conflict.detail,
                fmt_ts(&now),
                resolution.as_str(),
            ],
        )?;
        Ok(conflict)
    }

    pub fn get_conflict(&self, id: &str) -> StoreResult<Option<Conflict>> {
        let conn = self.conn()?;
        Ok(query_conflict(&conn, id)?)
    }

    pub fn list_conflicts(&self, open_only: bool) -> StoreResult<Vec<Conflict>> {
        let conn = self.conn()?;
        let filter = if open_only { "WHERE resolved_at IS NULL" } else { "" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts {filter} ORDER BY detected_at DESC"
        ))?;
        let conflicts = stmt
            .query_map([], map_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    /// Apply an operator decision to an open conflict
    pub fn resolve_conflict(
        &self,
        id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> StoreResult<Conflict> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let conflict =
            query_conflict(&tx, id)?.ok_or_else(|| StoreError::not_found("conflict", id))?;
        if conflict.resolved_at.is_some() {
            return Err(StoreError::AlreadyResolved { id: id.to_string() });
        }

        match resolution {
            Resolution::KeepPrinting => {
                if let Some(device_id) = &conflict.device_id {
                    tx.execute(
                        "UPDATE devices SET idle_streak = 0 WHERE id = ?1",
                        params![device_id],
                    )?;
                }
            }
            Resolution::MarkCompleted => {
                transition_job(&tx, &conflict.job_id, JobStatus::Completed, now)?;
            }
            Resolution::MarkFailed => {
                transition_job(&tx, &conflict.job_id, JobStatus::Failed, now)?;
            }
            Resolution::Replayed | Resolution::Reverted => {
                return Err(StoreError::InvalidResolution {
                    resolution: resolution.as_str().to_string(),
                });
            }
        }

        tx.execute(
            "UPDATE conflicts SET resolved_at = ?2, resolution = ?3 WHERE id = ?1",
            params![id, fmt_ts(&now), resolution.as_str()],
        )?;
        tx.commit()?;

        Ok(Conflict {
            resolved_at: Some(now),
            resolution: Some(resolution),
            ..conflict
        })
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

fn ensure_device_free(tx: &Transaction<'_>, device_id: &str) -> StoreResult<()> {
    let device =
        query_device(tx, device_id)?.ok_or_else(|| StoreError::not_found("device", device_id))?;
    if !device.active {
        return Err(StoreError::DeviceInactive {
            device_id: device_id.to_string(),
        });
    }
    if let Some(job) = query_active_job(tx, device_id)? {
        return Err(StoreError::DeviceOccupied {
            device_id: device_id.to_string(),
            job_id: job.id,
        });
    }
    let pending: Option<String> = tx
        .query_row(
            "SELECT job_id FROM queue_entries WHERE device_id = ?1 AND status = 'assigned' LIMIT 1",
            params![device_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(job_id) = pending {
        return Err(StoreError::DeviceOccupied {
            device_id: device_id.to_string(),
            job_id,
        });
    }
    Ok(())
}

fn set_job_printing(
    tx: &Transaction<'_>,
    job_id: &str,
    device_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    tx.execute(
        "UPDATE jobs SET status = 'printing', assigned_device_id = ?2, started_at = ?3,
                start_signaled_at = NULL
         WHERE id = ?1",
        params![job_id, device_id, fmt_ts(&now)],
    )?;
    tx.execute(
        "UPDATE devices SET idle_streak = 0 WHERE id = ?1",
        params![device_id],
    )?;
    Ok(())
}

fn transition_job(
    tx: &Transaction<'_>,
    job_id: &str,
    next: JobStatus,
    now: DateTime<Utc>,
) -> StoreResult<WorkUnit> {
    let job = query_job(tx, job_id)?.ok_or_else(|| StoreError::not_found("job", job_id))?;
    if !job.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            from: job.status,
            to: next,
        });
    }

    if next.is_terminal() {
        tx.execute(
            "UPDATE jobs SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![job_id, next.as_str(), fmt_ts(&now)],
        )?;
        tx.execute(
            "UPDATE queue_entries SET status = 'done' WHERE job_id = ?1 AND status != 'done'",
            params![job_id],
        )?;
    } else {
        tx.execute(
            "UPDATE jobs SET status = ?2 WHERE id = ?1",
            params![job_id, next.as_str()],
        )?;
    }

    query_job(tx, job_id)?.ok_or_else(|| StoreError::not_found("job", job_id))
}

// ============================================================================
// Queries and row mapping
// ============================================================================

fn query_device(conn: &Connection, id: &str) -> rusqlite::Result<Option<Device>> {
    conn.query_row(
        &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
        params![id],
        map_device,
    )
    .optional()
}

fn query_job(conn: &Connection, id: &str) -> rusqlite::Result<Option<WorkUnit>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        map_job,
    )
    .optional()
}

fn query_active_job(conn: &Connection, device_id: &str) -> rusqlite::Result<Option<WorkUnit>> {
    conn.query_row(
        &format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE assigned_device_id = ?1 AND status IN ('printing', 'paused')"
        ),
        params![device_id],
        map_job,
    )
    .optional()
}

fn query_entry(conn: &Connection, id: &str) -> rusqlite::Result<Option<QueueEntry>> {
    conn.query_row(
        &format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE id = ?1"),
        params![id],
        map_entry,
    )
    .optional()
}

fn query_conflict(conn: &Connection, id: &str) -> rusqlite::Result<Option<Conflict>> {
    conn.query_row(
        &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
        params![id],
        map_conflict,
    )
    .optional()
}

fn map_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        max_extruder_temp: row.get(3)?,
        max_bed_temp: row.get(4)?,
        rated_power_kw: row.get(5)?,
        active: row.get(6)?,
        current_status: enum_col(row, 7)?,
        current_power_kw: row.get(8)?,
        idle_streak: row.get::<_, i64>(9)?.max(0) as u32,
        status_changed_at: opt_ts_col(row, 10)?,
        created_at: ts_col(row, 11)?,
    })
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<WorkUnit> {
    Ok(WorkUnit {
        id: row.get(0)?,
        name: row.get(1)?,
        status: enum_col(row, 2)?,
        priority: enum_col(row, 3)?,
        weight: row.get(4)?,
        estimated_duration_secs: row.get::<_, i64>(5)?.max(0) as u64,
        assigned_device_id: row.get(6)?,
        started_at: opt_ts_col(row, 7)?,
        completed_at: opt_ts_col(row, 8)?,
        created_at: ts_col(row, 9)?,
    })
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        job_id: row.get(1)?,
        priority_rank: row.get(2)?,
        enqueued_at: ts_col(row, 3)?,
        status: enum_col(row, 4)?,
        device_id: row.get(5)?,
    })
}

fn map_reading(row: &Row<'_>) -> rusqlite::Result<DeviceReading> {
    Ok(DeviceReading {
        device_id: row.get(0)?,
        temperature_extruder: row.get(1)?,
        temperature_bed: row.get(2)?,
        progress: row.get(3)?,
        status: enum_col(row, 4)?,
        fan_speed: row.get(5)?,
        power_draw_kw: row.get(6)?,
        recorded_at: ts_col(row, 7)?,
    })
}

fn map_energy_reading(row: &Row<'_>) -> rusqlite::Result<EnergyReading> {
    Ok(EnergyReading {
        current_kw: row.get(0)?,
        max_kw: row.get(1)?,
        active_device_count: row.get(2)?,
        source: enum_col(row, 3)?,
        recorded_at: ts_col(row, 4)?,
    })
}

fn map_conflict(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    let resolution: Option<String> = row.get(7)?;
    let resolution = resolution
        .map(|raw| raw.parse::<Resolution>())
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into()))?;
    Ok(Conflict {
        id: row.get(0)?,
        kind: enum_col(row, 1)?,
        job_id: row.get(2)?,
        device_id: row.get(3)?,
        detail: row.get(4)?,
        detected_at: ts_col(row, 5)?,
        resolved_at: opt_ts_col(row, 6)?,
        resolution,
    })
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_ts(idx, &raw)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LoadSource, PowerEventKind, Priority};

    fn reading(device_id: &str, status: DeviceStatus) -> DeviceReading {
        DeviceReading {
            device_id: device_id.to_string(),
            temperature_extruder: 25.0,
            temperature_bed: 25.0,
            progress: 0.0,
            status,
            fan_speed: 0.0,
            power_draw_kw: 0.02,
            recorded_at: Utc::now(),
        }
    }

    fn store_with_device() -> (FleetStore, Device) {
        let store = FleetStore::in_memory().unwrap();
        let device = store
            .insert_device(&NewDevice::new("mk4-01", "10.0.0.11:80"))
            .unwrap();
        (store, device)
    }

    #[test]
    fn test_new_device_starts_offline() {
        let (store, device) = store_with_device();
        let loaded = store.get_device(&device.id).unwrap().unwrap();
        assert_eq!(loaded.current_status, DeviceStatus::Offline);
        assert!(loaded.active);
        assert!(store.device_history(&device.id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_append_reading_updates_status() {
        let (store, device) = store_with_device();
        let outcome = store
            .append_reading(&reading(&device.id, DeviceStatus::Idle), 100)
            .unwrap();
        assert_eq!(outcome.previous_status, DeviceStatus::Offline);
        assert_eq!(outcome.idle_streak, 1);

        let loaded = store.get_device(&device.id).unwrap().unwrap();
        assert_eq!(loaded.current_status, DeviceStatus::Idle);
        assert!(loaded.status_changed_at.is_some());
    }

    #[test]
    fn test_idle_streak_resets() {
        let (store, device) = store_with_device();
        store.append_reading(&reading(&device.id, DeviceStatus::Idle), 100).unwrap();
        store.append_reading(&reading(&device.id, DeviceStatus::Idle), 100).unwrap();
        let outcome = store
            .append_reading(&reading(&device.id, DeviceStatus::Printing), 100)
            .unwrap();
        assert_eq!(outcome.idle_streak, 0);
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let (store, device) = store_with_device();
        for i in 0..1001 {
            let mut r = reading(&device.id, DeviceStatus::Idle);
            r.progress = i as f64;
            store.append_reading(&r, 1000).unwrap();
        }

        assert_eq!(store.reading_count(&device.id).unwrap(), 1000);
        let history = store.device_history(&device.id, 1000).unwrap();
        assert_eq!(history.first().unwrap().progress, 1000.0);
        // Only reading #0 was evicted
        assert_eq!(history.last().unwrap().progress, 1.0);
    }

    #[test]
    fn test_append_reading_unknown_device() {
        let store = FleetStore::in_memory().unwrap();
        let result = store.append_reading(&reading("missing", DeviceStatus::Idle), 10);
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_candidate_order() {
        let store = FleetStore::in_memory().unwrap();
        let (_, low) = store.enqueue(&NewWorkUnit::new("low", Priority::Low), 10).unwrap();
        let (_, high) = store.enqueue(&NewWorkUnit::new("high", Priority::High), 1).unwrap();
        let (_, high2) = store.enqueue(&NewWorkUnit::new("high2", Priority::High), 1).unwrap();

        let ids: Vec<_> = store
            .candidate_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![high.id, high2.id, low.id]);
    }

    #[test]
    fn test_commit_assignment_is_single_use() {
        let (store, device) = store_with_device();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("benchy", Priority::Medium), 5).unwrap();

        let (entry_after, job_after) = store
            .commit_assignment(&entry.id, &device.id, Utc::now())
            .unwrap();
        assert_eq!(entry_after.status, QueueStatus::Assigned);
        assert_eq!(entry_after.device_id.as_deref(), Some(device.id.as_str()));
        assert_eq!(job_after.id, job.id);
        assert_eq!(job_after.status, JobStatus::Printing);
        assert!(job_after.started_at.is_some());

        let again = store.commit_assignment(&entry.id, &device.id, Utc::now());
        assert!(matches!(again, Err(StoreError::EntryNotQueued { .. })));
    }

    #[test]
    fn test_idle_streak_counts_from_start_signal() {
        let (store, device) = store_with_device();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("benchy", Priority::Medium), 5).unwrap();
        store.commit_assignment(&entry.id, &device.id, Utc::now()).unwrap();

        // Committed but not yet told to start
        for _ in 0..4 {
            let outcome = store
                .append_reading(&reading(&device.id, DeviceStatus::Idle), 100)
                .unwrap();
            assert!(outcome.signaled_job_id.is_none());
        }

        assert!(store.mark_start_signaled(&job.id, &device.id, Utc::now()).unwrap());
        assert!(!store.mark_start_signaled(&job.id, &device.id, Utc::now()).unwrap());

        let outcome = store
            .append_reading(&reading(&device.id, DeviceStatus::Idle), 100)
            .unwrap();
        assert_eq!(outcome.idle_streak, 1);
        assert_eq!(outcome.signaled_job_id.as_deref(), Some(job.id.as_str()));
    }

    #[test]
    fn test_stamp_unsignaled_jobs() {
        let (store, device) = store_with_device();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("benchy", Priority::Medium), 5).unwrap();
        store.commit_assignment(&entry.id, &device.id, Utc::now()).unwrap();

        assert_eq!(store.stamp_unsignaled_jobs(Utc::now()).unwrap(), vec![job.id.clone()]);
        assert!(store.stamp_unsignaled_jobs(Utc::now()).unwrap().is_empty());
        assert!(!store.mark_start_signaled(&job.id, &device.id, Utc::now()).unwrap());
    }

    #[test]
    fn test_commit_assignment_rejects_occupied_device() {
        let (store, device) = store_with_device();
        let (_, first) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        let (_, second) = store.enqueue(&NewWorkUnit::new("b", Priority::Medium), 5).unwrap();

        store.commit_assignment(&first.id, &device.id, Utc::now()).unwrap();
        let result = store.commit_assignment(&second.id, &device.id, Utc::now());
        assert!(matches!(result, Err(StoreError::DeviceOccupied { .. })));

        // Nothing from the failed attempt is visible
        let entry = store.get_queue_entry(&second.id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Queued);
        assert!(entry.device_id.is_none());
    }

    #[test]
    fn test_terminal_transition_closes_entry() {
        let (store, device) = store_with_device();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        store.commit_assignment(&entry.id, &device.id, Utc::now()).unwrap();

        let job = store.update_job_status(&job.id, JobStatus::Completed, Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        let entry = store.get_queue_entry(&entry.id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Done);
        assert!(store.list_queue().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_job_transition() {
        let store = FleetStore::in_memory().unwrap();
        let (job, _) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        let result = store.update_job_status(&job.id, JobStatus::Completed, Utc::now());
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_remove_entry_cancels_job() {
        let store = FleetStore::in_memory().unwrap();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        let removed = store.remove_entry(&entry.id, Utc::now()).unwrap();
        assert_eq!(removed.status, QueueStatus::Done);

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(store.candidate_entries().unwrap().is_empty());
    }

    #[test]
    fn test_energy_settings_default_row() {
        let store = FleetStore::in_memory().unwrap();
        assert_eq!(store.energy_settings().unwrap(), EnergySettings::default());

        let updated = EnergySettings {
            max_load_kw: 12.0,
            stagger_delay_secs: 5,
            ..EnergySettings::default()
        };
        store.save_energy_settings(&updated).unwrap();
        assert_eq!(store.energy_settings().unwrap(), updated);
    }

    #[test]
    fn test_energy_history_cap() {
        let store = FleetStore::in_memory().unwrap();
        for i in 0..12 {
            let reading = EnergyReading {
                current_kw: i as f64,
                max_kw: 6.0,
                active_device_count: 0,
                source: LoadSource::Estimate,
                recorded_at: Utc::now(),
            };
            store.insert_energy_reading(&reading, 10).unwrap();
        }
        assert_eq!(store.energy_reading_count().unwrap(), 10);
        assert_eq!(store.latest_energy_reading().unwrap().unwrap().current_kw, 11.0);
        assert_eq!(store.energy_history(100).unwrap().last().unwrap().current_kw, 2.0);
    }

    #[test]
    fn test_power_events_roundtrip() {
        let store = FleetStore::in_memory().unwrap();
        let event = PowerEvent {
            kind: PowerEventKind::AdmissionBlocked,
            current_kw: 5.5,
            limit_kw: 6.0,
            threshold_kw: 5.4,
            reason: "load above threshold".to_string(),
            created_at: Utc::now(),
        };
        store.insert_power_event(&event).unwrap();
        let events = store.list_power_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PowerEventKind::AdmissionBlocked);
        assert_eq!(events[0].current_kw, 5.5);
    }

    #[test]
    fn test_open_conflict_once() {
        let (store, device) = store_with_device();
        let (job, _) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();

        let first = store
            .open_conflict(ConflictKind::StalePrinting, &job.id, Some(&device.id), "idle x3")
            .unwrap();
        let second = store
            .open_conflict(ConflictKind::StalePrinting, &job.id, Some(&device.id), "idle x4")
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.list_conflicts(true).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_enum_column_is_an_error() {
        let (store, device) = store_with_device();
        let (job, _) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        store
            .open_conflict(ConflictKind::StalePrinting, &job.id, Some(&device.id), "idle x3")
            .unwrap();

        store
            .conn()
            .unwrap()
            .execute("UPDATE conflicts SET kind = 'bogus'", [])
            .unwrap();
        let result = store.list_conflicts(false);
        assert!(matches!(
            result,
            Err(StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(..)))
        ));

        store
            .conn()
            .unwrap()
            .execute("UPDATE devices SET current_status = 'asleep'", [])
            .unwrap();
        assert!(store.get_device(&device.id).is_err());
    }

    #[test]
    fn test_resolve_conflict_marks_job_failed() {
        let (store, device) = store_with_device();
        let (job, entry) = store.enqueue(&NewWorkUnit::new("a", Priority::Medium), 5).unwrap();
        store.commit_assignment(&entry.id, &device.id, Utc::now()).unwrap();
        let conflict = store
            .open_conflict(ConflictKind::StalePrinting, &job.id, Some(&device.id), "idle")
            .unwrap()
            .unwrap();

        let resolved = store
            .resolve_conflict(&conflict.id, Resolution::MarkFailed, Utc::now())
            .unwrap();
        assert_eq!(resolved.resolution, Some(Resolution::MarkFailed));
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().status, JobStatus::Failed);

        let again = store.resolve_conflict(&conflict.id, Resolution::KeepPrinting, Utc::now());
        assert!(matches!(again, Err(StoreError::AlreadyResolved { .. })));
    }

    #[test]
    fn test_fixed_width_timestamps_sort() {
        let a = DateTime::parse_from_rfc3339("2024-01-01T00:00:01Z").unwrap().with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2024-01-01T00:00:01.5Z").unwrap().with_timezone(&Utc);
        assert!(fmt_ts(&a) < fmt_ts(&b));
    }
}
