//! Durable certificate store.
//!
//! One SQLite table holds every certificate the service has ever issued.
//! The schema is created on first open, writes are transactional, and the
//! single connection behind a mutex gives the one-writer/serialized-row
//! semantics that status transitions rely on.
//!
//! Serial numbers are random `u64`s; SQLite integers are signed, so serials
//! are stored bit-cast to `i64` and cast back on read.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{CmsError, CmsResult};
use crate::status::CertStatus;

const SQL_CREATE_DB: &str = "CREATE TABLE IF NOT EXISTS certs (
    serial INTEGER PRIMARY KEY,
    skid TEXT,
    CN TEXT,
    O TEXT,
    OU TEXT,
    C TEXT,
    not_before INTEGER,
    not_after INTEGER,
    status INTEGER,
    status_date INTEGER
)";

/// One row of the `certs` table.
#[derive(Debug, Clone)]
pub struct CertRecord {
    pub serial: u64,
    pub skid: String,
    pub cn: String,
    pub o: String,
    pub ou: String,
    pub c: String,
    pub not_before: i64,
    pub not_after: i64,
    pub status: CertStatus,
    pub status_date: i64,
}

pub struct CertStore {
    conn: Mutex<Connection>,
}

impl CertStore {
    /// Open (and if necessary create) the certificate database.
    pub fn open(path: &Path) -> CmsResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute(SQL_CREATE_DB, [])?;
        info!(db = %path.display(), "certificate database ready");
        Ok(CertStore {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new record, enforcing the live-set uniqueness invariants on
    /// subject and SKID inside one transaction.
    pub fn insert(&self, rec: &CertRecord) -> CmsResult<()> {
        if rec.not_before > rec.not_after {
            return Err(CmsError::Config(format!(
                "certificate {} has not_before after not_after",
                rec.serial
            )));
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let live = live_status_params();
        let dup_subject: i64 = tx.query_row(
            "SELECT COUNT(*) FROM certs
             WHERE CN = ?1 AND O = ?2 AND OU = ?3 AND C = ?4
               AND status IN (?5, ?6, ?7)",
            params![rec.cn, rec.o, rec.ou, rec.c, live[0], live[1], live[2]],
            |row| row.get(0),
        )?;
        if dup_subject > 0 {
            return Err(CmsError::Duplicate(format!(
                "a live certificate already exists for subject CN={} O={} OU={} C={}",
                rec.cn, rec.o, rec.ou, rec.c
            )));
        }

        let dup_skid: i64 = tx.query_row(
            "SELECT COUNT(*) FROM certs WHERE skid = ?1 AND status IN (?2, ?3, ?4)",
            params![rec.skid, live[0], live[1], live[2]],
            |row| row.get(0),
        )?;
        if dup_skid > 0 {
            return Err(CmsError::Duplicate(format!(
                "a live certificate already exists for subject key identifier {}",
                rec.skid
            )));
        }

        tx.execute(
            "INSERT INTO certs (serial, skid, CN, O, OU, C, not_before, not_after, status, status_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.serial as i64,
                rec.skid,
                rec.cn,
                rec.o,
                rec.ou,
                rec.c,
                rec.not_before,
                rec.not_after,
                rec.status.as_i64(),
                rec.status_date,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Current status and its transition time.
    pub fn get_status(&self, serial: u64) -> CmsResult<(CertStatus, i64)> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT status, status_date FROM certs WHERE serial = ?1",
                params![serial as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((status, date)) => Ok((CertStatus::from_i64(status)?, date)),
            None => Err(CmsError::StateConflict {
                serial,
                message: "no such certificate".into(),
            }),
        }
    }

    pub fn get_record(&self, serial: u64) -> CmsResult<CertRecord> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let rec = conn
            .query_row(
                "SELECT serial, skid, CN, O, OU, C, not_before, not_after, status, status_date
                 FROM certs WHERE serial = ?1",
                params![serial as i64],
                row_to_record,
            )
            .optional()?;
        rec.ok_or(CmsError::StateConflict {
            serial,
            message: "no such certificate".into(),
        })
    }

    /// Atomically move `serial` to `new_status`, but only from one of the
    /// `allowed_prev` states. Anything else is a `StateConflict` and the row
    /// is left untouched.
    pub fn set_status(
        &self,
        serial: u64,
        new_status: CertStatus,
        allowed_prev: &[CertStatus],
        status_date: i64,
    ) -> CmsResult<()> {
        if allowed_prev.is_empty() {
            return Err(CmsError::StateConflict {
                serial,
                message: "empty allowed-state set".into(),
            });
        }
        let placeholders: Vec<String> = (0..allowed_prev.len())
            .map(|i| format!("?{}", i + 4))
            .collect();
        let sql = format!(
            "UPDATE certs SET status = ?1, status_date = ?2 WHERE serial = ?3 AND status IN ({})",
            placeholders.join(", ")
        );

        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> = vec![
            new_status.as_i64().into(),
            status_date.into(),
            (serial as i64).into(),
        ];
        for s in allowed_prev {
            values.push(s.as_i64().into());
        }
        let changed = stmt.execute(rusqlite::params_from_iter(values))?;
        if changed == 0 {
            let current = conn
                .query_row(
                    "SELECT status FROM certs WHERE serial = ?1",
                    params![serial as i64],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            let message = match current {
                Some(code) => format!(
                    "transition to {} not permitted from {}",
                    new_status,
                    CertStatus::from_i64(code)?
                ),
                None => "no such certificate".into(),
            };
            return Err(CmsError::StateConflict { serial, message });
        }
        Ok(())
    }

    /// Serials of PENDING records whose validity window has opened.
    pub fn scan_to_valid(&self, now: i64) -> CmsResult<Vec<u64>> {
        self.scan(
            "SELECT serial FROM certs
             WHERE not_before <= ?1 AND not_after > ?1 AND status = ?2",
            now,
            CertStatus::Pending,
        )
    }

    /// Serials of VALID records whose validity window has closed.
    pub fn scan_to_expired(&self, now: i64) -> CmsResult<Vec<u64>> {
        self.scan(
            "SELECT serial FROM certs WHERE not_after <= ?1 AND status = ?2",
            now,
            CertStatus::Valid,
        )
    }

    fn scan(&self, sql: &str, now: i64, status: CertStatus) -> CmsResult<Vec<u64>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(sql)?;
        let serials = stmt
            .query_map(params![now, status.as_i64()], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(serials.into_iter().map(|s| s as u64).collect())
    }

    /// Number of live records sharing the given subject.
    pub fn count_dup_subject(&self, cn: &str, o: &str, ou: &str, c: &str) -> CmsResult<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let live = live_status_params();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM certs
             WHERE CN = ?1 AND O = ?2 AND OU = ?3 AND C = ?4 AND status IN (?5, ?6, ?7)",
            params![cn, o, ou, c, live[0], live[1], live[2]],
            |row| row.get(0),
        )?)
    }

    /// Number of live records sharing the given subject key identifier.
    pub fn count_dup_skid(&self, skid: &str) -> CmsResult<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let live = live_status_params();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM certs WHERE skid = ?1 AND status IN (?2, ?3, ?4)",
            params![skid, live[0], live[1], live[2]],
            |row| row.get(0),
        )?)
    }

    /// All records in a live state, for republishing retained status on
    /// startup.
    pub fn live_records(&self) -> CmsResult<Vec<CertRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let live = live_status_params();
        let mut stmt = conn.prepare(
            "SELECT serial, skid, CN, O, OU, C, not_before, not_after, status, status_date
             FROM certs WHERE status IN (?1, ?2, ?3)",
        )?;
        let rows = stmt
            .query_map(params![live[0], live[1], live[2]], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn live_status_params() -> [i64; 3] {
    let live = CertStatus::live_set();
    [live[0].as_i64(), live[1].as_i64(), live[2].as_i64()]
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CertRecord> {
    Ok(CertRecord {
        serial: row.get::<_, i64>(0)? as u64,
        skid: row.get(1)?,
        cn: row.get(2)?,
        o: row.get(3)?,
        ou: row.get(4)?,
        c: row.get(5)?,
        not_before: row.get(6)?,
        not_after: row.get(7)?,
        status: CertStatus::from_i64(row.get(8)?).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(8, row.get::<_, i64>(8).unwrap_or(-1))
        })?,
        status_date: row.get(9)?,
    })
}
