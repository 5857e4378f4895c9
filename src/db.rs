use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::Connection;

use crate::detect::{ExistingRecord, RosterSnapshot};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("roster.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    // name_key columns carry the canonical comparison form so candidate
    // lookups never depend on how a name was typed in an upload.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            student_no TEXT,
            birth_date TEXT,
            email TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, student_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_name_key ON students(class_id, name_key)",
        [],
    )?;

    Ok(())
}

/// Class keys currently known to the roster, for step-2 row validation.
pub fn class_keys(conn: &Connection) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name_key FROM classes")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(keys)
}

/// One consistent point-in-time view of the stored roster, grouped by
/// class key. Loaded once per detection pass; the detector itself never
/// touches the database.
pub fn roster_snapshot(conn: &Connection) -> anyhow::Result<RosterSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.name_key, c.name_key, s.student_no, s.birth_date, s.email
         FROM students s
         JOIN classes c ON c.id = s.class_id
         ORDER BY s.id",
    )?;
    let records = stmt
        .query_map([], |row| {
            Ok(ExistingRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                name_key: row.get(2)?,
                class_key: row.get(3)?,
                student_no: row.get(4)?,
                birth_date: row.get(5)?,
                email: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut snapshot: RosterSnapshot = HashMap::new();
    for record in records {
        snapshot
            .entry(record.class_key.clone())
            .or_default()
            .push(record);
    }
    Ok(snapshot)
}

/// class key → class id, for resolving row class groups at commit time.
pub fn class_ids_by_key(conn: &Connection) -> anyhow::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT name_key, id FROM classes")?;
    let map = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(map)
}
