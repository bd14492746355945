use std::path::Path;

use rusqlite::{Connection, OpenFlags};

/// Run and upload databases are written by one orchestrator and read by the
/// CLI concurrently, hence WAL with a busy timeout.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// Opens `path` with `flags`, tuning the connection unless it is read-only.
pub fn open_connection(path: &Path, flags: OpenFlags) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(path, flags)?;
    if !flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
        configure_connection(&conn)?;
    }
    Ok(conn)
}

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
