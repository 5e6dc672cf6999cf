use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "resultportal.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            gr_number TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            standard TEXT NOT NULL,
            roll_no TEXT,
            guardian_name TEXT,
            phone TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_standard ON students(standard, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_gr ON students(gr_number)",
        [],
    )?;

    // Guardian contact columns arrived after the first workspaces shipped.
    ensure_students_guardian_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            subject TEXT,
            phone TEXT,
            is_admin INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            exam_name TEXT NOT NULL,
            exam_date TEXT,
            published INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(created_by) REFERENCES teachers(id),
            UNIQUE(student_id, exam_name)
        )",
        [],
    )?;
    ensure_results_published(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_exam ON results(exam_name)",
        [],
    )?;

    // Only raw per-subject marks are stored. Totals, percentage, and grade
    // are recomputed on every read so they can never go stale.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subjects(
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            name TEXT NOT NULL,
            obtained_marks REAL NOT NULL,
            max_marks REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(result_id) REFERENCES results(id),
            UNIQUE(result_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_subjects_result ON result_subjects(result_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_days_date ON attendance_days(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            description TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_holidays_start ON holidays(start_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_slots(
            id TEXT PRIMARY KEY,
            standard TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            period INTEGER NOT NULL,
            subject TEXT NOT NULL,
            teacher_id TEXT,
            start_time TEXT,
            end_time TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(standard, day_of_week, period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_standard ON timetable_slots(standard, day_of_week, period)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_guardian_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "guardian_name")? {
        conn.execute("ALTER TABLE students ADD COLUMN guardian_name TEXT", [])?;
    }
    if !table_has_column(conn, "students", "phone")? {
        conn.execute("ALTER TABLE students ADD COLUMN phone TEXT", [])?;
    }
    Ok(())
}

fn ensure_results_published(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "published")? {
        return Ok(());
    }
    // Results written before the publish gate existed were already visible.
    conn.execute(
        "ALTER TABLE results ADD COLUMN published INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
