use rusqlite::Connection;
use std::path::Path;

/// Open (or create) the grade database at the given file path and make
/// sure the schema is present. The path comes from the caller's
/// configuration; this process never picks a location on its own.
pub fn open_db(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            sid TEXT NOT NULL UNIQUE,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            number TEXT NOT NULL,
            name TEXT NOT NULL,
            semester TEXT NOT NULL,
            year INTEGER NOT NULL,
            weight_scheme TEXT NOT NULL DEFAULT 'percent_of_grade',
            UNIQUE(number, semester, year)
        )",
        [],
    )?;
    // Databases created before weight_scheme existed get the column added.
    ensure_courses_weight_scheme(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            UNIQUE(course_id, student_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            due_date TEXT,
            weight REAL,
            origin TEXT NOT NULL DEFAULT 'entered',
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    ensure_assignments_origin(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;

    // grades.value carries no declared type on purpose: letter grades are
    // stored as text, numeric grades as numbers. Decoding goes through
    // store::GradeValue::decode, which keeps a stored zero a zero instead
    // of folding it into "absent".
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            grade_type TEXT NOT NULL,
            value,
            provenance TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_assignment ON grades(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    // Entered grades may accumulate history per (assignment, student);
    // calculated grades may not, or re-runs would duplicate rows.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grades_calculated_pair
         ON grades(assignment_id, student_id) WHERE provenance = 'calculated'",
        [],
    )?;

    Ok(())
}

fn ensure_courses_weight_scheme(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "courses", "weight_scheme")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE courses ADD COLUMN weight_scheme TEXT NOT NULL DEFAULT 'percent_of_grade'",
        [],
    )?;
    Ok(())
}

fn ensure_assignments_origin(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assignments", "origin")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE assignments ADD COLUMN origin TEXT NOT NULL DEFAULT 'entered'",
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
