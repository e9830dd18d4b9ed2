//! Typed repository over the grade database.
//!
//! Every operation returns named-field row structs, never positional
//! tuples, so callers are insulated from column order. Mutations that
//! touch more than one table run inside a single transaction.

use chrono::{NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),
    #[error("no {0} matches the given criteria")]
    NoRecords(&'static str),
    #[error("multiple {0} rows match where a unique one was expected")]
    Ambiguous(&'static str),
    #[error("invalid grade value: {0}")]
    BadGradeValue(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Ensure a result set holds exactly one row and return it.
pub fn ensure_unique<T>(mut rows: Vec<T>, entity: &'static str) -> Result<T, StoreError> {
    match rows.len() {
        0 => Err(StoreError::NoRecords(entity)),
        1 => Ok(rows.remove(0)),
        _ => Err(StoreError::Ambiguous(entity)),
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn map_constraint(e: rusqlite::Error, what: &str) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::ReferentialIntegrity(format!("{}: {}", what, e))
        }
        _ => StoreError::Db(e),
    }
}

//
// value domain
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeType {
    Letter,
    FourPoint,
    Points,
    Percentage,
}

impl GradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeType::Letter => "letter",
            GradeType::FourPoint => "four_point",
            GradeType::Points => "points",
            GradeType::Percentage => "percentage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "letter" => Some(GradeType::Letter),
            "four_point" => Some(GradeType::FourPoint),
            "points" => Some(GradeType::Points),
            "percentage" => Some(GradeType::Percentage),
            _ => None,
        }
    }
}

/// A grade value tagged with its type. Letter grades live as text in the
/// store; everything else as a number.
#[derive(Debug, Clone, PartialEq)]
pub enum GradeValue {
    Letter(String),
    FourPoint(f64),
    Points(f64),
    Percentage(f64),
}

impl GradeValue {
    pub fn grade_type(&self) -> GradeType {
        match self {
            GradeValue::Letter(_) => GradeType::Letter,
            GradeValue::FourPoint(_) => GradeType::FourPoint,
            GradeValue::Points(_) => GradeType::Points,
            GradeValue::Percentage(_) => GradeType::Percentage,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            GradeValue::Letter(_) => None,
            GradeValue::FourPoint(n) | GradeValue::Points(n) | GradeValue::Percentage(n) => {
                Some(*n)
            }
        }
    }

    pub fn as_letter(&self) -> Option<&str> {
        match self {
            GradeValue::Letter(s) => Some(s),
            _ => None,
        }
    }

    pub fn from_number(grade_type: GradeType, n: f64) -> Result<Self, StoreError> {
        match grade_type {
            GradeType::Letter => Err(StoreError::BadGradeValue(
                "letter grade stored as a number".to_string(),
            )),
            GradeType::FourPoint => Ok(GradeValue::FourPoint(n)),
            GradeType::Points => Ok(GradeValue::Points(n)),
            GradeType::Percentage => Ok(GradeValue::Percentage(n)),
        }
    }

    /// Decode a stored value. Only SQL NULL means "no value": a literal
    /// zero must come back as a zero grade, so the storage classes are
    /// matched explicitly rather than going through any truthiness check.
    pub fn decode(grade_type: GradeType, raw: &SqlValue) -> Result<Option<Self>, StoreError> {
        match raw {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(n) => Self::from_number(grade_type, *n as f64).map(Some),
            SqlValue::Real(n) => Self::from_number(grade_type, *n).map(Some),
            SqlValue::Text(s) => match grade_type {
                GradeType::Letter => Ok(Some(GradeValue::Letter(s.clone()))),
                _ => match s.trim().parse::<f64>() {
                    Ok(n) => Self::from_number(grade_type, n).map(Some),
                    Err(_) => Err(StoreError::BadGradeValue(format!(
                        "non-numeric text {:?} for {} grade",
                        s,
                        grade_type.as_str()
                    ))),
                },
            },
            SqlValue::Blob(_) => Err(StoreError::BadGradeValue(
                "binary value in grade row".to_string(),
            )),
        }
    }

    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            GradeValue::Letter(s) => SqlValue::Text(s.clone()),
            GradeValue::FourPoint(n) | GradeValue::Points(n) | GradeValue::Percentage(n) => {
                SqlValue::Real(*n)
            }
        }
    }
}

impl Serialize for GradeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GradeValue::Letter(s) => serializer.serialize_str(s),
            GradeValue::FourPoint(n) | GradeValue::Points(n) | GradeValue::Percentage(n) => {
                serializer.serialize_f64(*n)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Entered,
    Calculated,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Entered => "entered",
            Provenance::Calculated => "calculated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entered" => Some(Provenance::Entered),
            "calculated" => Some(Provenance::Calculated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOrigin {
    Entered,
    Calculated,
}

impl AssignmentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentOrigin::Entered => "entered",
            AssignmentOrigin::Calculated => "calculated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entered" => Some(AssignmentOrigin::Entered),
            "calculated" => Some(AssignmentOrigin::Calculated),
            _ => None,
        }
    }
}

/// Course-wide interpretation of assignment weight. Mixing the two inside
/// one course is unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheme {
    PercentOfGrade,
    PossiblePoints,
}

impl WeightScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightScheme::PercentOfGrade => "percent_of_grade",
            WeightScheme::PossiblePoints => "possible_points",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percent_of_grade" => Some(WeightScheme::PercentOfGrade),
            "possible_points" => Some(WeightScheme::PossiblePoints),
            _ => None,
        }
    }
}

//
// rows
//

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub sid: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRow {
    pub id: String,
    pub number: String,
    pub name: String,
    pub semester: String,
    pub year: i64,
    pub weight_scheme: WeightScheme,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRow {
    pub id: String,
    pub course_id: String,
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub weight: Option<f64>,
    pub origin: AssignmentOrigin,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub assignment_name: String,
    pub grade_type: GradeType,
    pub value: Option<GradeValue>,
    pub provenance: Provenance,
    pub recorded_at: String,
}

//
// filters
//

#[derive(Debug, Default, Clone)]
pub struct StudentFilter {
    pub student_id: Option<String>,
    pub sid: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub fuzzy: bool,
}

#[derive(Debug, Default, Clone)]
pub struct CourseFilter {
    pub course_id: Option<String>,
    pub number: Option<String>,
    pub name: Option<String>,
    pub semester: Option<String>,
    pub year: Option<i64>,
    pub student_id: Option<String>,
    pub fuzzy: bool,
}

#[derive(Debug, Default, Clone)]
pub struct EnrollmentFilter {
    pub enrollment_id: Option<String>,
    pub course_id: Option<String>,
    pub student_id: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct AssignmentFilter {
    pub assignment_id: Option<String>,
    pub course_id: Option<String>,
    pub name: Option<String>,
    pub origin: Option<AssignmentOrigin>,
    pub fuzzy: bool,
}

#[derive(Debug, Default, Clone)]
pub struct GradeFilter {
    pub grade_id: Option<String>,
    pub student_id: Option<String>,
    pub course_id: Option<String>,
    pub assignment_id: Option<String>,
    pub provenance: Option<Provenance>,
}

fn push_eq(clauses: &mut Vec<String>, binds: &mut Vec<SqlValue>, column: &str, value: Option<&str>) {
    if let Some(v) = value {
        clauses.push(format!("{} = ?", column));
        binds.push(SqlValue::Text(v.to_string()));
    }
}

fn push_eq_i64(
    clauses: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
    column: &str,
    value: Option<i64>,
) {
    if let Some(v) = value {
        clauses.push(format!("{} = ?", column));
        binds.push(SqlValue::Integer(v));
    }
}

fn push_like(
    clauses: &mut Vec<String>,
    binds: &mut Vec<SqlValue>,
    column: &str,
    value: Option<&str>,
) {
    if let Some(v) = value {
        clauses.push(format!("{} LIKE ?", column));
        binds.push(SqlValue::Text(format!("%{}%", v)));
    }
}

fn finish_query(base: &str, clauses: Vec<String>, order: &str) -> String {
    if clauses.is_empty() {
        format!("{} ORDER BY {}", base, order)
    } else {
        format!("{} WHERE {} ORDER BY {}", base, clauses.join(" AND "), order)
    }
}

//
// students
//

pub fn select_students(
    conn: &Connection,
    filter: &StudentFilter,
) -> Result<Vec<StudentRow>, StoreError> {
    let course_scoped = filter.course_id.is_some() || filter.course_name.is_some();
    // Join through enrollments only when a course constraint narrows the
    // result. An unconstrained join yields one row per enrollment, which
    // duplicates students enrolled in several courses.
    let base = if course_scoped {
        "SELECT DISTINCT s.id, s.first_name, s.last_name, s.sid, s.email
         FROM students s
         JOIN enrollments e ON e.student_id = s.id
         JOIN courses c ON c.id = e.course_id"
    } else {
        "SELECT s.id, s.first_name, s.last_name, s.sid, s.email FROM students s"
    };

    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    push_eq(&mut clauses, &mut binds, "s.id", filter.student_id.as_deref());
    push_eq(&mut clauses, &mut binds, "s.sid", filter.sid.as_deref());
    push_eq(&mut clauses, &mut binds, "c.id", filter.course_id.as_deref());
    if filter.fuzzy {
        push_like(&mut clauses, &mut binds, "s.last_name", filter.last_name.as_deref());
        push_like(&mut clauses, &mut binds, "s.first_name", filter.first_name.as_deref());
        push_like(&mut clauses, &mut binds, "s.email", filter.email.as_deref());
        push_like(&mut clauses, &mut binds, "c.name", filter.course_name.as_deref());
    } else {
        push_eq(&mut clauses, &mut binds, "s.last_name", filter.last_name.as_deref());
        push_eq(&mut clauses, &mut binds, "s.first_name", filter.first_name.as_deref());
        push_eq(&mut clauses, &mut binds, "s.email", filter.email.as_deref());
        push_eq(&mut clauses, &mut binds, "c.name", filter.course_name.as_deref());
    }

    let sql = finish_query(base, clauses, "s.last_name, s.first_name, s.id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                sid: r.get(3)?,
                email: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_student(conn: &Connection, student_id: &str) -> Result<StudentRow, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, first_name, last_name, sid, email FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(StudentRow {
                    id: r.get(0)?,
                    first_name: r.get(1)?,
                    last_name: r.get(2)?,
                    sid: r.get(3)?,
                    email: r.get(4)?,
                })
            },
        )
        .optional()?;
    row.ok_or(StoreError::NoRecords("student"))
}

pub fn insert_student(
    conn: &Connection,
    first_name: &str,
    last_name: &str,
    sid: &str,
    email: Option<&str>,
) -> Result<StudentRow, StoreError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, first_name, last_name, sid, email) VALUES(?, ?, ?, ?, ?)",
        (&id, first_name, last_name, sid, email),
    )
    .map_err(|e| map_constraint(e, "duplicate institutional id"))?;
    Ok(StudentRow {
        id,
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        sid: sid.to_string(),
        email: email.map(str::to_string),
    })
}

#[derive(Debug, Default, Clone)]
pub struct StudentUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub sid: Option<String>,
    pub email: Option<String>,
}

/// Overlay the provided fields on the stored row; absent fields keep
/// their existing values.
pub fn update_student(
    conn: &Connection,
    student_id: &str,
    update: &StudentUpdate,
) -> Result<StudentRow, StoreError> {
    let current = get_student(conn, student_id)?;
    let merged = StudentRow {
        id: current.id,
        first_name: update.first_name.clone().unwrap_or(current.first_name),
        last_name: update.last_name.clone().unwrap_or(current.last_name),
        sid: update.sid.clone().unwrap_or(current.sid),
        email: update.email.clone().or(current.email),
    };
    conn.execute(
        "UPDATE students SET first_name = ?, last_name = ?, sid = ?, email = ? WHERE id = ?",
        (
            &merged.first_name,
            &merged.last_name,
            &merged.sid,
            &merged.email,
            student_id,
        ),
    )
    .map_err(|e| map_constraint(e, "duplicate institutional id"))?;
    Ok(merged)
}

pub fn delete_student(conn: &Connection, student_id: &str) -> Result<(), StoreError> {
    get_student(conn, student_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grades WHERE student_id = ?", [student_id])?;
    tx.execute("DELETE FROM enrollments WHERE student_id = ?", [student_id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [student_id])?;
    tx.commit()?;
    Ok(())
}

//
// courses
//

fn course_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(CourseRow, String)> {
    let scheme: String = r.get(5)?;
    Ok((
        CourseRow {
            id: r.get(0)?,
            number: r.get(1)?,
            name: r.get(2)?,
            semester: r.get(3)?,
            year: r.get(4)?,
            weight_scheme: WeightScheme::PercentOfGrade,
        },
        scheme,
    ))
}

fn decode_course(pair: (CourseRow, String)) -> Result<CourseRow, StoreError> {
    let (mut row, scheme) = pair;
    row.weight_scheme = WeightScheme::parse(&scheme)
        .ok_or_else(|| StoreError::BadGradeValue(format!("unknown weight scheme {:?}", scheme)))?;
    Ok(row)
}

pub fn select_courses(
    conn: &Connection,
    filter: &CourseFilter,
) -> Result<Vec<CourseRow>, StoreError> {
    // As with students: no join unless a student constraint requires one.
    let base = if filter.student_id.is_some() {
        "SELECT DISTINCT c.id, c.number, c.name, c.semester, c.year, c.weight_scheme
         FROM courses c
         JOIN enrollments e ON e.course_id = c.id"
    } else {
        "SELECT c.id, c.number, c.name, c.semester, c.year, c.weight_scheme FROM courses c"
    };

    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    push_eq(&mut clauses, &mut binds, "c.id", filter.course_id.as_deref());
    push_eq(&mut clauses, &mut binds, "c.number", filter.number.as_deref());
    push_eq(&mut clauses, &mut binds, "c.semester", filter.semester.as_deref());
    push_eq_i64(&mut clauses, &mut binds, "c.year", filter.year);
    push_eq(&mut clauses, &mut binds, "e.student_id", filter.student_id.as_deref());
    if filter.fuzzy {
        push_like(&mut clauses, &mut binds, "c.name", filter.name.as_deref());
    } else {
        push_eq(&mut clauses, &mut binds, "c.name", filter.name.as_deref());
    }

    let sql = finish_query(base, clauses, "c.year, c.semester, c.number");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), course_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_course).collect()
}

pub fn get_course(conn: &Connection, course_id: &str) -> Result<CourseRow, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, number, name, semester, year, weight_scheme FROM courses WHERE id = ?",
            [course_id],
            course_from_row,
        )
        .optional()?;
    row.map(decode_course)
        .transpose()?
        .ok_or(StoreError::NoRecords("course"))
}

pub fn insert_course(
    conn: &Connection,
    number: &str,
    name: &str,
    semester: &str,
    year: i64,
    weight_scheme: WeightScheme,
) -> Result<CourseRow, StoreError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, number, name, semester, year, weight_scheme)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, number, name, semester, year, weight_scheme.as_str()),
    )
    .map_err(|e| map_constraint(e, "duplicate course for number/semester/year"))?;
    Ok(CourseRow {
        id,
        number: number.to_string(),
        name: name.to_string(),
        semester: semester.to_string(),
        year,
        weight_scheme,
    })
}

#[derive(Debug, Default, Clone)]
pub struct CourseUpdate {
    pub number: Option<String>,
    pub name: Option<String>,
    pub semester: Option<String>,
    pub year: Option<i64>,
    pub weight_scheme: Option<WeightScheme>,
}

pub fn update_course(
    conn: &Connection,
    course_id: &str,
    update: &CourseUpdate,
) -> Result<CourseRow, StoreError> {
    let current = get_course(conn, course_id)?;
    let merged = CourseRow {
        id: current.id,
        number: update.number.clone().unwrap_or(current.number),
        name: update.name.clone().unwrap_or(current.name),
        semester: update.semester.clone().unwrap_or(current.semester),
        year: update.year.unwrap_or(current.year),
        weight_scheme: update.weight_scheme.unwrap_or(current.weight_scheme),
    };
    conn.execute(
        "UPDATE courses SET number = ?, name = ?, semester = ?, year = ?, weight_scheme = ?
         WHERE id = ?",
        (
            &merged.number,
            &merged.name,
            &merged.semester,
            merged.year,
            merged.weight_scheme.as_str(),
            course_id,
        ),
    )
    .map_err(|e| map_constraint(e, "duplicate course for number/semester/year"))?;
    Ok(merged)
}

/// Delete a course and everything that hangs off it: its grades, its
/// assignments and its enrollments. Students themselves are untouched,
/// as are their enrollments and grades in other courses.
pub fn delete_course(conn: &Connection, course_id: &str) -> Result<(), StoreError> {
    get_course(conn, course_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM grades
         WHERE assignment_id IN (SELECT id FROM assignments WHERE course_id = ?)",
        [course_id],
    )?;
    tx.execute("DELETE FROM assignments WHERE course_id = ?", [course_id])?;
    tx.execute("DELETE FROM enrollments WHERE course_id = ?", [course_id])?;
    tx.execute("DELETE FROM courses WHERE id = ?", [course_id])?;
    tx.commit()?;
    Ok(())
}

//
// enrollments
//

pub fn select_enrollments(
    conn: &Connection,
    filter: &EnrollmentFilter,
) -> Result<Vec<EnrollmentRow>, StoreError> {
    let base = "SELECT id, course_id, student_id FROM enrollments";
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    push_eq(&mut clauses, &mut binds, "id", filter.enrollment_id.as_deref());
    push_eq(&mut clauses, &mut binds, "course_id", filter.course_id.as_deref());
    push_eq(&mut clauses, &mut binds, "student_id", filter.student_id.as_deref());

    let sql = finish_query(base, clauses, "course_id, student_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(EnrollmentRow {
                id: r.get(0)?,
                course_id: r.get(1)?,
                student_id: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn is_enrolled(conn: &Connection, course_id: &str, student_id: &str) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Enroll a student in a course. Re-enrolling is a no-op that returns the
/// existing row.
pub fn enroll_student(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<EnrollmentRow, StoreError> {
    get_course(conn, course_id)?;
    get_student(conn, student_id)?;

    let existing = select_enrollments(
        conn,
        &EnrollmentFilter {
            course_id: Some(course_id.to_string()),
            student_id: Some(student_id.to_string()),
            ..Default::default()
        },
    )?;
    if let Some(row) = existing.into_iter().next() {
        return Ok(row);
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO enrollments(id, course_id, student_id) VALUES(?, ?, ?)",
        (&id, course_id, student_id),
    )?;
    Ok(EnrollmentRow {
        id,
        course_id: course_id.to_string(),
        student_id: student_id.to_string(),
    })
}

/// Remove an enrollment. Refuses while the student still has grades in
/// the course; dropping those rows silently would lose recorded work.
pub fn withdraw_student(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<(), StoreError> {
    if !is_enrolled(conn, course_id, student_id)? {
        return Err(StoreError::NoRecords("enrollment"));
    }
    let grade_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM grades g
         JOIN assignments a ON a.id = g.assignment_id
         WHERE a.course_id = ? AND g.student_id = ?",
        (course_id, student_id),
        |r| r.get(0),
    )?;
    if grade_count > 0 {
        return Err(StoreError::ReferentialIntegrity(format!(
            "student still has {} grade(s) in this course; delete them first",
            grade_count
        )));
    }
    conn.execute(
        "DELETE FROM enrollments WHERE course_id = ? AND student_id = ?",
        (course_id, student_id),
    )?;
    Ok(())
}

//
// assignments
//

fn assignment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(AssignmentRow, String)> {
    let origin: String = r.get(6)?;
    Ok((
        AssignmentRow {
            id: r.get(0)?,
            course_id: r.get(1)?,
            name: r.get(2)?,
            description: r.get(3)?,
            due_date: r.get(4)?,
            weight: r.get(5)?,
            origin: AssignmentOrigin::Entered,
        },
        origin,
    ))
}

fn decode_assignment(pair: (AssignmentRow, String)) -> Result<AssignmentRow, StoreError> {
    let (mut row, origin) = pair;
    row.origin = AssignmentOrigin::parse(&origin)
        .ok_or_else(|| StoreError::BadGradeValue(format!("unknown assignment origin {:?}", origin)))?;
    Ok(row)
}

pub fn select_assignments(
    conn: &Connection,
    filter: &AssignmentFilter,
) -> Result<Vec<AssignmentRow>, StoreError> {
    let base = "SELECT id, course_id, name, description, due_date, weight, origin FROM assignments";
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    push_eq(&mut clauses, &mut binds, "id", filter.assignment_id.as_deref());
    push_eq(&mut clauses, &mut binds, "course_id", filter.course_id.as_deref());
    push_eq(
        &mut clauses,
        &mut binds,
        "origin",
        filter.origin.map(|o| o.as_str()),
    );
    if filter.fuzzy {
        push_like(&mut clauses, &mut binds, "name", filter.name.as_deref());
    } else {
        push_eq(&mut clauses, &mut binds, "name", filter.name.as_deref());
    }

    let sql = finish_query(base, clauses, "due_date IS NULL, due_date, name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), assignment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_assignment).collect()
}

pub fn get_assignment(conn: &Connection, assignment_id: &str) -> Result<AssignmentRow, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, course_id, name, description, due_date, weight, origin
             FROM assignments WHERE id = ?",
            [assignment_id],
            assignment_from_row,
        )
        .optional()?;
    row.map(decode_assignment)
        .transpose()?
        .ok_or(StoreError::NoRecords("assignment"))
}

fn validate_due_date(due_date: Option<&str>) -> Result<(), StoreError> {
    if let Some(d) = due_date {
        NaiveDate::parse_from_str(d, "%Y-%m-%d").map_err(|_| {
            StoreError::BadGradeValue(format!("due date {:?} is not an ISO date", d))
        })?;
    }
    Ok(())
}

pub fn insert_assignment(
    conn: &Connection,
    course_id: &str,
    name: &str,
    description: Option<&str>,
    due_date: Option<&str>,
    weight: Option<f64>,
    origin: AssignmentOrigin,
) -> Result<AssignmentRow, StoreError> {
    get_course(conn, course_id)?;
    validate_due_date(due_date)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(id, course_id, name, description, due_date, weight, origin)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, course_id, name, description, due_date, weight, origin.as_str()),
    )?;
    Ok(AssignmentRow {
        id,
        course_id: course_id.to_string(),
        name: name.to_string(),
        description: description.map(str::to_string),
        due_date: due_date.map(str::to_string),
        weight,
        origin,
    })
}

#[derive(Debug, Default, Clone)]
pub struct AssignmentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub weight: Option<f64>,
}

pub fn update_assignment(
    conn: &Connection,
    assignment_id: &str,
    update: &AssignmentUpdate,
) -> Result<AssignmentRow, StoreError> {
    let current = get_assignment(conn, assignment_id)?;
    validate_due_date(update.due_date.as_deref())?;
    let merged = AssignmentRow {
        id: current.id,
        course_id: current.course_id,
        name: update.name.clone().unwrap_or(current.name),
        description: update.description.clone().or(current.description),
        due_date: update.due_date.clone().or(current.due_date),
        weight: update.weight.or(current.weight),
        origin: current.origin,
    };
    conn.execute(
        "UPDATE assignments SET name = ?, description = ?, due_date = ?, weight = ? WHERE id = ?",
        (
            &merged.name,
            &merged.description,
            &merged.due_date,
            merged.weight,
            assignment_id,
        ),
    )?;
    Ok(merged)
}

pub fn delete_assignment(conn: &Connection, assignment_id: &str) -> Result<(), StoreError> {
    get_assignment(conn, assignment_id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grades WHERE assignment_id = ?", [assignment_id])?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [assignment_id])?;
    tx.commit()?;
    Ok(())
}

//
// grades
//

pub fn select_grades(
    conn: &Connection,
    filter: &GradeFilter,
) -> Result<Vec<GradeRow>, StoreError> {
    let base = "SELECT g.id, g.student_id, a.course_id, g.assignment_id, a.name,
                       g.grade_type, g.value, g.provenance, g.recorded_at
                FROM grades g
                JOIN assignments a ON a.id = g.assignment_id";
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    push_eq(&mut clauses, &mut binds, "g.id", filter.grade_id.as_deref());
    push_eq(&mut clauses, &mut binds, "g.student_id", filter.student_id.as_deref());
    push_eq(&mut clauses, &mut binds, "a.course_id", filter.course_id.as_deref());
    push_eq(&mut clauses, &mut binds, "g.assignment_id", filter.assignment_id.as_deref());
    push_eq(
        &mut clauses,
        &mut binds,
        "g.provenance",
        filter.provenance.map(|p| p.as_str()),
    );

    let sql = finish_query(base, clauses, "a.name, g.recorded_at, g.id");
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(binds), |r| {
            let grade_type: String = r.get(5)?;
            let value: SqlValue = r.get(6)?;
            let provenance: String = r.get(7)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                grade_type,
                value,
                provenance,
                r.get::<_, String>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, student_id, course_id, assignment_id, assignment_name, gt, value, prov, recorded_at)| {
            let grade_type = GradeType::parse(&gt)
                .ok_or_else(|| StoreError::BadGradeValue(format!("unknown grade type {:?}", gt)))?;
            let provenance = Provenance::parse(&prov)
                .ok_or_else(|| StoreError::BadGradeValue(format!("unknown provenance {:?}", prov)))?;
            Ok(GradeRow {
                id,
                student_id,
                course_id,
                assignment_id,
                assignment_name,
                grade_type,
                value: GradeValue::decode(grade_type, &value)?,
                provenance,
                recorded_at,
            })
        })
        .collect()
}

pub fn get_grade(conn: &Connection, grade_id: &str) -> Result<GradeRow, StoreError> {
    let rows = select_grades(
        conn,
        &GradeFilter {
            grade_id: Some(grade_id.to_string()),
            ..Default::default()
        },
    )?;
    ensure_unique(rows, "grade")
}

/// Insert a grade row. The student must be enrolled in the assignment's
/// course; a grade for an unenrolled student is an integrity violation,
/// not a quiet insert.
pub fn insert_grade(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
    value: &GradeValue,
    provenance: Provenance,
) -> Result<GradeRow, StoreError> {
    let assignment = get_assignment(conn, assignment_id)?;
    get_student(conn, student_id)?;
    if !is_enrolled(conn, &assignment.course_id, student_id)? {
        return Err(StoreError::ReferentialIntegrity(
            "student is not enrolled in the assignment's course".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let recorded_at = now_timestamp();
    let grade_type = value.grade_type();
    conn.execute(
        "INSERT INTO grades(id, assignment_id, student_id, grade_type, value, provenance, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            assignment_id,
            student_id,
            grade_type.as_str(),
            value.to_sql_value(),
            provenance.as_str(),
            &recorded_at,
        ),
    )
    .map_err(|e| map_constraint(e, "calculated grade already exists for this pair"))?;

    Ok(GradeRow {
        id,
        student_id: student_id.to_string(),
        course_id: assignment.course_id,
        assignment_id: assignment_id.to_string(),
        assignment_name: assignment.name,
        grade_type,
        value: Some(value.clone()),
        provenance,
        recorded_at,
    })
}

/// Replace a grade's value in place, refreshing its timestamp. The row
/// identity is preserved; provenance never changes here.
pub fn update_grade_value(
    conn: &Connection,
    grade_id: &str,
    value: &GradeValue,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE grades SET grade_type = ?, value = ?, recorded_at = ? WHERE id = ?",
        (
            value.grade_type().as_str(),
            value.to_sql_value(),
            now_timestamp(),
            grade_id,
        ),
    )?;
    if changed == 0 {
        return Err(StoreError::NoRecords("grade"));
    }
    Ok(())
}

pub fn delete_grade(conn: &Connection, grade_id: &str) -> Result<(), StoreError> {
    let changed = conn.execute("DELETE FROM grades WHERE id = ?", [grade_id])?;
    if changed == 0 {
        return Err(StoreError::NoRecords("grade"));
    }
    Ok(())
}
