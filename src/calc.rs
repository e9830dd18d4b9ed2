//! Grade calculation: scale conversions, resolution policies, the
//! calculator registry and the merge engine that reconciles calculated
//! grades with entered ones.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use crate::store::{
    self, AssignmentFilter, AssignmentOrigin, AssignmentRow, CourseRow, GradeFilter, GradeRow,
    GradeValue, Provenance, StoreError, StudentFilter,
};

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("no calculator registered for course {0}")]
    CalculatorNotFound(String),
    #[error("calculated output would overwrite entered grade {0}")]
    WouldAlterEntered(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

//
// letter scales
//
// (letter, value, exclusive max, inclusive min). The ranges cover the
// whole scale so every in-range number maps to exactly one letter.

const FOUR_POINT_SCALE: &[(&str, f64, f64, f64)] = &[
    ("A+", 4.2, 5.0, 4.2),
    ("A", 4.0, 4.2, 3.85),
    ("A-", 3.7, 3.85, 3.5),
    ("B+", 3.3, 3.5, 3.15),
    ("B", 3.0, 3.15, 2.85),
    ("B-", 2.7, 2.85, 2.5),
    ("C+", 2.3, 2.5, 2.15),
    ("C", 2.0, 2.15, 1.85),
    ("C-", 1.7, 1.85, 1.5),
    ("D+", 1.3, 1.5, 1.15),
    ("D", 1.0, 1.15, 0.85),
    ("D-", 0.7, 0.85, 0.3),
    ("F", 0.0, 0.3, -1.0),
];

const PERCENT_SCALE: &[(&str, f64, f64, f64)] = &[
    ("A+", 100.0, 200.0, 97.0),
    ("A", 95.0, 97.0, 94.0),
    ("A-", 92.0, 94.0, 90.0),
    ("B+", 88.0, 90.0, 87.0),
    ("B", 85.0, 87.0, 84.0),
    ("B-", 82.0, 84.0, 80.0),
    ("C+", 78.0, 80.0, 77.0),
    ("C", 75.0, 77.0, 74.0),
    ("C-", 72.0, 74.0, 70.0),
    ("D+", 68.0, 70.0, 67.0),
    ("D", 65.0, 67.0, 64.0),
    ("D-", 62.0, 64.0, 60.0),
    ("F", 58.0, 60.0, 0.0),
];

/// Letter used when a grade cannot be computed (missing data, off-scale
/// average).
pub const INCOMPLETE: &str = "I";

fn letter_to_number(letter: &str, scale: &[(&str, f64, f64, f64)]) -> Option<f64> {
    scale.iter().find(|(g, ..)| *g == letter).map(|(_, v, ..)| *v)
}

fn number_to_letter(n: f64, scale: &[(&'static str, f64, f64, f64)]) -> Option<&'static str> {
    scale
        .iter()
        .find(|(_, _, mx, mn)| *mn <= n && n < *mx)
        .map(|(g, ..)| *g)
}

pub fn letter_to_points(letter: &str) -> Option<f64> {
    letter_to_number(letter, FOUR_POINT_SCALE)
}

pub fn letter_to_percentage(letter: &str) -> Option<f64> {
    letter_to_number(letter, PERCENT_SCALE)
}

pub fn points_to_letter(points: f64) -> Option<&'static str> {
    number_to_letter(points, FOUR_POINT_SCALE)
}

pub fn percentage_to_letter(pct: f64) -> Option<&'static str> {
    number_to_letter(pct, PERCENT_SCALE)
}

pub fn unweighted_average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Weighted sum of values; weights are taken as-is, so callers normalize
/// first when the weights are not already fractions of one.
pub fn weighted_average(values: &[f64], weights: &[f64]) -> f64 {
    values.iter().zip(weights).map(|(v, w)| v * w).sum()
}

/// Turn raw point values into fractional weights that sum to one.
pub fn points_to_weights(point_values: &[f64]) -> Vec<f64> {
    let total: f64 = point_values.iter().sum();
    if total <= 0.0 {
        let n = point_values.len().max(1) as f64;
        return point_values.iter().map(|_| 1.0 / n).collect();
    }
    point_values.iter().map(|p| p / total).collect()
}

//
// multi-grade resolution
//

/// Which row counts as "the" grade when several share a (student,
/// assignment, provenance) key. The policy is always an explicit caller
/// choice; nothing in the store hard-codes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    #[default]
    MostRecent,
    HighestValue,
}

impl ResolutionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mostRecent" | "most_recent" => Some(ResolutionPolicy::MostRecent),
            "highestValue" | "highest_value" => Some(ResolutionPolicy::HighestValue),
            _ => None,
        }
    }
}

fn value_rank(value: &Option<GradeValue>) -> Option<f64> {
    match value {
        None => None,
        Some(GradeValue::Letter(l)) => letter_to_points(l),
        Some(v) => v.as_number(),
    }
}

fn beats(candidate: &GradeRow, incumbent: &GradeRow, policy: ResolutionPolicy) -> bool {
    match policy {
        // RFC 3339 UTC timestamps compare correctly as strings; the row
        // id breaks exact ties deterministically.
        ResolutionPolicy::MostRecent => {
            (candidate.recorded_at.as_str(), candidate.id.as_str())
                > (incumbent.recorded_at.as_str(), incumbent.id.as_str())
        }
        ResolutionPolicy::HighestValue => {
            let c = value_rank(&candidate.value);
            let i = value_rank(&incumbent.value);
            match (c, i) {
                (Some(a), Some(b)) if a != b => a > b,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                _ => beats(candidate, incumbent, ResolutionPolicy::MostRecent),
            }
        }
    }
}

/// Collapse a grade list to one row per (student, assignment, provenance)
/// under the given policy. Output order is deterministic.
pub fn resolve_grades(rows: Vec<GradeRow>, policy: ResolutionPolicy) -> Vec<GradeRow> {
    let mut best: BTreeMap<(String, String, &'static str), GradeRow> = BTreeMap::new();
    for row in rows {
        let key = (
            row.student_id.clone(),
            row.assignment_id.clone(),
            row.provenance.as_str(),
        );
        match best.get(&key) {
            Some(current) if !beats(&row, current, policy) => {}
            _ => {
                best.insert(key, row);
            }
        }
    }
    best.into_values().collect()
}

//
// calculator interface
//

/// Structured lookup key replacing identifier-based calculator naming:
/// course numbers keep their punctuation and the semester is matched
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CourseKey {
    number: String,
    semester: String,
    year: i64,
}

impl CourseKey {
    pub fn new(number: &str, semester: &str, year: i64) -> Self {
        Self {
            number: number.trim().to_string(),
            semester: semester.trim().to_ascii_lowercase(),
            year,
        }
    }

    pub fn for_course(course: &CourseRow) -> Self {
        Self::new(&course.number, &course.semester, course.year)
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.number, self.semester, self.year)
    }
}

/// One entered grade (or its absence) handed to a calculator. A missing
/// entered grade still produces an input with `value: None`; what to make
/// of the gap is the calculator's declared policy, never the engine's.
#[derive(Debug, Clone)]
pub struct EnteredGrade {
    pub grade_id: Option<String>,
    pub assignment_id: String,
    pub assignment_name: String,
    pub weight: Option<f64>,
    pub value: Option<GradeValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MissingPolicy {
    /// Stand in a letter grade for the gap (e.g. missing counts as F).
    Substitute(String),
    /// Leave the assignment out of the aggregate entirely.
    Skip,
    /// Any gap makes the final grade an Incomplete.
    Incomplete,
}

/// Where a calculated value should land.
#[derive(Debug, Clone)]
pub enum GradeTarget {
    /// Update this grade row in place.
    Grade(String),
    /// Create or update the calculated grade on this assignment.
    Assignment(String),
    /// Resolve the assignment by name within the course, creating it when
    /// absent.
    AssignmentNamed(String),
}

#[derive(Debug, Clone)]
pub struct GradeSpec {
    pub target: GradeTarget,
    pub value: GradeValue,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub weight: Option<f64>,
}

/// Calculator output, as an explicit tagged pair of shapes rather than
/// anything shape-sniffed at runtime.
#[derive(Debug, Clone)]
pub enum CalcOutput {
    /// Calculated-grade name to value; each key routes by name.
    Simple(BTreeMap<String, GradeValue>),
    /// Fully specified update/create instructions.
    Specs(Vec<GradeSpec>),
}

pub trait GradeCalculator: Send {
    fn name(&self) -> &'static str;
    fn calculate(&self, grades: &[EnteredGrade]) -> anyhow::Result<CalcOutput>;
}

#[derive(Default)]
pub struct CalculatorRegistry {
    entries: HashMap<CourseKey, Box<dyn GradeCalculator>>,
}

impl CalculatorRegistry {
    /// Register a calculator for a course key, replacing any previous one.
    pub fn register(&mut self, key: CourseKey, calculator: Box<dyn GradeCalculator>) {
        self.entries.insert(key, calculator);
    }

    pub fn lookup(&self, key: &CourseKey) -> Option<&dyn GradeCalculator> {
        self.entries.get(key).map(|c| c.as_ref())
    }

    pub fn registered(&self) -> Vec<(String, &'static str)> {
        let mut rows: Vec<(String, &'static str)> = self
            .entries
            .iter()
            .map(|(k, c)| (k.to_string(), c.name()))
            .collect();
        rows.sort();
        rows
    }
}

/// Instantiate one of the built-in calculators by its configured name.
pub fn builtin_calculator(
    kind: &str,
    missing: MissingPolicy,
) -> Option<Box<dyn GradeCalculator>> {
    match kind {
        "letter_average" => Some(Box::new(LetterAverage { missing })),
        "points_total" => Some(Box::new(PointsTotal { missing })),
        _ => None,
    }
}

//
// built-in calculators
//

const GRADE_AVERAGE_NAME: &str = "Grade average";
const COURSE_TOTAL_NAME: &str = "Course total";
const FINAL_GRADE_NAME: &str = "Final grade";

fn incomplete_output() -> CalcOutput {
    let mut out = BTreeMap::new();
    out.insert(
        FINAL_GRADE_NAME.to_string(),
        GradeValue::Letter(INCOMPLETE.to_string()),
    );
    CalcOutput::Simple(out)
}

/// Weighted 4-point average over entered letter grades, emitting the
/// average and the corresponding final letter grade. Weights are the
/// assignments' percent-of-grade weights, normalized; equal weighting
/// applies when no assignment carries one.
pub struct LetterAverage {
    pub missing: MissingPolicy,
}

impl GradeCalculator for LetterAverage {
    fn name(&self) -> &'static str {
        "letter_average"
    }

    fn calculate(&self, grades: &[EnteredGrade]) -> anyhow::Result<CalcOutput> {
        let mut points = Vec::new();
        let mut weights = Vec::new();
        for g in grades {
            let letter = match &g.value {
                Some(GradeValue::Letter(l)) => l.clone(),
                Some(other) => {
                    anyhow::bail!(
                        "assignment {:?} holds a {} grade, not a letter",
                        g.assignment_name,
                        other.grade_type().as_str()
                    )
                }
                None => match &self.missing {
                    MissingPolicy::Substitute(stand_in) => stand_in.clone(),
                    MissingPolicy::Skip => continue,
                    MissingPolicy::Incomplete => return Ok(incomplete_output()),
                },
            };
            let Some(p) = letter_to_points(&letter) else {
                anyhow::bail!("unknown letter grade {:?}", letter);
            };
            points.push(p);
            weights.push(g.weight.unwrap_or(0.0));
        }

        if points.is_empty() {
            return Ok(incomplete_output());
        }

        let avg = if weights.iter().any(|w| *w > 0.0) {
            weighted_average(&points, &points_to_weights(&weights))
        } else {
            unweighted_average(&points).unwrap_or(0.0)
        };
        let final_letter = points_to_letter(avg).unwrap_or(INCOMPLETE);

        let mut out = BTreeMap::new();
        out.insert(GRADE_AVERAGE_NAME.to_string(), GradeValue::FourPoint(avg));
        out.insert(
            FINAL_GRADE_NAME.to_string(),
            GradeValue::Letter(final_letter.to_string()),
        );
        Ok(CalcOutput::Simple(out))
    }
}

/// Sum of entered point scores against per-assignment possible points,
/// emitting the percentage earned and the corresponding letter grade.
pub struct PointsTotal {
    pub missing: MissingPolicy,
}

impl GradeCalculator for PointsTotal {
    fn name(&self) -> &'static str {
        "points_total"
    }

    fn calculate(&self, grades: &[EnteredGrade]) -> anyhow::Result<CalcOutput> {
        let mut earned = 0.0_f64;
        let mut possible = 0.0_f64;
        for g in grades {
            let assignment_possible = g.weight.unwrap_or(0.0);
            if assignment_possible <= 0.0 {
                anyhow::bail!(
                    "assignment {:?} has no possible-points weight",
                    g.assignment_name
                );
            }
            let score = match &g.value {
                Some(v) => match v.as_number() {
                    Some(n) => n,
                    None => anyhow::bail!(
                        "assignment {:?} holds a letter grade, not points",
                        g.assignment_name
                    ),
                },
                None => match &self.missing {
                    // A substituted gap counts as zero earned over full
                    // possible, whatever the stand-in letter is.
                    MissingPolicy::Substitute(_) => 0.0,
                    MissingPolicy::Skip => continue,
                    MissingPolicy::Incomplete => return Ok(incomplete_output()),
                },
            };
            earned += score;
            possible += assignment_possible;
        }

        if possible <= 0.0 {
            return Ok(incomplete_output());
        }

        let pct = 100.0 * earned / possible;
        let final_letter = percentage_to_letter(pct).unwrap_or(INCOMPLETE);

        let mut out = BTreeMap::new();
        out.insert(COURSE_TOTAL_NAME.to_string(), GradeValue::Percentage(pct));
        out.insert(
            FINAL_GRADE_NAME.to_string(),
            GradeValue::Letter(final_letter.to_string()),
        );
        Ok(CalcOutput::Simple(out))
    }
}

//
// the engine
//

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedStudent {
    pub student_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcRunReport {
    pub students: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: Vec<SkippedStudent>,
}

/// Run the registered calculator for one course and merge the results.
///
/// Per student the merge is transactional: either all of that student's
/// calculated grades land, or none do. A calculator failure for one
/// student is reported and skipped without touching the others; routing
/// and integrity failures abort the run.
pub fn run_course_calculation(
    conn: &Connection,
    registry: &CalculatorRegistry,
    course_id: &str,
    only_student: Option<&str>,
    policy: ResolutionPolicy,
) -> Result<CalcRunReport, CalcError> {
    let course = store::get_course(conn, course_id)?;
    let key = CourseKey::for_course(&course);
    let Some(calculator) = registry.lookup(&key) else {
        return Err(CalcError::CalculatorNotFound(key.to_string()));
    };

    let mut students = store::select_students(
        conn,
        &StudentFilter {
            course_id: Some(course_id.to_string()),
            ..Default::default()
        },
    )?;
    if let Some(only) = only_student {
        students.retain(|s| s.id == only);
        if students.is_empty() {
            return Err(StoreError::NoRecords("enrolled student").into());
        }
    }

    // Calculation input comes from entered-origin assignments only;
    // assignments auto-created to hold calculator output must not feed
    // back into the next run.
    let input_assignments = store::select_assignments(
        conn,
        &AssignmentFilter {
            course_id: Some(course_id.to_string()),
            origin: Some(AssignmentOrigin::Entered),
            ..Default::default()
        },
    )?;

    let entered = store::select_grades(
        conn,
        &GradeFilter {
            course_id: Some(course_id.to_string()),
            provenance: Some(Provenance::Entered),
            ..Default::default()
        },
    )?;
    let mut by_student: HashMap<String, Vec<GradeRow>> = HashMap::new();
    for row in resolve_grades(entered, policy) {
        by_student.entry(row.student_id.clone()).or_default().push(row);
    }

    let mut report = CalcRunReport::default();
    for student in &students {
        let inputs = assemble_inputs(
            &input_assignments,
            by_student.get(student.id.as_str()).map(Vec::as_slice),
        );
        let output = match calculator.calculate(&inputs) {
            Ok(o) => o,
            Err(e) => {
                report.skipped.push(SkippedStudent {
                    student_id: student.id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
        match merge_student_output(&tx, &course, &student.id, output) {
            Ok((created, updated)) => {
                tx.commit().map_err(StoreError::from)?;
                report.created += created;
                report.updated += updated;
                report.students += 1;
            }
            Err(e) => {
                let _ = tx.rollback();
                return Err(e);
            }
        }
    }
    Ok(report)
}

fn assemble_inputs(
    assignments: &[AssignmentRow],
    grades: Option<&[GradeRow]>,
) -> Vec<EnteredGrade> {
    let mut by_assignment: HashMap<&str, &GradeRow> = HashMap::new();
    for g in grades.unwrap_or_default() {
        by_assignment.insert(g.assignment_id.as_str(), g);
    }
    assignments
        .iter()
        .map(|a| match by_assignment.get(a.id.as_str()) {
            Some(g) => EnteredGrade {
                grade_id: Some(g.id.clone()),
                assignment_id: a.id.clone(),
                assignment_name: a.name.clone(),
                weight: a.weight,
                value: g.value.clone(),
            },
            None => EnteredGrade {
                grade_id: None,
                assignment_id: a.id.clone(),
                assignment_name: a.name.clone(),
                weight: a.weight,
                value: None,
            },
        })
        .collect()
}

fn merge_student_output(
    conn: &Connection,
    course: &CourseRow,
    student_id: &str,
    output: CalcOutput,
) -> Result<(usize, usize), CalcError> {
    let specs: Vec<GradeSpec> = match output {
        CalcOutput::Simple(map) => map
            .into_iter()
            .map(|(name, value)| GradeSpec {
                target: GradeTarget::AssignmentNamed(name),
                value,
                description: None,
                due_date: None,
                weight: None,
            })
            .collect(),
        CalcOutput::Specs(specs) => specs,
    };

    let mut created = 0;
    let mut updated = 0;
    for spec in specs {
        match spec.target {
            GradeTarget::Grade(grade_id) => {
                let row = store::get_grade(conn, &grade_id)?;
                if row.provenance == Provenance::Entered {
                    return Err(CalcError::WouldAlterEntered(grade_id));
                }
                store::update_grade_value(conn, &grade_id, &spec.value)?;
                updated += 1;
            }
            GradeTarget::Assignment(assignment_id) => {
                let assignment = store::get_assignment(conn, &assignment_id)?;
                if assignment.course_id != course.id {
                    return Err(StoreError::ReferentialIntegrity(format!(
                        "assignment {} belongs to another course",
                        assignment_id
                    ))
                    .into());
                }
                upsert_calculated(conn, &assignment_id, student_id, &spec.value,
                    &mut created, &mut updated)?;
            }
            GradeTarget::AssignmentNamed(name) => {
                let matches = store::select_assignments(
                    conn,
                    &AssignmentFilter {
                        course_id: Some(course.id.clone()),
                        name: Some(name.clone()),
                        ..Default::default()
                    },
                )?;
                let assignment_id = match matches.len() {
                    0 => {
                        store::insert_assignment(
                            conn,
                            &course.id,
                            &name,
                            Some("(assignment for calculated grade)"),
                            spec.due_date.as_deref(),
                            spec.weight,
                            AssignmentOrigin::Calculated,
                        )?
                        .id
                    }
                    1 => matches.into_iter().next().map(|a| a.id).unwrap_or_default(),
                    _ => return Err(StoreError::Ambiguous("assignment").into()),
                };
                upsert_calculated(conn, &assignment_id, student_id, &spec.value,
                    &mut created, &mut updated)?;
            }
        }
    }
    Ok((created, updated))
}

/// Update the existing calculated row for (assignment, student) in place,
/// or insert one. Row identity is stable across re-runs; entered rows on
/// the same assignment are never touched.
fn upsert_calculated(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
    value: &GradeValue,
    created: &mut usize,
    updated: &mut usize,
) -> Result<(), CalcError> {
    let existing = store::select_grades(
        conn,
        &GradeFilter {
            student_id: Some(student_id.to_string()),
            assignment_id: Some(assignment_id.to_string()),
            provenance: Some(Provenance::Calculated),
            ..Default::default()
        },
    )?;
    match existing.len() {
        0 => {
            store::insert_grade(conn, assignment_id, student_id, value, Provenance::Calculated)?;
            *created += 1;
        }
        1 => {
            store::update_grade_value(conn, &existing[0].id, value)?;
            *updated += 1;
        }
        // The partial unique index makes this unreachable; surface it
        // rather than pick a row if the store was mangled externally.
        _ => return Err(StoreError::Ambiguous("calculated grade").into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::{GradeType, WeightScheme};

    #[test]
    fn four_point_scale_round_trips() {
        assert_eq!(letter_to_points("B"), Some(3.0));
        assert_eq!(letter_to_points("A+"), Some(4.2));
        assert_eq!(letter_to_points("Z"), None);
        assert_eq!(points_to_letter(3.0), Some("B"));
        assert_eq!(points_to_letter(1.5), Some("C-"));
        assert_eq!(points_to_letter(0.0), Some("F"));
        assert_eq!(points_to_letter(9.9), None);
    }

    #[test]
    fn percent_scale_maps_boundaries() {
        assert_eq!(percentage_to_letter(97.0), Some("A+"));
        assert_eq!(percentage_to_letter(86.9), Some("B"));
        assert_eq!(percentage_to_letter(0.0), Some("F"));
        assert_eq!(letter_to_percentage("C"), Some(75.0));
    }

    #[test]
    fn weights_normalize_to_fractions() {
        let w = points_to_weights(&[100.0, 100.0]);
        assert_eq!(w, vec![0.5, 0.5]);
        let avg = weighted_average(&[4.0, 2.0], &w);
        assert!((avg - 3.0).abs() < 1e-9);
    }

    fn row(id: &str, recorded_at: &str, value: Option<GradeValue>) -> GradeRow {
        GradeRow {
            id: id.to_string(),
            student_id: "s1".to_string(),
            course_id: "c1".to_string(),
            assignment_id: "a1".to_string(),
            assignment_name: "Paper 1".to_string(),
            grade_type: value
                .as_ref()
                .map(|v| v.grade_type())
                .unwrap_or(GradeType::Letter),
            value,
            provenance: Provenance::Entered,
            recorded_at: recorded_at.to_string(),
        }
    }

    #[test]
    fn most_recent_policy_picks_latest_row() {
        let rows = vec![
            row("g1", "2013-09-01T00:00:00+00:00", Some(GradeValue::Letter("C".into()))),
            row("g2", "2013-10-01T00:00:00+00:00", Some(GradeValue::Letter("B".into()))),
        ];
        let resolved = resolve_grades(rows, ResolutionPolicy::MostRecent);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "g2");
    }

    #[test]
    fn highest_value_policy_ranks_letters_on_the_point_scale() {
        let rows = vec![
            row("g1", "2013-09-01T00:00:00+00:00", Some(GradeValue::Letter("A".into()))),
            row("g2", "2013-10-01T00:00:00+00:00", Some(GradeValue::Letter("B".into()))),
        ];
        let resolved = resolve_grades(rows, ResolutionPolicy::HighestValue);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "g1");
    }

    fn entered(name: &str, weight: Option<f64>, value: Option<GradeValue>) -> EnteredGrade {
        EnteredGrade {
            grade_id: value.as_ref().map(|_| format!("g-{}", name)),
            assignment_id: format!("a-{}", name),
            assignment_name: name.to_string(),
            weight,
            value,
        }
    }

    #[test]
    fn letter_average_weighs_and_converts() {
        let calc = LetterAverage {
            missing: MissingPolicy::Substitute("F".to_string()),
        };
        let out = calc
            .calculate(&[
                entered("Paper 1", Some(75.0), Some(GradeValue::Letter("A".into()))),
                entered("Paper 2", Some(25.0), Some(GradeValue::Letter("C".into()))),
            ])
            .expect("calculate");
        let CalcOutput::Simple(map) = out else {
            panic!("expected simple output");
        };
        assert_eq!(map[FINAL_GRADE_NAME], GradeValue::Letter("A-".to_string()));
        let GradeValue::FourPoint(avg) = map[GRADE_AVERAGE_NAME].clone() else {
            panic!("expected four-point average");
        };
        assert!((avg - 3.5).abs() < 1e-9);
    }

    #[test]
    fn letter_average_applies_declared_missing_policy() {
        let substitute = LetterAverage {
            missing: MissingPolicy::Substitute("F".to_string()),
        };
        let out = substitute
            .calculate(&[
                entered("Paper 1", Some(50.0), Some(GradeValue::Letter("B".into()))),
                entered("Paper 2", Some(50.0), None),
            ])
            .expect("calculate");
        let CalcOutput::Simple(map) = out else {
            panic!("expected simple output");
        };
        let GradeValue::FourPoint(avg) = map[GRADE_AVERAGE_NAME].clone() else {
            panic!("expected four-point average");
        };
        assert!((avg - 1.5).abs() < 1e-9);
        assert_eq!(map[FINAL_GRADE_NAME], GradeValue::Letter("C-".to_string()));

        let incomplete = LetterAverage {
            missing: MissingPolicy::Incomplete,
        };
        let out = incomplete
            .calculate(&[
                entered("Paper 1", Some(50.0), Some(GradeValue::Letter("B".into()))),
                entered("Paper 2", Some(50.0), None),
            ])
            .expect("calculate");
        let CalcOutput::Simple(map) = out else {
            panic!("expected simple output");
        };
        assert_eq!(map[FINAL_GRADE_NAME], GradeValue::Letter("I".to_string()));
        assert!(!map.contains_key(GRADE_AVERAGE_NAME));
    }

    #[test]
    fn points_total_counts_substituted_gaps_as_zero() {
        let calc = PointsTotal {
            missing: MissingPolicy::Substitute("F".to_string()),
        };
        let out = calc
            .calculate(&[
                entered("HW1", Some(100.0), Some(GradeValue::Points(90.0))),
                entered("HW2", Some(100.0), None),
            ])
            .expect("calculate");
        let CalcOutput::Simple(map) = out else {
            panic!("expected simple output");
        };
        let GradeValue::Percentage(pct) = map[COURSE_TOTAL_NAME].clone() else {
            panic!("expected percentage");
        };
        assert!((pct - 45.0).abs() < 1e-9);
        assert_eq!(map[FINAL_GRADE_NAME], GradeValue::Letter("F".to_string()));
    }

    fn engine_fixture(conn: &Connection) -> (CourseRow, String, CalculatorRegistry) {
        let course = store::insert_course(conn, "12A", "Intro to Logic", "Fall", 2013,
            WeightScheme::PercentOfGrade).expect("course");
        let student = store::insert_student(conn, "Ada", "Lovelace", "98765432", None)
            .expect("student");
        store::enroll_student(conn, &course.id, &student.id).expect("enroll");
        let assignment = store::insert_assignment(conn, &course.id, "Paper 1", None, None,
            Some(100.0), AssignmentOrigin::Entered).expect("assignment");
        store::insert_grade(conn, &assignment.id, &student.id,
            &GradeValue::Letter("B".to_string()), Provenance::Entered).expect("grade");

        let mut registry = CalculatorRegistry::default();
        registry.register(
            CourseKey::new("12A", "Fall", 2013),
            builtin_calculator("letter_average", MissingPolicy::Substitute("F".to_string()))
                .expect("builtin"),
        );
        (course, student.id, registry)
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute("PRAGMA foreign_keys = ON", []).expect("pragma");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    #[test]
    fn rerun_keeps_calculated_row_identities_and_entered_rows() {
        let conn = test_conn();
        let (course, student_id, registry) = engine_fixture(&conn);

        let first = run_course_calculation(&conn, &registry, &course.id, None,
            ResolutionPolicy::MostRecent).expect("first run");
        assert_eq!(first.created, 2);
        assert_eq!(first.updated, 0);

        let snapshot = |conn: &Connection, prov: Provenance| {
            let mut rows = store::select_grades(conn, &GradeFilter {
                student_id: Some(student_id.clone()),
                provenance: Some(prov),
                ..Default::default()
            }).expect("select");
            rows.sort_by(|a, b| a.assignment_name.cmp(&b.assignment_name));
            rows.into_iter().map(|g| (g.id, g.assignment_name, g.value)).collect::<Vec<_>>()
        };

        let calculated_once = snapshot(&conn, Provenance::Calculated);
        assert_eq!(calculated_once.len(), 2);
        let entered_once = snapshot(&conn, Provenance::Entered);

        for _ in 0..2 {
            let rerun = run_course_calculation(&conn, &registry, &course.id, None,
                ResolutionPolicy::MostRecent).expect("rerun");
            assert_eq!(rerun.created, 0);
            assert_eq!(rerun.updated, 2);
        }

        assert_eq!(snapshot(&conn, Provenance::Calculated), calculated_once);
        assert_eq!(snapshot(&conn, Provenance::Entered), entered_once);
    }

    #[test]
    fn unregistered_course_reports_calculator_not_found() {
        let conn = test_conn();
        let (course, _, _) = engine_fixture(&conn);
        let empty = CalculatorRegistry::default();
        let err = run_course_calculation(&conn, &empty, &course.id, None,
            ResolutionPolicy::MostRecent).expect_err("must fail");
        assert!(matches!(err, CalcError::CalculatorNotFound(_)));
    }

    #[test]
    fn spec_targeting_entered_grade_is_refused() {
        let conn = test_conn();
        let (course, student_id, _) = engine_fixture(&conn);
        let entered_rows = store::select_grades(&conn, &GradeFilter {
            student_id: Some(student_id.clone()),
            provenance: Some(Provenance::Entered),
            ..Default::default()
        }).expect("select");
        let entered_id = entered_rows[0].id.clone();

        struct Overwriter {
            target: String,
        }
        impl GradeCalculator for Overwriter {
            fn name(&self) -> &'static str {
                "overwriter"
            }
            fn calculate(&self, _grades: &[EnteredGrade]) -> anyhow::Result<CalcOutput> {
                Ok(CalcOutput::Specs(vec![GradeSpec {
                    target: GradeTarget::Grade(self.target.clone()),
                    value: GradeValue::Letter("A+".to_string()),
                    description: None,
                    due_date: None,
                    weight: None,
                }]))
            }
        }

        let mut registry = CalculatorRegistry::default();
        registry.register(
            CourseKey::new("12A", "Fall", 2013),
            Box::new(Overwriter { target: entered_id.clone() }),
        );
        let err = run_course_calculation(&conn, &registry, &course.id, None,
            ResolutionPolicy::MostRecent).expect_err("must refuse");
        assert!(matches!(err, CalcError::WouldAlterEntered(_)));

        // The entered row is untouched.
        let after = store::get_grade(&conn, &entered_id).expect("entered row");
        assert_eq!(after.value, Some(GradeValue::Letter("B".to_string())));
    }

    #[test]
    fn missing_entered_grade_reaches_calculator_not_an_error() {
        let conn = test_conn();
        let (course, student_id, registry) = engine_fixture(&conn);
        // Second assignment with no grade for the student.
        store::insert_assignment(&conn, &course.id, "Paper 2", None, None,
            Some(100.0), AssignmentOrigin::Entered).expect("assignment");

        let report = run_course_calculation(&conn, &registry, &course.id, None,
            ResolutionPolicy::MostRecent).expect("run");
        assert!(report.skipped.is_empty());

        let calculated = store::select_grades(&conn, &GradeFilter {
            student_id: Some(student_id),
            provenance: Some(Provenance::Calculated),
            ..Default::default()
        }).expect("select");
        let avg = calculated
            .iter()
            .find(|g| g.assignment_name == GRADE_AVERAGE_NAME)
            .expect("average row");
        // B (3.0) and the substituted F (0.0) at equal weight.
        assert_eq!(avg.value, Some(GradeValue::FourPoint(1.5)));
    }
}
