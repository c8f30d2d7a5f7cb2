use crate::db;
use crate::grading::{
    aggregate_marks, competition_rank, GradeScale, GradingError, RankEntry, SubjectMarks, Term,
};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

pub const GRADE_SCALE_KEY: &str = "grading.scale";

/// Ranking and publishing operate on one (class, academic year, term) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub class_id: String,
    pub academic_year: String,
    pub term: Term,
}

impl Scope {
    pub fn new(class_id: &str, academic_year: &str, term: Term) -> Result<Self, GradingError> {
        let class_id = class_id.trim();
        let academic_year = academic_year.trim();
        if class_id.is_empty() {
            return Err(GradingError::validation("classId must not be empty"));
        }
        if academic_year.is_empty() {
            return Err(GradingError::validation("academicYear must not be empty"));
        }
        Ok(Self {
            class_id: class_id.to_string(),
            academic_year: academic_year.to_string(),
            term,
        })
    }

    fn log_fields(&self) -> serde_json::Value {
        json!({
            "classId": self.class_id,
            "academicYear": self.academic_year,
            "term": self.term.as_str(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub student_id: String,
    pub scope: Scope,
    pub subject_marks: Vec<SubjectMarks>,
    pub entered_by: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResultRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_code: String,
    pub ca1: f64,
    pub ca2: f64,
    pub exam: f64,
    pub total: f64,
    pub grade: String,
    pub remark: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub academic_year: String,
    pub term: Term,
    pub total_score: f64,
    pub average_score: f64,
    pub overall_grade: String,
    pub position: Option<i64>,
    pub total_students: Option<i64>,
    pub remarks: Option<String>,
    pub entered_by: String,
    pub entered_at: String,
    pub updated_at: Option<String>,
    pub published: bool,
    pub published_at: Option<String>,
    pub subjects: Vec<SubjectResultRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankSummary {
    pub ranked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishSummary {
    pub published: usize,
    pub already_published: usize,
    pub total_students: usize,
    pub ranked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegradeSummary {
    pub results: usize,
    pub subject_results: usize,
}

const RESULT_SELECT: &str = "SELECT r.id, r.student_id, st.last_name || ', ' || st.first_name,
       r.class_id, r.academic_year, r.term, r.total_score, r.average_score, r.overall_grade,
       r.position, r.total_students, r.remarks, r.entered_by, r.entered_at, r.updated_at,
       r.published, r.published_at
     FROM results r
     JOIN students st ON st.id = r.student_id";

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// IMMEDIATE takes the write lock up front so a read-then-write sequence sees no
// interleaved writers.
fn begin_write(conn: &Connection) -> Result<Transaction<'_>, GradingError> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| GradingError::storage(format!("begin transaction: {}", e)))
}

fn result_from_row(r: &Row<'_>) -> rusqlite::Result<StoredResult> {
    let term_raw: String = r.get(5)?;
    let term = Term::parse(&term_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StoredResult {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_id: r.get(3)?,
        academic_year: r.get(4)?,
        term,
        total_score: r.get(6)?,
        average_score: r.get(7)?,
        overall_grade: r.get(8)?,
        position: r.get(9)?,
        total_students: r.get(10)?,
        remarks: r.get(11)?,
        entered_by: r.get(12)?,
        entered_at: r.get(13)?,
        updated_at: r.get(14)?,
        published: r.get::<_, i64>(15)? != 0,
        published_at: r.get(16)?,
        subjects: Vec::new(),
    })
}

fn load_subject_rows(
    conn: &Connection,
    result_id: &str,
) -> Result<Vec<SubjectResultRow>, GradingError> {
    let mut stmt = conn.prepare(
        "SELECT sr.id, sr.subject_id, s.name, s.code, sr.ca1, sr.ca2, sr.exam, sr.total,
                sr.grade, sr.remark
         FROM subject_results sr
         JOIN subjects s ON s.id = sr.subject_id
         WHERE sr.result_id = ?
         ORDER BY s.code",
    )?;
    let rows = stmt
        .query_map([result_id], |r| {
            Ok(SubjectResultRow {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                subject_code: r.get(3)?,
                ca1: r.get(4)?,
                ca2: r.get(5)?,
                exam: r.get(6)?,
                total: r.get(7)?,
                grade: r.get(8)?,
                remark: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_result(conn: &Connection, result_id: &str) -> Result<Option<StoredResult>, GradingError> {
    let sql = format!("{} WHERE r.id = ?", RESULT_SELECT);
    let found = conn
        .query_row(&sql, [result_id], result_from_row)
        .optional()?;
    let Some(mut result) = found else {
        return Ok(None);
    };
    result.subjects = load_subject_rows(conn, &result.id)?;
    Ok(Some(result))
}

/// Workspace grade scale, or the canonical table when none is stored or the
/// stored value no longer validates.
pub fn load_grade_scale(conn: &Connection) -> GradeScale {
    match db::settings_get_json(conn, GRADE_SCALE_KEY) {
        Ok(Some(raw)) => match GradeScale::from_json(&raw) {
            Ok(scale) => scale,
            Err(e) => {
                log::warn!(
                    "grading.scale_invalid {}",
                    json!({ "message": e.message, "fallback": "canonical" }),
                );
                GradeScale::canonical()
            }
        },
        Ok(None) => GradeScale::canonical(),
        Err(e) => {
            log::warn!(
                "grading.scale_unreadable {}",
                json!({ "message": e.to_string(), "fallback": "canonical" }),
            );
            GradeScale::canonical()
        }
    }
}

fn exists(conn: &Connection, sql: &str, params: &[&str]) -> Result<bool, GradingError> {
    let found = conn
        .query_row(sql, rusqlite::params_from_iter(params.iter()), |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, GradingError> {
    exists(conn, "SELECT 1 FROM classes WHERE id = ?", &[class_id])
}

fn ensure_class(conn: &Connection, class_id: &str) -> Result<(), GradingError> {
    if !class_exists(conn, class_id)? {
        return Err(GradingError::not_found("class not found")
            .with_details(json!({ "classId": class_id })));
    }
    Ok(())
}

fn ensure_references(conn: &Connection, sub: &Submission) -> Result<(), GradingError> {
    ensure_class(conn, &sub.scope.class_id)?;

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&sub.student_id],
            |r| r.get(0),
        )
        .optional()?;
    match student_class {
        None => {
            return Err(GradingError::not_found("student not found")
                .with_details(json!({ "studentId": sub.student_id })));
        }
        Some(c) if c != sub.scope.class_id => {
            return Err(GradingError::not_found("student not found in class").with_details(
                json!({ "studentId": sub.student_id, "classId": sub.scope.class_id }),
            ));
        }
        Some(_) => {}
    }

    for m in &sub.subject_marks {
        if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &[m.subject_id.as_str()])? {
            return Err(GradingError::not_found("subject not found")
                .with_details(json!({ "subjectId": m.subject_id })));
        }
    }
    Ok(())
}

/// Upserts the Result for the submission's natural key and replaces its whole
/// subject set. Publish state of an existing Result is carried over unchanged.
pub fn submit_results(
    conn: &Connection,
    sub: &Submission,
    scale: &GradeScale,
) -> Result<StoredResult, GradingError> {
    let entered_by = sub.entered_by.trim();
    if entered_by.is_empty() {
        return Err(GradingError::validation("enteredBy must not be empty"));
    }
    let agg = aggregate_marks(&sub.subject_marks, scale)?;

    let tx = begin_write(conn)?;
    ensure_references(&tx, sub)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND class_id = ? AND academic_year = ? AND term = ?",
            (
                &sub.student_id,
                &sub.scope.class_id,
                &sub.scope.academic_year,
                sub.scope.term.as_str(),
            ),
            |r| r.get(0),
        )
        .optional()?;

    let now = now_rfc3339();
    let result_id = match existing {
        Some(id) => {
            // Averages changed, so any previous position is stale until the scope is re-ranked.
            tx.execute(
                "UPDATE results SET
                   total_score = ?,
                   average_score = ?,
                   overall_grade = ?,
                   position = NULL,
                   total_students = NULL,
                   remarks = COALESCE(?, remarks),
                   entered_by = ?,
                   updated_at = ?
                 WHERE id = ?",
                (
                    agg.total_score,
                    agg.average_score,
                    &agg.overall_grade,
                    &sub.remarks,
                    entered_by,
                    &now,
                    &id,
                ),
            )?;
            tx.execute("DELETE FROM subject_results WHERE result_id = ?", [&id])?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO results(
                   id, student_id, class_id, academic_year, term,
                   total_score, average_score, overall_grade,
                   remarks, entered_by, entered_at, updated_at, published
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                rusqlite::params![
                    &id,
                    &sub.student_id,
                    &sub.scope.class_id,
                    &sub.scope.academic_year,
                    sub.scope.term.as_str(),
                    agg.total_score,
                    agg.average_score,
                    &agg.overall_grade,
                    &sub.remarks,
                    entered_by,
                    &now,
                    &now,
                ],
            )?;
            id
        }
    };

    for s in &agg.subjects {
        tx.execute(
            "INSERT INTO subject_results(id, result_id, subject_id, ca1, ca2, exam, total, grade, remark)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &result_id,
                &s.subject_id,
                s.score.ca1,
                s.score.ca2,
                s.score.exam,
                s.score.total,
                &s.score.grade,
                &s.score.remark,
            ],
        )?;
    }

    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    let stored = load_result(conn, &result_id)?.ok_or_else(|| {
        GradingError::storage("result vanished after commit")
            .with_details(json!({ "resultId": result_id }))
    })?;

    let mut fields = sub.scope.log_fields();
    fields["resultId"] = json!(stored.id);
    fields["studentId"] = json!(stored.student_id);
    fields["subjects"] = json!(stored.subjects.len());
    fields["averageScore"] = json!(stored.average_score);
    fields["published"] = json!(stored.published);
    log::info!("results.submit {}", fields);

    Ok(stored)
}

fn rank_scope(conn: &Connection, scope: &Scope) -> Result<usize, GradingError> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, average_score
         FROM results
         WHERE class_id = ? AND academic_year = ? AND term = ?",
    )?;
    let entries = stmt
        .query_map(
            (&scope.class_id, &scope.academic_year, scope.term.as_str()),
            |r| {
                Ok(RankEntry {
                    result_id: r.get(0)?,
                    student_id: r.get(1)?,
                    average_score: r.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let total = entries.len();
    for ranked in competition_rank(entries) {
        log::debug!(
            "results.rank_assigned {}",
            json!({
                "studentId": ranked.student_id,
                "averageScore": ranked.average_score,
                "position": ranked.position
            }),
        );
        conn.execute(
            "UPDATE results SET position = ?, total_students = ? WHERE id = ?",
            (ranked.position, total as i64, &ranked.result_id),
        )?;
    }
    Ok(total)
}

/// Assigns competition-ranked positions across the scope. A scope with no
/// Results is a no-op.
pub fn rank_class(conn: &Connection, scope: &Scope) -> Result<RankSummary, GradingError> {
    ensure_class(conn, &scope.class_id)?;
    let tx = begin_write(conn)?;
    let ranked = rank_scope(&tx, scope)?;
    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    let mut fields = scope.log_fields();
    fields["ranked"] = json!(ranked);
    log::info!("results.rank_class {}", fields);
    Ok(RankSummary { ranked })
}

/// Draft to published. Publishing twice is rejected rather than ignored.
pub fn publish_result(conn: &Connection, result_id: &str) -> Result<StoredResult, GradingError> {
    let tx = begin_write(conn)?;
    let row: Option<(i64, Option<String>)> = tx
        .query_row(
            "SELECT published, published_at FROM results WHERE id = ?",
            [result_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => {
            return Err(GradingError::not_found("result not found")
                .with_details(json!({ "resultId": result_id })));
        }
        Some((published, published_at)) if published != 0 => {
            return Err(GradingError::invalid_state("result already published")
                .with_details(json!({ "resultId": result_id, "publishedAt": published_at })));
        }
        Some(_) => {}
    }

    tx.execute(
        "UPDATE results SET published = 1, published_at = ? WHERE id = ?",
        (now_rfc3339(), result_id),
    )?;
    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    let stored = load_result(conn, result_id)?.ok_or_else(|| {
        GradingError::storage("result vanished after commit")
            .with_details(json!({ "resultId": result_id }))
    })?;
    log::info!(
        "results.publish {}",
        json!({ "resultId": stored.id, "publishedAt": stored.published_at }),
    );
    Ok(stored)
}

/// Ranks the scope when its positions are missing or stale, then publishes
/// every draft in it. Already-published rows keep their original publishedAt.
pub fn publish_class_results(
    conn: &Connection,
    scope: &Scope,
) -> Result<PublishSummary, GradingError> {
    ensure_class(conn, &scope.class_id)?;
    let tx = begin_write(conn)?;

    let (total, unranked, min_total, max_total): (i64, i64, Option<i64>, Option<i64>) = tx
        .query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN position IS NULL THEN 1 ELSE 0 END), 0),
                    MIN(total_students),
                    MAX(total_students)
             FROM results
             WHERE class_id = ? AND academic_year = ? AND term = ?",
            (&scope.class_id, &scope.academic_year, scope.term.as_str()),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;

    let stale = unranked > 0 || min_total != Some(total) || max_total != Some(total);
    let ranked = total > 0 && stale;
    if ranked {
        rank_scope(&tx, scope)?;
    }

    let published = tx.execute(
        "UPDATE results SET published = 1, published_at = ?
         WHERE class_id = ? AND academic_year = ? AND term = ? AND published = 0",
        (
            now_rfc3339(),
            &scope.class_id,
            &scope.academic_year,
            scope.term.as_str(),
        ),
    )?;
    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    let total = total as usize;
    let summary = PublishSummary {
        published,
        already_published: total - published,
        total_students: total,
        ranked,
    };
    let mut fields = scope.log_fields();
    fields["published"] = json!(summary.published);
    fields["alreadyPublished"] = json!(summary.already_published);
    fields["ranked"] = json!(summary.ranked);
    log::info!("results.publish_class {}", fields);
    Ok(summary)
}

/// A student's Result for a year/term. Non-privileged callers only ever see
/// published Results; a draft reads as not found. With several classes in the
/// same term, the most recently updated Result wins unless `class_id` narrows it.
pub fn get_student_result(
    conn: &Connection,
    student_id: &str,
    academic_year: &str,
    term: Term,
    class_id: Option<&str>,
    privileged: bool,
) -> Result<StoredResult, GradingError> {
    let mut sql = format!(
        "{} WHERE r.student_id = ?1 AND r.academic_year = ?2 AND r.term = ?3",
        RESULT_SELECT
    );
    if class_id.is_some() {
        sql.push_str(" AND r.class_id = ?4");
    }
    if !privileged {
        sql.push_str(" AND r.published = 1");
    }
    sql.push_str(" ORDER BY COALESCE(r.updated_at, r.entered_at) DESC LIMIT 1");

    let academic_year = academic_year.trim();
    let found = match class_id {
        Some(c) => conn
            .query_row(
                &sql,
                (student_id, academic_year, term.as_str(), c),
                result_from_row,
            )
            .optional()?,
        None => conn
            .query_row(&sql, (student_id, academic_year, term.as_str()), result_from_row)
            .optional()?,
    };
    let Some(mut result) = found else {
        let message = if privileged {
            "result not found"
        } else {
            "result not found or not yet published"
        };
        return Err(GradingError::not_found(message).with_details(json!({
            "studentId": student_id,
            "academicYear": academic_year,
            "term": term.as_str(),
        })));
    };
    result.subjects = load_subject_rows(conn, &result.id)?;
    Ok(result)
}

/// Class broadsheet: ranked rows first by position, unranked rows after, each
/// group by student name.
pub fn list_class_results(
    conn: &Connection,
    scope: &Scope,
    privileged: bool,
) -> Result<Vec<StoredResult>, GradingError> {
    ensure_class(conn, &scope.class_id)?;
    let mut sql = format!(
        "{} WHERE r.class_id = ? AND r.academic_year = ? AND r.term = ?",
        RESULT_SELECT
    );
    if !privileged {
        sql.push_str(" AND r.published = 1");
    }
    sql.push_str(
        " ORDER BY r.position IS NULL, r.position, st.last_name, st.first_name, r.student_id",
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(
            (&scope.class_id, &scope.academic_year, scope.term.as_str()),
            result_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows.iter_mut() {
        row.subjects = load_subject_rows(conn, &row.id)?;
    }
    Ok(rows)
}

/// Removes a draft Result and its subject rows. Published Results are final.
pub fn delete_result(conn: &Connection, result_id: &str) -> Result<(), GradingError> {
    let tx = begin_write(conn)?;
    let published: Option<i64> = tx
        .query_row(
            "SELECT published FROM results WHERE id = ?",
            [result_id],
            |r| r.get(0),
        )
        .optional()?;
    match published {
        None => {
            return Err(GradingError::not_found("result not found")
                .with_details(json!({ "resultId": result_id })));
        }
        Some(p) if p != 0 => {
            return Err(GradingError::invalid_state("published results cannot be deleted")
                .with_details(json!({ "resultId": result_id })));
        }
        Some(_) => {}
    }

    // Explicit child delete first; the FK cascade covers connections without foreign_keys on.
    tx.execute("DELETE FROM subject_results WHERE result_id = ?", [result_id])?;
    tx.execute("DELETE FROM results WHERE id = ?", [result_id])?;
    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    log::info!("results.delete {}", json!({ "resultId": result_id }));
    Ok(())
}

fn regrade_stored(tx: &Connection, scale: &GradeScale) -> Result<RegradeSummary, GradingError> {
    let subject_rows = {
        let mut stmt = tx.prepare("SELECT id, total FROM subject_results")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (id, total) in &subject_rows {
        let band = scale.resolve(*total)?;
        tx.execute(
            "UPDATE subject_results SET grade = ?, remark = ? WHERE id = ?",
            (&band.grade, &band.remark, id),
        )?;
    }

    let result_rows = {
        let mut stmt = tx.prepare("SELECT id, average_score FROM results")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (id, average) in &result_rows {
        let band = scale.resolve(*average)?;
        tx.execute(
            "UPDATE results SET overall_grade = ? WHERE id = ?",
            (&band.grade, id),
        )?;
    }

    Ok(RegradeSummary {
        results: result_rows.len(),
        subject_results: subject_rows.len(),
    })
}

/// Stores (or, with `None`, clears) the workspace grade scale and regrades
/// every stored Result under it in the same transaction, so no two rows are
/// ever graded against different tables. Scores and positions are untouched.
pub fn apply_grade_scale(
    conn: &Connection,
    custom: Option<&GradeScale>,
) -> Result<RegradeSummary, GradingError> {
    let storage = |e: anyhow::Error| GradingError::storage(format!("{e:#}"));
    let canonical = GradeScale::canonical();

    let tx = begin_write(conn)?;
    let scale = match custom {
        Some(scale) => {
            db::settings_set_json(&tx, GRADE_SCALE_KEY, &json!(scale.bands())).map_err(storage)?;
            scale
        }
        None => {
            db::settings_delete(&tx, GRADE_SCALE_KEY).map_err(storage)?;
            &canonical
        }
    };
    let summary = regrade_stored(&tx, scale)?;
    tx.commit()
        .map_err(|e| GradingError::storage(format!("commit: {}", e)))?;

    log::info!(
        "results.regrade {}",
        json!({
            "custom": custom.is_some(),
            "bands": scale.bands().len(),
            "results": summary.results,
            "subjectResults": summary.subject_results
        }),
    );
    Ok(summary)
}
