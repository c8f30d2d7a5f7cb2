use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

pub const CA_MAX: f64 = 20.0;
pub const EXAM_MAX: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    Storage,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Storage => "storage_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradingError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl fmt::Display for GradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for GradingError {}

impl From<rusqlite::Error> for GradingError {
    fn from(e: rusqlite::Error) -> Self {
        GradingError::storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Term {
    First,
    Second,
    Third,
}

impl Term {
    pub fn parse(raw: &str) -> Result<Self, GradingError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Term::First),
            "second" => Ok(Term::Second),
            "third" => Ok(Term::Third),
            _ => Err(
                GradingError::validation("malformed term: expected first, second or third")
                    .with_details(json!({ "term": raw })),
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Term::First => "first",
            Term::Second => "second",
            Term::Third => "third",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_score: f64,
    pub grade: String,
    pub remark: String,
}

/// Ordered band table used for both subject and overall grades.
///
/// Bands are stored with strictly descending `min_score` and the last band
/// starting at 0, so every score in `[0, 100]` resolves to exactly one band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeScale {
    bands: Vec<GradeBand>,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self::canonical()
    }
}

impl GradeScale {
    pub fn canonical() -> Self {
        let table: [(f64, &str, &str); 7] = [
            (90.0, "A+", "Outstanding"),
            (80.0, "A", "Excellent"),
            (70.0, "B+", "Very Good"),
            (60.0, "B", "Good"),
            (50.0, "C", "Fair"),
            (40.0, "D", "Pass"),
            (0.0, "F", "Needs Improvement"),
        ];
        Self {
            bands: table
                .iter()
                .map(|(min, grade, remark)| GradeBand {
                    min_score: *min,
                    grade: grade.to_string(),
                    remark: remark.to_string(),
                })
                .collect(),
        }
    }

    pub fn from_bands(bands: Vec<GradeBand>) -> Result<Self, GradingError> {
        if bands.is_empty() {
            return Err(GradingError::validation("grade scale must have at least one band"));
        }
        for (i, band) in bands.iter().enumerate() {
            if !band.min_score.is_finite() || band.min_score < 0.0 || band.min_score > 100.0 {
                return Err(
                    GradingError::validation("band minScore must be within 0..=100")
                        .with_details(json!({ "index": i, "minScore": band.min_score })),
                );
            }
            if band.grade.trim().is_empty() {
                return Err(GradingError::validation("band grade must not be empty")
                    .with_details(json!({ "index": i })));
            }
            if i > 0 && band.min_score >= bands[i - 1].min_score {
                return Err(
                    GradingError::validation("band minScore values must be strictly descending")
                        .with_details(json!({ "index": i, "minScore": band.min_score })),
                );
            }
        }
        if bands.last().map(|b| b.min_score) != Some(0.0) {
            return Err(GradingError::validation("lowest band must start at 0"));
        }
        Ok(Self { bands })
    }

    pub fn from_json(raw: &serde_json::Value) -> Result<Self, GradingError> {
        let bands: Vec<GradeBand> = serde_json::from_value(raw.clone()).map_err(|e| {
            GradingError::validation(format!(
                "grade scale must be an array of {{minScore, grade, remark}}: {}",
                e
            ))
        })?;
        Self::from_bands(bands)
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    /// Maps a score in `[0, 100]` to its band. Out-of-range input is an error,
    /// never clamped.
    pub fn resolve(&self, score: f64) -> Result<&GradeBand, GradingError> {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(GradingError::validation("score must be within 0..=100")
                .with_details(json!({ "score": score })));
        }
        self.bands
            .iter()
            .find(|b| score >= b.min_score)
            .ok_or_else(|| {
                GradingError::validation("score is below the lowest grade band")
                    .with_details(json!({ "score": score }))
            })
    }
}

/// Scores are held to hundredths: `Int(100*x + 0.5) / 100`. Totals and
/// averages are rounded before they are graded, stored or compared, so equal
/// marks always land on the same value whatever order they were summed in.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMarks {
    pub subject_id: String,
    pub ca1: f64,
    pub ca2: f64,
    pub exam: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub ca1: f64,
    pub ca2: f64,
    pub exam: f64,
    pub total: f64,
    pub grade: String,
    pub remark: String,
}

fn check_component(field: &str, value: f64, max: f64) -> Result<(), GradingError> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(GradingError::validation(format!(
            "{} must be between 0 and {}",
            field, max
        ))
        .with_details(json!({
            "field": field,
            "value": value,
            "min": 0.0,
            "max": max
        })));
    }
    Ok(())
}

pub fn score_subject(
    ca1: f64,
    ca2: f64,
    exam: f64,
    scale: &GradeScale,
) -> Result<SubjectScore, GradingError> {
    check_component("ca1", ca1, CA_MAX)?;
    check_component("ca2", ca2, CA_MAX)?;
    check_component("exam", exam, EXAM_MAX)?;

    let total = round_off_2_decimals(ca1 + ca2 + exam);
    let band = scale.resolve(total)?;
    Ok(SubjectScore {
        ca1,
        ca2,
        exam,
        total,
        grade: band.grade.clone(),
        remark: band.remark.clone(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSubject {
    pub subject_id: String,
    pub score: SubjectScore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub subjects: Vec<ScoredSubject>,
    pub total_score: f64,
    pub average_score: f64,
    pub overall_grade: String,
}

/// Scores every subject and derives the per-student totals. Nothing is
/// returned unless every subject passes validation.
pub fn aggregate_marks(
    marks: &[SubjectMarks],
    scale: &GradeScale,
) -> Result<Aggregate, GradingError> {
    if marks.is_empty() {
        return Err(GradingError::validation("no subjects submitted"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut subjects: Vec<ScoredSubject> = Vec::with_capacity(marks.len());
    for (i, m) in marks.iter().enumerate() {
        if !seen.insert(m.subject_id.as_str()) {
            return Err(GradingError::validation("subject submitted more than once")
                .with_details(json!({ "index": i, "subjectId": m.subject_id })));
        }
        let score = score_subject(m.ca1, m.ca2, m.exam, scale).map_err(|mut e| {
            let mut details = e.details.take().unwrap_or_else(|| json!({}));
            details["index"] = json!(i);
            details["subjectId"] = json!(m.subject_id);
            e.with_details(details)
        })?;
        subjects.push(ScoredSubject {
            subject_id: m.subject_id.clone(),
            score,
        });
    }

    let total_score = round_off_2_decimals(subjects.iter().map(|s| s.score.total).sum());
    let average_score = round_off_2_decimals(total_score / (subjects.len() as f64));
    let overall_grade = scale.resolve(average_score)?.grade.clone();

    Ok(Aggregate {
        subjects,
        total_score,
        average_score,
        overall_grade,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    pub result_id: String,
    pub student_id: String,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub result_id: String,
    pub student_id: String,
    pub average_score: f64,
    pub position: i64,
}

/// Standard competition ranking ("1224"): equal averages share a position and
/// the next distinct average resumes at its 1-based index.
pub fn competition_rank(mut entries: Vec<RankEntry>) -> Vec<RankedEntry> {
    for e in entries.iter_mut() {
        e.average_score = round_off_2_decimals(e.average_score);
    }
    entries.sort_by(|a, b| {
        b.average_score
            .partial_cmp(&a.average_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let mut out: Vec<RankedEntry> = Vec::with_capacity(entries.len());
    let mut prev: Option<(f64, i64)> = None;
    for (i, e) in entries.into_iter().enumerate() {
        let position = match prev {
            Some((avg, pos)) if avg == e.average_score => pos,
            _ => (i as i64) + 1,
        };
        prev = Some((e.average_score, position));
        out.push(RankedEntry {
            result_id: e.result_id,
            student_id: e.student_id,
            average_score: e.average_score,
            position,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(subject_id: &str, ca1: f64, ca2: f64, exam: f64) -> SubjectMarks {
        SubjectMarks {
            subject_id: subject_id.to_string(),
            ca1,
            ca2,
            exam,
        }
    }

    fn resolve_grade(score: f64) -> Result<GradeBand, GradingError> {
        GradeScale::canonical().resolve(score).cloned()
    }

    fn entry(student: &str, avg: f64) -> RankEntry {
        RankEntry {
            result_id: format!("r-{}", student),
            student_id: student.to_string(),
            average_score: avg,
        }
    }

    #[test]
    fn canonical_boundaries_are_locked() {
        let cases: [(f64, &str); 14] = [
            (0.0, "F"),
            (39.0, "F"),
            (40.0, "D"),
            (49.0, "D"),
            (50.0, "C"),
            (59.0, "C"),
            (60.0, "B"),
            (69.0, "B"),
            (70.0, "B+"),
            (79.0, "B+"),
            (80.0, "A"),
            (89.0, "A"),
            (90.0, "A+"),
            (100.0, "A+"),
        ];
        for (score, grade) in cases {
            let band = resolve_grade(score).expect("in range");
            assert_eq!(band.grade, grade, "score {}", score);
        }
        assert_eq!(resolve_grade(39.99).expect("in range").grade, "F");
        assert_eq!(resolve_grade(81.5).expect("in range").remark, "Excellent");
    }

    #[test]
    fn every_integer_score_hits_exactly_one_band() {
        let scale = GradeScale::canonical();
        for s in 0..=100 {
            let score = s as f64;
            let matching = scale
                .bands()
                .iter()
                .enumerate()
                .filter(|(i, b)| {
                    let upper = if *i == 0 {
                        f64::INFINITY
                    } else {
                        scale.bands()[i - 1].min_score
                    };
                    score >= b.min_score && score < upper
                })
                .count();
            assert_eq!(matching, 1, "score {}", s);
            assert!(scale.resolve(score).is_ok());
        }
    }

    #[test]
    fn resolve_rejects_out_of_range_without_clamping() {
        for bad in [-0.5, 100.5, f64::NAN, f64::INFINITY] {
            let e = resolve_grade(bad).expect_err("out of range");
            assert_eq!(e.kind, ErrorKind::Validation);
        }
    }

    #[test]
    fn subject_total_is_sum_of_components() {
        let scale = GradeScale::canonical();
        for ca1 in [0.0, 7.5, 20.0] {
            for ca2 in [0.0, 11.0, 20.0] {
                for exam in [0.0, 33.5, 60.0] {
                    let s = score_subject(ca1, ca2, exam, &scale).expect("valid marks");
                    assert_eq!(s.total, round_off_2_decimals(ca1 + ca2 + exam));
                    assert!((0.0..=100.0).contains(&s.total));
                }
            }
        }
    }

    #[test]
    fn subject_bounds_name_the_offending_field() {
        let scale = GradeScale::canonical();
        let e = score_subject(21.0, 10.0, 10.0, &scale).expect_err("ca1 too high");
        assert_eq!(e.kind, ErrorKind::Validation);
        let d = e.details.expect("details");
        assert_eq!(d["field"], "ca1");
        assert_eq!(d["max"], 20.0);

        let e = score_subject(10.0, -1.0, 10.0, &scale).expect_err("ca2 negative");
        assert_eq!(e.details.expect("details")["field"], "ca2");

        let e = score_subject(10.0, 10.0, 60.5, &scale).expect_err("exam too high");
        let d = e.details.expect("details");
        assert_eq!(d["field"], "exam");
        assert_eq!(d["max"], 60.0);
    }

    #[test]
    fn aggregate_matches_worked_example() {
        let scale = GradeScale::canonical();
        let agg = aggregate_marks(
            &[marks("math", 18.0, 17.0, 50.0), marks("eng", 16.0, 15.0, 47.0)],
            &scale,
        )
        .expect("aggregate");
        assert_eq!(agg.subjects[0].score.total, 85.0);
        assert_eq!(agg.subjects[0].score.grade, "A");
        assert_eq!(agg.subjects[1].score.total, 78.0);
        assert_eq!(agg.subjects[1].score.grade, "B+");
        assert_eq!(agg.total_score, 163.0);
        assert_eq!(agg.average_score, 81.5);
        assert_eq!(agg.overall_grade, "A");
    }

    #[test]
    fn aggregate_average_is_total_over_count() {
        let scale = GradeScale::canonical();
        let agg = aggregate_marks(
            &[
                marks("a", 1.0, 2.0, 3.0),
                marks("b", 20.0, 20.0, 60.0),
                marks("c", 13.5, 4.25, 41.0),
            ],
            &scale,
        )
        .expect("aggregate");
        assert_eq!(agg.total_score, 164.75);
        assert_eq!(agg.average_score, round_off_2_decimals(agg.total_score / 3.0));
        assert_eq!(agg.average_score, 54.92);
    }

    #[test]
    fn average_exactly_on_a_cut_gets_that_band() {
        let scale = GradeScale::canonical();
        let agg = aggregate_marks(
            &[
                marks("a", 8.8, 20.0, 60.0),
                marks("b", 16.6, 20.0, 60.0),
                marks("c", 14.6, 0.0, 40.0),
            ],
            &scale,
        )
        .expect("aggregate");
        let totals: Vec<f64> = agg.subjects.iter().map(|s| s.score.total).collect();
        assert_eq!(totals, vec![88.8, 96.6, 54.6]);
        assert_eq!(agg.total_score, 240.0);
        assert_eq!(agg.average_score, 80.0);
        assert_eq!(agg.overall_grade, "A");
    }

    #[test]
    fn entry_order_does_not_change_totals() {
        let scale = GradeScale::canonical();
        let forward = aggregate_marks(
            &[
                marks("a", 0.1, 0.0, 0.0),
                marks("b", 0.2, 0.0, 0.0),
                marks("c", 0.3, 0.0, 0.0),
            ],
            &scale,
        )
        .expect("forward");
        let reverse = aggregate_marks(
            &[
                marks("c", 0.3, 0.0, 0.0),
                marks("b", 0.2, 0.0, 0.0),
                marks("a", 0.1, 0.0, 0.0),
            ],
            &scale,
        )
        .expect("reverse");
        assert_eq!(forward.total_score, reverse.total_score);
        assert_eq!(forward.average_score, reverse.average_score);
        assert_eq!(forward.average_score, 0.2);

        let ranked = competition_rank(vec![
            entry("s1", forward.average_score),
            entry("s2", reverse.average_score),
        ]);
        assert!(ranked.iter().all(|r| r.position == 1));
    }

    #[test]
    fn ranking_treats_float_noise_as_a_tie() {
        let ranked = competition_rank(vec![
            entry("s1", 0.20000000000000004),
            entry("s2", 0.19999999999999998),
            entry("s3", 0.1),
        ]);
        let positions: Vec<i64> = ranked.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 1, 3]);
    }

    #[test]
    fn round_off_holds_hundredths() {
        assert_eq!(round_off_2_decimals(239.99999999999997), 240.0);
        assert_eq!(round_off_2_decimals(79.99999999999999), 80.0);
        assert_eq!(round_off_2_decimals(54.916666), 54.92);
        assert_eq!(round_off_2_decimals(12.344), 12.34);
    }

    #[test]
    fn aggregate_rejects_empty_and_duplicates() {
        let scale = GradeScale::canonical();
        let e = aggregate_marks(&[], &scale).expect_err("empty");
        assert_eq!(e.message, "no subjects submitted");

        let e = aggregate_marks(
            &[marks("a", 1.0, 1.0, 1.0), marks("a", 2.0, 2.0, 2.0)],
            &scale,
        )
        .expect_err("duplicate");
        assert_eq!(e.kind, ErrorKind::Validation);
    }

    #[test]
    fn aggregate_error_points_at_subject_index() {
        let scale = GradeScale::canonical();
        let e = aggregate_marks(
            &[marks("a", 1.0, 1.0, 1.0), marks("b", 21.0, 1.0, 1.0)],
            &scale,
        )
        .expect_err("bad ca1");
        let d = e.details.expect("details");
        assert_eq!(d["index"], 1);
        assert_eq!(d["subjectId"], "b");
        assert_eq!(d["field"], "ca1");
    }

    #[test]
    fn competition_rank_shares_ties_and_skips() {
        let ranked = competition_rank(vec![
            entry("d", 70.0),
            entry("b", 85.0),
            entry("a", 90.0),
            entry("c", 85.0),
        ]);
        let positions: Vec<(String, i64)> = ranked
            .iter()
            .map(|r| (r.student_id.clone(), r.position))
            .collect();
        assert_eq!(
            positions,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 2),
                ("d".to_string(), 4)
            ]
        );
    }

    #[test]
    fn competition_rank_all_tied_and_empty() {
        let ranked = competition_rank(vec![entry("x", 90.0), entry("y", 90.0)]);
        assert!(ranked.iter().all(|r| r.position == 1));
        assert!(competition_rank(Vec::new()).is_empty());
    }

    #[test]
    fn custom_scale_validation() {
        let ok = GradeScale::from_json(&json!([
            { "minScore": 50, "grade": "P", "remark": "Pass" },
            { "minScore": 0, "grade": "F", "remark": "Fail" }
        ]))
        .expect("valid scale");
        assert_eq!(ok.resolve(50.0).expect("in range").grade, "P");
        assert_eq!(ok.resolve(49.9).expect("in range").grade, "F");

        let gap = GradeScale::from_json(&json!([
            { "minScore": 50, "grade": "P", "remark": "Pass" },
            { "minScore": 10, "grade": "F", "remark": "Fail" }
        ]));
        assert!(gap.is_err());

        let unordered = GradeScale::from_json(&json!([
            { "minScore": 0, "grade": "F", "remark": "Fail" },
            { "minScore": 50, "grade": "P", "remark": "Pass" }
        ]));
        assert!(unordered.is_err());

        assert!(GradeScale::from_json(&json!([])).is_err());
        assert!(GradeScale::from_json(&json!({ "minScore": 0 })).is_err());
    }

    #[test]
    fn term_parse_is_case_insensitive_and_strict() {
        assert_eq!(Term::parse("Second").expect("term"), Term::Second);
        assert_eq!(Term::parse(" third ").expect("term").as_str(), "third");
        assert_eq!(
            Term::parse("fourth").expect_err("bad term").kind,
            ErrorKind::Validation
        );
    }
}
