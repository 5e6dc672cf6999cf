use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::fmt;

/// Maximum marks assumed for a subject when the uploader leaves the field out.
pub const DEFAULT_MAX_MARKS: f64 = 100.0;

/// One-decimal rounding used for display aggregates (class averages,
/// attendance percentages). Per-result percentages are never pre-rounded.
pub fn round_to_1_decimal(x: f64) -> f64 {
    (10.0 * x).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one grading policy for the whole portal. Evaluated high to low,
/// first match wins; each threshold is inclusive at the lower bound.
/// Anything below the last band is an F.
pub const GRADE_BANDS: [(f64, Grade); 6] = [
    (90.0, Grade::APlus),
    (80.0, Grade::A),
    (70.0, Grade::BPlus),
    (60.0, Grade::B),
    (50.0, Grade::C),
    (40.0, Grade::D),
];

pub fn grade_for_percentage(percentage: f64) -> Grade {
    for (threshold, grade) in GRADE_BANDS {
        if percentage >= threshold {
            return grade;
        }
    }
    Grade::F
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMark {
    pub name: String,
    pub obtained_marks: f64,
    #[serde(default)]
    pub max_marks: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub total_obtained: f64,
    pub total_max: f64,
    pub percentage: f64,
    pub grade: Grade,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoringError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_input".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Computes totals, percentage, and letter grade for a set of subject marks.
///
/// Marks must be finite and non-negative, and obtained marks must not exceed
/// the subject maximum (after the 100 default is applied). Violations fail
/// with `invalid_input` naming the subject; marks are never clamped or
/// silently coerced, so a bad upload surfaces instead of producing a
/// plausible-looking wrong percentage.
///
/// A subject with a maximum of zero stays in the sums; the bound above forces
/// its obtained marks to zero, so it contributes nothing. Only a zero
/// `total_max` (empty list, or every maximum zero) triggers the
/// division-by-zero guard, which yields a 0% F rather than NaN.
pub fn compute_result_summary(subjects: &[SubjectMark]) -> Result<ResultSummary, ScoringError> {
    let mut total_obtained = 0.0_f64;
    let mut total_max = 0.0_f64;

    for s in subjects {
        let max = s.max_marks.unwrap_or(DEFAULT_MAX_MARKS);
        if !s.obtained_marks.is_finite() || !max.is_finite() {
            return Err(
                ScoringError::invalid_input(format!("non-numeric marks for subject '{}'", s.name))
                    .with_details(json!({ "subject": s.name })),
            );
        }
        if max < 0.0 {
            return Err(ScoringError::invalid_input(format!(
                "negative maximum marks for subject '{}'",
                s.name
            ))
            .with_details(json!({ "subject": s.name, "maxMarks": max })));
        }
        if s.obtained_marks < 0.0 {
            return Err(ScoringError::invalid_input(format!(
                "negative obtained marks for subject '{}'",
                s.name
            ))
            .with_details(json!({ "subject": s.name, "obtainedMarks": s.obtained_marks })));
        }
        if s.obtained_marks > max {
            return Err(ScoringError::invalid_input(format!(
                "obtained marks exceed maximum for subject '{}'",
                s.name
            ))
            .with_details(json!({
                "subject": s.name,
                "obtainedMarks": s.obtained_marks,
                "maxMarks": max
            })));
        }

        total_obtained += s.obtained_marks;
        total_max += max;
    }

    let percentage = if total_max > 0.0 {
        100.0 * total_obtained / total_max
    } else {
        0.0
    };

    Ok(ResultSummary {
        total_obtained,
        total_max,
        percentage,
        grade: grade_for_percentage(percentage),
    })
}

/// Median of percentage values, for class-level aggregates.
pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(name: &str, obtained: f64, max: f64) -> SubjectMark {
        SubjectMark {
            name: name.to_string(),
            obtained_marks: obtained,
            max_marks: Some(max),
        }
    }

    #[test]
    fn empty_subject_list_is_zero_percent_f() {
        let summary = compute_result_summary(&[]).expect("empty list is valid");
        assert_eq!(summary.total_obtained, 0.0);
        assert_eq!(summary.total_max, 0.0);
        assert_eq!(summary.percentage, 0.0);
        assert_eq!(summary.grade, Grade::F);
    }

    #[test]
    fn full_marks_single_subject_is_100_a_plus() {
        let summary = compute_result_summary(&[mark("Mathematics", 50.0, 50.0)]).expect("valid");
        assert_eq!(summary.percentage, 100.0);
        assert_eq!(summary.grade, Grade::APlus);
    }

    #[test]
    fn two_subject_totals_and_grade() {
        let subjects = vec![mark("Math", 45.0, 50.0), mark("Science", 38.0, 50.0)];
        let summary = compute_result_summary(&subjects).expect("valid");
        assert_eq!(summary.total_obtained, 83.0);
        assert_eq!(summary.total_max, 100.0);
        assert_eq!(summary.percentage, 83.0);
        assert_eq!(summary.grade, Grade::A);
    }

    #[test]
    fn band_thresholds_are_inclusive() {
        assert_eq!(grade_for_percentage(90.0), Grade::APlus);
        assert_eq!(grade_for_percentage(89.999), Grade::A);
        assert_eq!(grade_for_percentage(80.0), Grade::A);
        assert_eq!(grade_for_percentage(70.0), Grade::BPlus);
        assert_eq!(grade_for_percentage(60.0), Grade::B);
        assert_eq!(grade_for_percentage(50.0), Grade::C);
        assert_eq!(grade_for_percentage(40.0), Grade::D);
        assert_eq!(grade_for_percentage(39.999), Grade::F);
        assert_eq!(grade_for_percentage(0.0), Grade::F);
    }

    #[test]
    fn forty_to_forty_nine_percent_is_the_d_band() {
        // Some upstream screens used a coarser 6-band table with no D band,
        // jumping from C at 50 straight to F below 50; that table would call
        // a 45% an F. The 7-band table is the single policy here: 40-49% is
        // a D, and 50-59% a C.
        let summary = compute_result_summary(&[mark("English", 45.0, 100.0)]).expect("valid");
        assert_eq!(summary.percentage, 45.0);
        assert_eq!(summary.grade, Grade::D);
        let c_band = compute_result_summary(&[mark("English", 59.0, 100.0)]).expect("valid");
        assert_eq!(c_band.grade, Grade::C);
    }

    #[test]
    fn missing_max_marks_defaults_to_100() {
        let subjects = vec![SubjectMark {
            name: "Hindi".to_string(),
            obtained_marks: 70.0,
            max_marks: None,
        }];
        let summary = compute_result_summary(&subjects).expect("valid");
        assert_eq!(summary.total_max, 100.0);
        assert_eq!(summary.percentage, 70.0);
        assert_eq!(summary.grade, Grade::BPlus);
    }

    #[test]
    fn zero_max_subject_stays_in_sums() {
        // A 0/0 entry contributes nothing; the other subject still scores.
        let subjects = vec![mark("Art", 0.0, 0.0), mark("Math", 90.0, 100.0)];
        let summary = compute_result_summary(&subjects).expect("valid");
        assert_eq!(summary.total_max, 100.0);
        assert_eq!(summary.percentage, 90.0);
        assert_eq!(summary.grade, Grade::APlus);

        // All-zero maxima hit the division guard: 0%, not NaN, not an error.
        let degenerate = compute_result_summary(&[mark("Art", 0.0, 0.0)]).expect("valid");
        assert_eq!(degenerate.total_max, 0.0);
        assert_eq!(degenerate.percentage, 0.0);
        assert_eq!(degenerate.grade, Grade::F);
    }

    #[test]
    fn obtained_above_max_fails_loud() {
        let err = compute_result_summary(&[mark("Math", 105.0, 100.0)])
            .expect_err("must reject marks above maximum");
        assert_eq!(err.code, "invalid_input");
        assert!(err.message.contains("Math"));
    }

    #[test]
    fn negative_and_non_finite_marks_are_rejected() {
        let err = compute_result_summary(&[mark("Math", -1.0, 100.0)]).expect_err("negative");
        assert_eq!(err.code, "invalid_input");
        let err = compute_result_summary(&[mark("Math", f64::NAN, 100.0)]).expect_err("nan");
        assert_eq!(err.code, "invalid_input");
        let err = compute_result_summary(&[mark("Math", 10.0, -5.0)]).expect_err("negative max");
        assert_eq!(err.code, "invalid_input");
    }

    #[test]
    fn same_input_yields_identical_output() {
        let subjects = vec![mark("Math", 41.5, 80.0), mark("Science", 77.0, 90.0)];
        let a = compute_result_summary(&subjects).expect("valid");
        let b = compute_result_summary(&subjects).expect("valid");
        assert_eq!(a, b);
    }

    #[test]
    fn subject_marks_deserialize_from_wire_shape() {
        let subjects: Vec<SubjectMark> = serde_json::from_value(serde_json::json!([
            { "name": "Math", "obtainedMarks": 45, "maxMarks": 50 },
            { "name": "Hindi", "obtainedMarks": 70 }
        ]))
        .expect("camelCase wire shape");
        assert_eq!(subjects[1].max_marks, None);
        let summary = compute_result_summary(&subjects).expect("valid");
        assert_eq!(summary.total_max, 150.0);
    }

    #[test]
    fn median_of_percentages() {
        assert_eq!(compute_median(&[]), 0.0);
        assert_eq!(compute_median(&[70.0]), 70.0);
        assert_eq!(compute_median(&[50.0, 90.0]), 70.0);
        assert_eq!(compute_median(&[40.0, 70.0, 90.0]), 70.0);
    }

    #[test]
    fn round_to_1_decimal_for_display() {
        assert_eq!(round_to_1_decimal(83.333333), 83.3);
        assert_eq!(round_to_1_decimal(66.666666), 66.7);
        assert_eq!(round_to_1_decimal(0.0), 0.0);
    }
}
