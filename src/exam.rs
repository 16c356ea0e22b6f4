//! # Exam Session Configuration
//!
//! The immutable description of one oral exam, prepared by the setup screen and
//! read by the engine for its whole lifetime. The engine only ever turns it into
//! the system instructions sent when the remote session is opened.

use crate::error::{SessionError, SessionResult};
use serde::Serialize;

/// Upper bound on syllabus text forwarded to the remote model, in UTF-16 code units.
pub const MAX_SYLLABUS_CHARS: usize = 100_000;

/// Exam parameters for one voice session.
///
/// ## Invariants:
/// - `syllabus` never exceeds `MAX_SYLLABUS_CHARS` UTF-16 code units
/// - `total_questions` is at least 1
///
/// Only `new` builds one, so the invariants always hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamSessionConfig {
    /// Persona the examiner adopts (e.g. "A strict but fair university professor")
    examiner_style: String,

    /// Study material the questions are drawn from
    syllabus: String,

    /// Spoken language of the exam
    language: String,

    /// Difficulty label ("easy", "medium", "hard", ...)
    difficulty: String,

    /// Exact number of questions to ask
    total_questions: u32,
}

impl ExamSessionConfig {
    /// Build an exam configuration, truncating the syllabus to the maximum size.
    pub fn new(
        examiner_style: impl Into<String>,
        syllabus: impl AsRef<str>,
        language: impl Into<String>,
        difficulty: impl Into<String>,
        total_questions: u32,
    ) -> SessionResult<Self> {
        if total_questions == 0 {
            return Err(SessionError::Config(
                "An exam needs at least one question".to_string(),
            ));
        }

        let syllabus = syllabus.as_ref();
        if syllabus.trim().is_empty() {
            return Err(SessionError::Config("Syllabus text is empty".to_string()));
        }

        Ok(Self {
            examiner_style: examiner_style.into(),
            syllabus: truncate_utf16(syllabus, MAX_SYLLABUS_CHARS),
            language: language.into(),
            difficulty: difficulty.into(),
            total_questions,
        })
    }

    pub fn examiner_style(&self) -> &str {
        &self.examiner_style
    }

    pub fn syllabus(&self) -> &str {
        &self.syllabus
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn difficulty(&self) -> &str {
        &self.difficulty
    }

    pub fn total_questions(&self) -> u32 {
        self.total_questions
    }

    /// Render the persona/system instructions sent when the session opens.
    ///
    /// The instructions embed the full (truncated) syllabus and tell the model
    /// to grade every answer through the `reportAnswerResult` tool.
    pub fn system_instructions(&self) -> String {
        let n = self.total_questions;
        format!(
            "ROLE: {style}\n\
             TASK: Conduct an ORAL EXAM based on the provided syllabus.\n\
             \n\
             SYLLABUS MATERIAL:\n\
             \"\"\"\n\
             {syllabus}\n\
             \"\"\"\n\
             \n\
             LANGUAGE: {language} (You MUST speak in this language).\n\
             DIFFICULTY: {difficulty}\n\
             \n\
             INSTRUCTIONS:\n\
             1. This exam will consist of EXACTLY {n} questions.\n\
             2. Start by introducing the exam.\n\
             3. Ask questions in order of IMPORTANCE. The first question should cover the most critical concept. The last question should cover the least critical (but still relevant) concept.\n\
             4. Listen to the student's answer.\n\
             5. Determine if the answer is correct based on the syllabus text.\n\
             6. IMPORTANT: Call the tool '{tool}' to log the grade.\n\
             7. Give verbal feedback (correct/incorrect and why).\n\
             8. Ask the NEXT question.\n\
             9. After {n} questions, conclude the exam and say goodbye.\n",
            style = self.examiner_style,
            syllabus = self.syllabus,
            language = self.language,
            difficulty = self.difficulty,
            n = n,
            tool = crate::dispatcher::SCORE_TOOL_NAME,
        )
    }
}

/// Truncate to at most `max` UTF-16 code units.
///
/// A surrogate pair that would straddle the limit is left out whole.
fn truncate_utf16(text: &str, max: usize) -> String {
    let mut units = 0;
    for (byte_idx, c) in text.char_indices() {
        units += c.len_utf16();
        if units > max {
            return text[..byte_idx].to_string();
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exam(syllabus: &str, questions: u32) -> SessionResult<ExamSessionConfig> {
        ExamSessionConfig::new("A calm examiner", syllabus, "English", "medium", questions)
    }

    #[test]
    fn test_syllabus_is_truncated() {
        let long = "é".repeat(MAX_SYLLABUS_CHARS + 50);
        let config = exam(&long, 3).unwrap();
        assert_eq!(config.syllabus().chars().count(), MAX_SYLLABUS_CHARS);
    }

    #[test]
    fn test_truncation_counts_utf16_units() {
        // Each emoji is a surrogate pair
        let long = "🎓".repeat(MAX_SYLLABUS_CHARS);
        let config = exam(&long, 3).unwrap();
        assert_eq!(config.syllabus().chars().count(), MAX_SYLLABUS_CHARS / 2);
        assert_eq!(config.syllabus().encode_utf16().count(), MAX_SYLLABUS_CHARS);

        // A pair that would cross the limit is dropped whole
        let odd = format!("a{}", "🎓".repeat(MAX_SYLLABUS_CHARS));
        let config = exam(&odd, 3).unwrap();
        assert_eq!(config.syllabus().encode_utf16().count(), MAX_SYLLABUS_CHARS - 1);
    }

    #[test]
    fn test_short_syllabus_is_kept() {
        let config = exam("Photosynthesis converts light into chemical energy.", 3).unwrap();
        assert_eq!(config.syllabus(), "Photosynthesis converts light into chemical energy.");
    }

    #[test]
    fn test_zero_questions_rejected() {
        assert!(matches!(exam("Cells", 0), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_empty_syllabus_rejected() {
        assert!(exam("   ", 2).is_err());
    }

    #[test]
    fn test_system_instructions_content() {
        let config = ExamSessionConfig::new(
            "A strict professor",
            "The mitochondria is the powerhouse of the cell.",
            "Spanish",
            "hard",
            5,
        )
        .unwrap();
        let text = config.system_instructions();
        assert!(text.contains("ROLE: A strict professor"));
        assert!(text.contains("The mitochondria is the powerhouse of the cell."));
        assert!(text.contains("LANGUAGE: Spanish"));
        assert!(text.contains("DIFFICULTY: hard"));
        assert!(text.contains("EXACTLY 5 questions"));
        assert!(text.contains("After 5 questions"));
        assert!(text.contains("reportAnswerResult"));
    }
}
