//! # Tool-Call Dispatcher
//!
//! Interprets function calls from the remote model. The only recognized tool is
//! the grading call `reportAnswerResult`, which updates the score and produces
//! the acknowledgement the endpoint expects before it continues the exam.

use crate::error::{SessionError, SessionResult};
use crate::transport::{FunctionDeclaration, OutboundMessage, ToolCall};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

/// Name of the grading tool.
pub const SCORE_TOOL_NAME: &str = "reportAnswerResult";

/// Result string acknowledged to the model for every grading call.
pub const TOOL_ACK_RESULT: &str = "Grade logged.";

const FALLBACK_CORRECT: &str = "Correct.";
const FALLBACK_REVIEW: &str = "Needs review.";

/// Declaration of `reportAnswerResult` sent when the session opens.
pub fn score_tool_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: SCORE_TOOL_NAME.to_string(),
        description: "Report whether the student's answer to the current question was correct, \
                      with a short summary of the feedback given."
            .to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "isCorrect": {
                    "type": "BOOLEAN",
                    "description": "True if the answer was correct"
                },
                "feedbackSummary": {
                    "type": "STRING",
                    "description": "Short summary of the feedback given to the student"
                }
            },
            "required": ["isCorrect"]
        }),
    }
}

/// Running score of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreState {
    pub correct_count: u32,
    pub questions_asked: u32,
    pub last_feedback_text: String,
}

/// Outcome of one recognized grading call.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub score: ScoreState,
    pub feedback: String,
    /// Acknowledgement to send back to the endpoint
    pub ack: OutboundMessage,
}

#[derive(Debug, Default)]
pub struct ToolCallDispatcher {
    score: ScoreState,
}

impl ToolCallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a tool call to the score.
    ///
    /// `isCorrect` counts only when it is the literal boolean `true`.
    pub fn dispatch(&mut self, call: &ToolCall) -> SessionResult<Dispatch> {
        if call.name != SCORE_TOOL_NAME {
            debug!(tool = %call.name, id = %call.id, "Ignoring unrecognized tool call");
            return Err(SessionError::ToolCallUnrecognized(call.name.clone()));
        }

        let is_correct = call.args.get("isCorrect").and_then(|v| v.as_bool()) == Some(true);
        let feedback = call
            .args
            .get("feedbackSummary")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if is_correct { FALLBACK_CORRECT } else { FALLBACK_REVIEW }.to_string()
            });

        self.score.questions_asked += 1;
        if is_correct {
            self.score.correct_count += 1;
        }
        self.score.last_feedback_text = feedback.clone();

        debug!(
            id = %call.id,
            correct = is_correct,
            score = self.score.correct_count,
            asked = self.score.questions_asked,
            "Answer graded"
        );

        Ok(Dispatch {
            score: self.score.clone(),
            feedback,
            ack: OutboundMessage::ToolResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                result: TOOL_ACK_RESULT.to_string(),
            },
        })
    }

    pub fn score(&self) -> &ScoreState {
        &self.score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn call(id: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: SCORE_TOOL_NAME.to_string(),
            args,
        }
    }

    #[test]
    fn test_correct_answer() {
        let mut dispatcher = ToolCallDispatcher::new();
        let result = dispatcher
            .dispatch(&call("c1", json!({"isCorrect": true, "feedbackSummary": "Well done"})))
            .unwrap();

        assert_eq!(result.score.correct_count, 1);
        assert_eq!(result.score.questions_asked, 1);
        assert_eq!(result.feedback, "Well done");
        assert_eq!(
            result.ack,
            OutboundMessage::ToolResponse {
                id: "c1".to_string(),
                name: SCORE_TOOL_NAME.to_string(),
                result: TOOL_ACK_RESULT.to_string(),
            }
        );
    }

    #[test]
    fn test_only_literal_true_counts() {
        let mut dispatcher = ToolCallDispatcher::new();
        for args in [
            json!({"isCorrect": "true"}),
            json!({"isCorrect": 1}),
            json!({"isCorrect": null}),
            json!({}),
            json!({"isCorrect": false}),
        ] {
            dispatcher.dispatch(&call("c", args)).unwrap();
        }
        assert_eq!(dispatcher.score().correct_count, 0);
        assert_eq!(dispatcher.score().questions_asked, 5);
    }

    #[test]
    fn test_fallback_feedback() {
        let mut dispatcher = ToolCallDispatcher::new();
        let pass = dispatcher.dispatch(&call("a", json!({"isCorrect": true}))).unwrap();
        assert_eq!(pass.feedback, "Correct.");
        let review = dispatcher
            .dispatch(&call("b", json!({"isCorrect": false, "feedbackSummary": "  "})))
            .unwrap();
        assert_eq!(review.feedback, "Needs review.");
        assert_eq!(dispatcher.score().last_feedback_text, "Needs review.");
    }

    #[test]
    fn test_unrecognized_tool_changes_nothing() {
        let mut dispatcher = ToolCallDispatcher::new();
        let other = ToolCall {
            id: "x".to_string(),
            name: "lookupWeather".to_string(),
            args: json!({"isCorrect": true}),
        };
        let err = dispatcher.dispatch(&other).unwrap_err();
        assert_eq!(err, SessionError::ToolCallUnrecognized("lookupWeather".to_string()));
        assert_eq!(dispatcher.score(), &ScoreState::default());
    }

    #[test]
    fn test_questions_asked_counts_every_call() {
        let mut dispatcher = ToolCallDispatcher::new();
        let mut previous = 0;
        for k in 0..7 {
            let result = dispatcher
                .dispatch(&call(&k.to_string(), json!({"isCorrect": k % 2 == 0})))
                .unwrap();
            assert!(result.score.questions_asked > previous);
            previous = result.score.questions_asked;
        }
        assert_eq!(dispatcher.score().questions_asked, 7);
        assert_eq!(dispatcher.score().correct_count, 4);
    }

    #[test]
    fn test_declaration_requires_is_correct() {
        let decl = score_tool_declaration();
        assert_eq!(decl.name, "reportAnswerResult");
        assert_eq!(decl.parameters["required"], json!(["isCorrect"]));
        assert_eq!(decl.parameters["properties"]["feedbackSummary"]["type"], "STRING");
    }
}
