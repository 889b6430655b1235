//! Pure classification of recent session output into an [`AnalysisResult`].
//!
//! Grounded on the teacher's `OutputParser` regex-table pattern (a map of
//! named patterns checked in sequence), restructured here into the six
//! first-match-wins rules and fixed `AnalysisResult` shape this control
//! plane uses instead of the teacher's free-form `ParsedOutput`.

use regex::Regex;

/// Terminal-state classification for a session's recent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Complete,
    Incomplete,
    StuckOrError,
    WaitingInput,
    Unknown,
}

/// The action the Continuation Engine should take in response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InjectPrompt,
    AssignNextTask,
    NotifyOwner,
    RetryWithHints,
    PauseAgent,
    NoAction,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalysisResult {
    pub conclusion: Conclusion,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub recommendation: Recommendation,
    pub iterations: u32,
    pub max_iterations: u32,
}

/// Per-event input the analyzer needs: whether new output arrived since the
/// last capture (drives rules 4/5), and the current iteration count.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext {
    pub has_new_output: bool,
    pub iterations: u32,
    pub max_iterations: u32,
    pub auto_assign_next: bool,
}

/// Stateless classifier: `(session_name, recent_output, context) ->
/// AnalysisResult`.
pub struct OutputAnalyzer;

impl OutputAnalyzer {
    pub fn classify(_session_name: &str, recent_output: &str, ctx: AnalysisContext) -> AnalysisResult {
        if let Some(evidence) = completion_marker(recent_output) {
            let recommendation = if ctx.auto_assign_next {
                Recommendation::AssignNextTask
            } else {
                Recommendation::NotifyOwner
            };
            return AnalysisResult {
                conclusion: Conclusion::Complete,
                confidence: 1.0,
                evidence: vec![evidence],
                recommendation,
                iterations: ctx.iterations,
                max_iterations: ctx.max_iterations,
            };
        }

        if let Some(evidence) = error_marker(recent_output) {
            if ctx.iterations < ctx.max_iterations {
                return AnalysisResult {
                    conclusion: Conclusion::StuckOrError,
                    confidence: 1.0,
                    evidence: vec![evidence],
                    recommendation: Recommendation::RetryWithHints,
                    iterations: ctx.iterations,
                    max_iterations: ctx.max_iterations,
                };
            }
        }

        if let Some(evidence) = waiting_input_marker(recent_output) {
            return AnalysisResult {
                conclusion: Conclusion::WaitingInput,
                confidence: 1.0,
                evidence: vec![evidence],
                recommendation: Recommendation::InjectPrompt,
                iterations: ctx.iterations,
                max_iterations: ctx.max_iterations,
            };
        }

        if !ctx.has_new_output && ctx.iterations >= ctx.max_iterations {
            return AnalysisResult {
                conclusion: Conclusion::Incomplete,
                confidence: 1.0,
                evidence: vec![format!(
                    "no new output and iteration count {} reached max {}",
                    ctx.iterations, ctx.max_iterations
                )],
                recommendation: Recommendation::NotifyOwner,
                iterations: ctx.iterations,
                max_iterations: ctx.max_iterations,
            };
        }

        if !ctx.has_new_output {
            return AnalysisResult {
                conclusion: Conclusion::Incomplete,
                confidence: 0.5,
                evidence: vec!["no new output since last capture".to_string()],
                recommendation: Recommendation::InjectPrompt,
                iterations: ctx.iterations,
                max_iterations: ctx.max_iterations,
            };
        }

        AnalysisResult {
            conclusion: Conclusion::Unknown,
            confidence: 0.1,
            evidence: vec!["no classification rule matched".to_string()],
            recommendation: Recommendation::NoAction,
            iterations: ctx.iterations,
            max_iterations: ctx.max_iterations,
        }
    }
}

fn completion_marker(output: &str) -> Option<String> {
    let lower = output.to_lowercase();
    const MARKERS: &[&str] = &["complete_task", "all tests pass", "done", "build successful"];
    MARKERS.iter().find(|m| lower.contains(**m)).map(|m| format!("found completion marker '{m}'"))
}

fn error_marker(output: &str) -> Option<String> {
    let error_re =
        Regex::new(r"(?i)(error:|exception:|traceback \(most recent call last\)|panicked at)").unwrap();
    error_re.find(output).map(|m| format!("error marker in output: '{}'", m.as_str()))
}

fn waiting_input_marker(output: &str) -> Option<String> {
    let trimmed = output.trim_end();
    if trimmed.ends_with('?') {
        return Some("output ends with a trailing '?'".to_string());
    }
    let lower = trimmed.to_lowercase();
    if lower.ends_with("please confirm") || lower.ends_with("(y/n)") || lower.ends_with("y/n") {
        return Some("output ends with a confirmation prompt".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(has_new_output: bool, iterations: u32) -> AnalysisContext {
        AnalysisContext {
            has_new_output,
            iterations,
            max_iterations: 10,
            auto_assign_next: false,
        }
    }

    #[test]
    fn completion_marker_wins_even_with_errors_present() {
        let result = OutputAnalyzer::classify("dev-1", "Error: ignored\nall tests pass", ctx(true, 0));
        assert_eq!(result.conclusion, Conclusion::Complete);
        assert_eq!(result.recommendation, Recommendation::NotifyOwner);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn completion_with_auto_assign_recommends_next_task() {
        let mut context = ctx(true, 0);
        context.auto_assign_next = true;
        let result = OutputAnalyzer::classify("dev-1", "done", context);
        assert_eq!(result.recommendation, Recommendation::AssignNextTask);
    }

    #[test]
    fn error_marker_recommends_retry_under_cap() {
        let result = OutputAnalyzer::classify("dev-3", "Error: ENOENT no such file", ctx(true, 0));
        assert_eq!(result.conclusion, Conclusion::StuckOrError);
        assert_eq!(result.recommendation, Recommendation::RetryWithHints);
    }

    #[test]
    fn error_marker_at_max_iterations_falls_through_to_idle_rules() {
        let result = OutputAnalyzer::classify("dev-3", "Error: ENOENT no such file", ctx(false, 10));
        assert_eq!(result.recommendation, Recommendation::NotifyOwner);
    }

    #[test]
    fn trailing_question_mark_waits_for_input() {
        let result = OutputAnalyzer::classify("dev-2", "Overwrite file foo.txt?", ctx(true, 0));
        assert_eq!(result.conclusion, Conclusion::WaitingInput);
        assert_eq!(result.recommendation, Recommendation::InjectPrompt);
    }

    #[test]
    fn idle_under_cap_recommends_continue_nudge() {
        let result = OutputAnalyzer::classify("dev-4", "still working...", ctx(false, 3));
        assert_eq!(result.conclusion, Conclusion::Incomplete);
        assert_eq!(result.recommendation, Recommendation::InjectPrompt);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn idle_at_cap_notifies_owner() {
        let result = OutputAnalyzer::classify("dev-4", "still working...", ctx(false, 10));
        assert_eq!(result.recommendation, Recommendation::NotifyOwner);
    }

    #[test]
    fn unmatched_output_with_new_data_is_unknown() {
        let result = OutputAnalyzer::classify("dev-4", "some fresh chatter", ctx(true, 0));
        assert_eq!(result.conclusion, Conclusion::Unknown);
        assert_eq!(result.recommendation, Recommendation::NoAction);
        assert_eq!(result.confidence, 0.1);
    }
}
