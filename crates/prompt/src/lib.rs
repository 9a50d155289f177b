//! Prompt Composer: builds the (system, user) prompt pair for each dialog
//! state, injects retrieved documents, and enforces the "never reveal the
//! answer" guardrail in every non-consolidating template.

use std::fmt;

use serde::{Deserialize, Serialize};

use tutor_memory::RetrievedDocument;

/// Dialog states the composer can build a prompt for. This is the single
/// source of truth for FSM state identity — the Dialog FSM reuses this type
/// rather than defining its own, so prompt selection can never drift from
/// the state set the FSM actually reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogState {
    Idle,
    Listening,
    Analyzing,
    Probing,
    Hinting,
    Repair,
    Consolidating,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Hint ladder level. Mirrors the hint controller's level, duplicated here
/// (rather than imported) because the composer only ever needs to know
/// "which subclause to append," not the controller's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HintLevel {
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
}

/// A single turn of conversation, as the composer needs it for history
/// formatting.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub speaker: Speaker,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Student,
    Tutor,
}

/// Everything the composer needs to build a prompt pair for a given state.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub question_content: String,
    pub student_input: String,
    pub conversation_history: Vec<HistoryTurn>,
    pub rag_documents: Vec<RetrievedDocument>,
    pub current_concept: Option<String>,
    pub hint_level: Option<HintLevel>,
    pub concept_coverage: f64,
}

/// The "do not reveal the answer" rule shared by every non-consolidating
/// template. Must appear verbatim in each of them.
const CORE_PROHIBITION_RULES: &str = "\
ABSOLUTE PROHIBITIONS (highest priority):
1. Until the student themselves states the correct answer, never reveal:
   - The question's final answer (any numeric result)
   - The complete solution steps or procedure
   - Key intermediate calculations
2. Even if the student directly asks \"what's the answer\", refuse and redirect to their own thinking.
3. Only after the student states the correct answer on their own may you confirm it is correct.

PERMITTED GUIDANCE:
- Ask guiding questions
- Confirm whether their direction of thought is sound
- Give directional hints that contain no concrete values
- Encourage the student to keep trying";

const HISTORY_TURN_LIMIT_DEFAULT: usize = 5;
const RAG_DOC_LIMIT_DEFAULT: usize = 5;

/// Builds (system_prompt, user_prompt) pairs per [`DialogState`].
pub struct PromptComposer {
    history_turns: usize,
    max_retrieved_docs: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self {
            history_turns: HISTORY_TURN_LIMIT_DEFAULT,
            max_retrieved_docs: RAG_DOC_LIMIT_DEFAULT,
        }
    }
}

impl PromptComposer {
    pub fn new(history_turns: usize, max_retrieved_docs: usize) -> Self {
        Self {
            history_turns,
            max_retrieved_docs,
        }
    }

    pub fn from_config(config: &tutor_config::PromptConfig) -> Self {
        Self::new(config.history_turns, config.max_retrieved_docs)
    }

    /// Build both prompts for `state` given `context`.
    pub fn build_full_prompt(&self, state: DialogState, context: &PromptContext) -> (String, String) {
        (
            self.build_system_prompt(state, context),
            self.build_user_prompt(state, context),
        )
    }

    pub fn build_system_prompt(&self, state: DialogState, context: &PromptContext) -> String {
        let mut prompt = base_system_prompt(state).to_string();

        if state == DialogState::Hinting {
            if let Some(level) = context.hint_level {
                prompt.push('\n');
                prompt.push_str(hint_level_instructions(level));
            }
        }

        if !context.rag_documents.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&self.format_rag_context(&context.rag_documents));
        }

        prompt
    }

    pub fn build_user_prompt(&self, state: DialogState, context: &PromptContext) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !context.question_content.is_empty() {
            parts.push(format!("[Question]\n{}", context.question_content));
        }
        if let Some(concept) = &context.current_concept {
            parts.push(format!("[Current concept] {concept}"));
        }
        if !context.conversation_history.is_empty() {
            parts.push(format!(
                "[Conversation history (verbatim student transcript included)]\n{}",
                self.format_conversation_history(&context.conversation_history)
            ));
        }
        if !context.student_input.is_empty() {
            parts.push(format!(
                "[Student's latest response (speech transcript)]\n{}",
                context.student_input
            ));
        }

        parts.push(
            "[Reminder] Remember: never reveal the answer or full solution until the student \
             states it themselves."
                .to_string(),
        );

        let instruction = self.state_instruction(state, context);
        if !instruction.is_empty() {
            parts.push(instruction);
        }

        parts.join("\n\n")
    }

    fn format_rag_context(&self, documents: &[RetrievedDocument]) -> String {
        let mut lines = vec!["[Reference material]".to_string()];
        for (i, doc) in documents.iter().take(self.max_retrieved_docs).enumerate() {
            lines.push(format!("\n{}. [{}]\n{}", i + 1, category_label(doc.category), doc.content));
        }
        lines.join("\n")
    }

    fn format_conversation_history(&self, history: &[HistoryTurn]) -> String {
        let start = history.len().saturating_sub(self.history_turns);
        history[start..]
            .iter()
            .map(|turn| match turn.speaker {
                Speaker::Student => format!("Student: {}", turn.content),
                Speaker::Tutor => format!("Tutor: {}", turn.content),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn state_instruction(&self, state: DialogState, context: &PromptContext) -> String {
        match state {
            DialogState::Listening => {
                "Listen closely to the student's reasoning and prepare to respond.".to_string()
            }
            DialogState::Analyzing => {
                "Analyze the student's answer and identify any logic gap or error.".to_string()
            }
            DialogState::Probing => {
                "Ask one guiding question targeting the gap in the student's reasoning.".to_string()
            }
            DialogState::Hinting => self.hint_instruction(context),
            DialogState::Repair => {
                "Gently point out the student's error and guide them toward the correct concept."
                    .to_string()
            }
            DialogState::Consolidating => format!(
                "The student has completed this question (concept coverage: {:.0}%). \
                 Summarize the key concepts learned and encourage them.",
                context.concept_coverage * 100.0
            ),
            DialogState::Idle => {
                "Welcome the student and ask what they'd like to practice.".to_string()
            }
        }
    }

    fn hint_instruction(&self, context: &PromptContext) -> String {
        match context.hint_level {
            None => "Provide an appropriate hint to help the student.".to_string(),
            Some(HintLevel::Level1) => {
                "Give a Level 1 hint: directional only, no concrete steps.".to_string()
            }
            Some(HintLevel::Level2) => {
                "Give a Level 2 hint: name the key step, but no computed results.".to_string()
            }
            Some(HintLevel::Level3) => {
                "Give a Level 3 hint: outline the solution skeleton, but let the student compute \
                 every value themselves."
                    .to_string()
            }
        }
    }

    /// Builds the JSON-demanding analysis prompt, separate from the
    /// per-state prompt map above.
    pub fn analysis_prompt(
        &self,
        student_input: &str,
        question_content: &str,
        standard_solution: Option<&str>,
    ) -> (String, String) {
        let system_prompt = "You are a math-tutoring analysis expert. Analyze the student's \
             reasoning and respond in JSON.\n\n\
             IMPORTANT: the analysis must never contain:\n\
             - The question's correct answer\n\
             - The complete solution steps\n\
             - Anything that would let the student infer the answer directly\n\n\
             Response shape:\n\
             {\n\
             \x20\x20\"logic_complete\": true/false,\n\
             \x20\x20\"logic_gap\": true/false,\n\
             \x20\x20\"logic_error\": true/false,\n\
             \x20\x20\"error_type\": \"CALCULATION\" | \"CONCEPT\" | \"CARELESS\" | null,\n\
             \x20\x20\"missing_concepts\": [],\n\
             \x20\x20\"covered_concepts\": [],\n\
             \x20\x20\"feedback\": \"\"\n\
             }"
            .to_string();

        let mut user_parts = vec![
            format!("[Question]\n{question_content}"),
            format!("[Student response (speech transcript)]\n{student_input}"),
        ];
        if let Some(solution) = standard_solution {
            user_parts.push(format!(
                "[Standard solution (internal reference only, never surface in feedback)]\n{solution}"
            ));
        }
        user_parts.push(
            "Analyze the student's response and reply in JSON. The feedback field must never \
             contain the answer or full solution."
                .to_string(),
        );

        (system_prompt, user_parts.join("\n\n"))
    }
}

fn category_label(category: tutor_memory::ContentType) -> &'static str {
    use tutor_memory::ContentType::*;
    match category {
        Solution => "Solution",
        Misconception => "Common misconception",
        Concept => "Concept explanation",
        Hint => "Hint",
        Question => "Related question",
    }
}

fn base_system_prompt(state: DialogState) -> String {
    match state {
        // CONSOLIDATING carries no prohibition preamble: by this point the
        // student has already stated the answer, so there is nothing left
        // to withhold.
        DialogState::Consolidating => format!(
            "You are a math tutor who helps students consolidate what they've learned.\n\n{CONSOLIDATING_PROMPT_BODY}"
        ),
        other => format!(
            "{}\n\n{CORE_PROHIBITION_RULES}\n\n{}",
            role_line(other),
            role_body(other)
        ),
    }
}

fn role_line(state: DialogState) -> &'static str {
    match state {
        DialogState::Listening => "You are a patient, insightful math tutor using the Socratic method.",
        DialogState::Analyzing => "You are a math-teaching analysis expert.",
        DialogState::Probing => "You are a math tutor skilled at Socratic questioning.",
        DialogState::Hinting => "You are a math tutor who gives progressive hints.",
        DialogState::Repair => "You are a math tutor who helps students correct mistakes.",
        DialogState::Idle => "You are a friendly math-tutor assistant.",
        DialogState::Consolidating => unreachable!("consolidating has its own branch"),
    }
}

fn role_body(state: DialogState) -> &'static str {
    match state {
        DialogState::Listening => LISTENING_PROMPT_BODY,
        DialogState::Analyzing => ANALYZING_PROMPT_BODY,
        DialogState::Probing => PROBING_PROMPT_BODY,
        DialogState::Hinting => HINTING_PROMPT_BODY,
        DialogState::Repair => REPAIR_PROMPT_BODY,
        DialogState::Idle => IDLE_PROMPT_BODY,
        DialogState::Consolidating => unreachable!("consolidating has its own branch"),
    }
}

fn hint_level_instructions(level: HintLevel) -> &'static str {
    match level {
        HintLevel::Level1 => {
            "[Hint level: Level 1 — directional]\n\
             - Only give a direction to think in, never a number or an answer\n\
             - Do not reveal specific solution steps\n\
             - Guide with a question\n\
             - Forbidden: stating any computed result or intermediate value"
        }
        HintLevel::Level2 => {
            "[Hint level: Level 2 — key step]\n\
             - Point toward the key solution step\n\
             - Never give a numeric answer\n\
             - Let the student do the computation themselves\n\
             - Forbidden: stating a specific number, computed result, or final answer"
        }
        HintLevel::Level3 => {
            "[Hint level: Level 3 — solution skeleton]\n\
             - Provide the skeleton of the solution steps\n\
             - Every step's computed result must come from the student\n\
             - Make sure the student understands why each step is taken\n\
             - Forbidden: including any concrete value or final answer in the skeleton"
        }
    }
}

const LISTENING_PROMPT_BODY: &str = "\
Your role:
- Listen closely to the student's problem-solving reasoning
- Guide the student to discover issues themselves through questions
- Stay encouraging and supportive

While the student explains:
- Confirm you understood their reasoning
- Notice whether the logic is complete
- Identify any possible gaps in concepts
- Never state the answer or a complete solution

Response style: warm, friendly, concise.";

const ANALYZING_PROMPT_BODY: &str = "\
Your task:
- Analyze the student's problem-solving reasoning
- Identify logic gaps or errors
- Assess depth of conceptual understanding

Focus on:
- Whether the solution steps are complete
- Whether mathematical concepts are applied correctly
- Whether the computation has errors

Respond with an analysis in JSON. The analysis must not contain the answer.";

const PROBING_PROMPT_BODY: &str = "\
Your task:
- Ask a guiding question targeting the gap in the student's reasoning
- Never point out the error directly, and never state the correct answer
- Let the student discover the problem through your question

Question principles:
- Be specific and targeted
- Ask only one question at a time
- The question should lead the student's thinking
- The question must not hint at the answer

Response style: gentle, encouraging, avoid frustrating the student.";

const HINTING_PROMPT_BODY: &str = "\
Your task:
- Provide help appropriate to the current hint level
- Level 1: directional hint only, no steps or values
- Level 2: hint at the key step, but no computed result
- Level 3: give the solution skeleton, but the student computes every value

Important principles:
- Never give the final answer directly
- Never give the complete solution process
- Let the student keep the satisfaction of solving it themselves
- Hints should escalate gradually

Response style: encouraging, supportive, concise and focused.";

const REPAIR_PROMPT_BODY: &str = "\
Your task:
- Gently point out the direction the student went wrong (not the correct answer directly)
- Explain why that direction may be a problem
- Guide the student to rethink, rather than telling them the right answer

Repair principles:
- Never make the student feel ashamed
- Treat the error as a learning opportunity
- Guide the student to discover the right direction themselves
- Never state the correct answer while repairing

Response style: gentle, understanding, directionally guiding.";

const IDLE_PROMPT_BODY: &str = "\
Your task:
- Welcome the student to begin
- Find out what they want to practice
- Guide the student toward picking a question

Response style: warm, friendly, concise.";

const CONSOLIDATING_PROMPT_BODY: &str = "\
Note: this state is only reached after the student has already stated the correct \
answer themselves. You may now confirm it is correct and summarize.

Your task:
- Confirm the student's answer is correct
- Summarize the key concepts covered this session
- Highlight what the student did well
- Suggest related practice

Response style: positive, encouraging, clearly structured.";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tutor_memory::ContentType;

    fn sample_context() -> PromptContext {
        PromptContext {
            question_content: "A recipe uses 2/3 cup of flour per batch...".to_string(),
            student_input: "I think you multiply by the number of batches".to_string(),
            conversation_history: vec![HistoryTurn {
                speaker: Speaker::Student,
                content: "I multiply first".to_string(),
            }],
            rag_documents: Vec::new(),
            current_concept: Some("fraction multiplication".to_string()),
            hint_level: None,
            concept_coverage: 0.5,
        }
    }

    #[test]
    fn every_non_consolidating_prompt_contains_prohibition_preamble() {
        for state in [
            DialogState::Idle,
            DialogState::Listening,
            DialogState::Analyzing,
            DialogState::Probing,
            DialogState::Hinting,
            DialogState::Repair,
        ] {
            let text = base_system_prompt(state);
            assert!(
                text.contains(CORE_PROHIBITION_RULES),
                "missing prohibition preamble in {state:?}"
            );
        }
    }

    #[test]
    fn consolidating_prompt_omits_prohibition_preamble() {
        let text = base_system_prompt(DialogState::Consolidating);
        assert!(!text.contains(CORE_PROHIBITION_RULES));
    }

    #[test]
    fn hinting_system_prompt_appends_level_subclause() {
        let composer = PromptComposer::default();
        let mut context = sample_context();
        context.hint_level = Some(HintLevel::Level2);
        let system = composer.build_system_prompt(DialogState::Hinting, &context);
        assert!(system.contains("Level 2"));
        assert!(system.contains("Never give a numeric answer"));
    }

    #[test]
    fn rag_documents_are_injected_in_similarity_order() {
        let composer = PromptComposer::default();
        let mut context = sample_context();
        context.rag_documents = vec![
            RetrievedDocument {
                id: "d1".into(),
                content: "first doc".into(),
                category: ContentType::Concept,
                similarity: 0.9,
                metadata: HashMap::new(),
            },
            RetrievedDocument {
                id: "d2".into(),
                content: "second doc".into(),
                category: ContentType::Misconception,
                similarity: 0.4,
                metadata: HashMap::new(),
            },
        ];
        let system = composer.build_system_prompt(DialogState::Listening, &context);
        let first_pos = system.find("first doc").unwrap();
        let second_pos = system.find("second doc").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn user_prompt_always_includes_the_reminder_clause() {
        let composer = PromptComposer::default();
        let context = sample_context();
        let user = composer.build_user_prompt(DialogState::Listening, &context);
        assert!(user.contains("never reveal the answer"));
    }

    #[test]
    fn analysis_prompt_demands_json_and_forbids_answer_in_feedback() {
        let composer = PromptComposer::default();
        let (system, user) = composer.analysis_prompt("my reasoning", "2+2", Some("4"));
        assert!(system.contains("\"logic_complete\""));
        assert!(user.contains("internal reference only"));
    }

    #[test]
    fn history_is_truncated_to_configured_window() {
        let composer = PromptComposer::new(2, 5);
        let mut context = sample_context();
        context.conversation_history = (0..10)
            .map(|i| HistoryTurn {
                speaker: Speaker::Student,
                content: format!("turn {i}"),
            })
            .collect();
        let formatted = composer.format_conversation_history(&context.conversation_history);
        assert_eq!(formatted.lines().count(), 2);
        assert!(formatted.contains("turn 9"));
    }
}
