//! Prompt construction.
//!
//! Renders a conversation plus the selected [`RefactorOptions`] into the single
//! prompt string sent to the completion endpoint. Everything here is pure: the
//! same inputs always produce the same bytes.

use crate::conversation::{Message, Role};
use crate::options::{Functionality, RefactorOptions, non_blank};
use crate::session::TurnKind;

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

/// Render one message as a role-tagged transcript entry.
pub fn render_message(message: &Message) -> String {
    format!("{IM_START}{}\n{}{IM_END}", message.role, message.content)
}

/// Render messages as a newline-joined, role-tagged transcript.
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the prompt for the turn kind waiting in the conversation.
pub fn build_for_turn(
    kind: TurnKind,
    messages: &[Message],
    options: &RefactorOptions,
    functionality: Functionality,
) -> String {
    match kind {
        TurnKind::Task => build_prompt(messages, options, functionality),
        TurnKind::FollowUp => build_follow_up_prompt(messages),
    }
}

/// Build a task prompt.
///
/// Layout: transcript of the messages before the trailing user turn, the task
/// framing with the user's code or requirements, the criteria list, and the
/// closing instruction the prompt ends with.
pub fn build_prompt(
    messages: &[Message],
    options: &RefactorOptions,
    functionality: Functionality,
) -> String {
    let (prior, subject) = match messages.split_last() {
        Some((last, prior)) if last.role == Role::User => (prior, Some(last.content.as_str())),
        _ => (messages, None),
    };

    let mut sections = Vec::with_capacity(4);

    let transcript = render_transcript(prior);
    if !transcript.is_empty() {
        sections.push(transcript);
    }

    sections.push(task_framing(functionality, options.language(), subject));

    let criteria = criteria_lines(options, functionality);
    if !criteria.is_empty() {
        sections.push(format!(
            "Apply the following criteria:\n{}",
            criteria.join("\n")
        ));
    }

    sections.push(closing_instruction(functionality).to_string());
    sections.join("\n\n")
}

/// Build a follow-up prompt: the whole transcript, then an open assistant turn.
pub fn build_follow_up_prompt(messages: &[Message]) -> String {
    let mut lines: Vec<String> = messages.iter().map(render_message).collect();
    lines.push(format!("{IM_START}{}", Role::Assistant));
    lines.push(String::new());
    lines.join("\n")
}

fn task_framing(functionality: Functionality, language: Option<&str>, subject: Option<&str>) -> String {
    let lang = language.map(|l| format!("{l} ")).unwrap_or_default();
    let sentence = match functionality {
        Functionality::Refactor => format!("Refactor the following {lang}code."),
        Functionality::WriteNewCode => {
            format!("Write new {lang}code that meets the following requirements.")
        }
        Functionality::Review => format!(
            "Review the following {lang}code for functionality, readability, maintainability and potential bugs."
        ),
    };

    let Some(subject) = subject else {
        return sentence;
    };
    let subject = subject.trim_end_matches(['\n', '\r']);
    match functionality {
        Functionality::WriteNewCode => format!("{sentence}\n\n{subject}"),
        Functionality::Refactor | Functionality::Review => {
            let tag = language.map(str::to_lowercase).unwrap_or_default();
            format!("{sentence}\n\n```{tag}\n{subject}\n```")
        }
    }
}

/// Criteria bullets in their fixed order; falsy or absent options produce nothing.
pub fn criteria_lines(options: &RefactorOptions, functionality: Functionality) -> Vec<String> {
    let refactor = functionality.is_refactor();
    let mut lines = Vec::new();

    if let Some(targets) = join_non_blank(&options.optimize_for) {
        lines.push(format!("- Optimize code for {targets}"));
    }
    if let Some(peps) = join_non_blank(&options.select_pep_compliance) {
        lines.push(format!("- Comply with {peps}"));
    }
    if let Some(variant) = non_blank(&options.sql_variant) {
        lines.push(format!("- Use {variant} SQL syntax"));
    }
    if options.sql_formatting {
        lines.push("- Enforce consistent SQL formatting".to_string());
    }
    if options.autogenerate_docstring {
        match non_blank(&options.docstring_format) {
            Some(format) => lines.push(format!("- Generate docstrings in {format} format")),
            None => lines.push("- Generate docstrings".to_string()),
        }
    }
    if options.include_type_annotations {
        lines.push("- Include type annotations".to_string());
    }
    if refactor {
        if options.identify_code_smells {
            lines.push("- Identify code smells and refactor them away".to_string());
        }
        if options.enable_variable_renaming {
            lines.push("- Rename variables to clear, descriptive names".to_string());
        }
        if options.suggest_code_organization {
            lines.push("- Suggest class and module organization".to_string());
        }
        if options.remove_unused_imports {
            lines.push("- Remove unused imports".to_string());
        }
        if options.security_check {
            lines.push("- Check for security vulnerabilities and fix them".to_string());
        }
    }
    if let Some(verbosity) = non_blank(&options.comment_verbosity) {
        lines.push(format!("- Comment verbosity: {verbosity}"));
    }
    if let Some(language) = options.language() {
        lines.push(format!("- Follow idiomatic {language} conventions"));
    }
    lines
}

fn join_non_blank(values: &[String]) -> Option<String> {
    let kept: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    (!kept.is_empty()).then(|| kept.join(", "))
}

/// The instruction every task prompt ends with.
pub fn closing_instruction(functionality: Functionality) -> &'static str {
    match functionality {
        Functionality::Refactor => {
            "Return the complete refactored code in a single code block, followed by a brief summary of the changes you made."
        }
        Functionality::WriteNewCode => {
            "Return the complete implementation in a single code block, followed by a brief explanation of how it works."
        }
        Functionality::Review => {
            "Return a structured review with specific, actionable suggestions for each issue you find."
        }
    }
}
