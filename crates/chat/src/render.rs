use crate::message::{ChatMessage, MessageContent, Role};

pub const NON_TEXT_PLACEHOLDER: &str = "[non-text content]";
pub const WAITING_PLACEHOLDER: &str = "Waiting for response...";
pub const EMPTY_PLACEHOLDER: &str = "(empty response)";

/// Content larger than this is shown as one prose block without fence splitting.
pub const MAX_STRUCTURED_BYTES: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleIcon {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkdownBlock {
    Prose(String),
    Code {
        language: Option<String>,
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedBody {
    Blocks(Vec<MarkdownBlock>),
    Placeholder(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub role: Role,
    pub label: &'static str,
    pub icon: RoleIcon,
    pub body: RenderedBody,
}

/// Projects one history entry into what the message list draws.
///
/// `streaming` marks the entry currently being filled so an empty body reads as pending.
pub fn render_message(message: &ChatMessage, streaming: bool) -> RenderedMessage {
    let (label, icon) = match message.role {
        Role::User => ("You", RoleIcon::User),
        Role::Assistant => ("Assistant", RoleIcon::Assistant),
        Role::System => ("System", RoleIcon::System),
    };

    let body = match &message.content {
        MessageContent::Parts(_) => RenderedBody::Placeholder(NON_TEXT_PLACEHOLDER),
        MessageContent::Text(text) if text.trim().is_empty() => {
            RenderedBody::Placeholder(if streaming {
                WAITING_PLACEHOLDER
            } else {
                EMPTY_PLACEHOLDER
            })
        }
        MessageContent::Text(text) if text.len() > MAX_STRUCTURED_BYTES => {
            RenderedBody::Blocks(vec![MarkdownBlock::Prose(text.clone())])
        }
        MessageContent::Text(text) => RenderedBody::Blocks(split_code_fences(text)),
    };

    RenderedMessage {
        role: message.role,
        label,
        icon,
        body,
    }
}

struct OpenFence {
    marker: char,
    width: usize,
    language: Option<String>,
    lines: Vec<String>,
}

/// Splits markdown into prose runs and fenced code blocks.
///
/// An unclosed fence runs to the end of the text, which is what a half-streamed reply
/// looks like.
pub fn split_code_fences(text: &str) -> Vec<MarkdownBlock> {
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut fence: Option<OpenFence> = None;

    for line in text.lines() {
        match fence.as_mut() {
            Some(open) => {
                if closes_fence(line, open.marker, open.width) {
                    if let Some(open) = fence.take() {
                        blocks.push(MarkdownBlock::Code {
                            language: open.language,
                            code: open.lines.join("\n"),
                        });
                    }
                } else {
                    open.lines.push(line.to_string());
                }
            }
            None => {
                if let Some((marker, width, language)) = opens_fence(line) {
                    flush_prose(&mut prose, &mut blocks);
                    fence = Some(OpenFence {
                        marker,
                        width,
                        language,
                        lines: Vec::new(),
                    });
                } else {
                    prose.push(line);
                }
            }
        }
    }

    match fence {
        Some(open) => blocks.push(MarkdownBlock::Code {
            language: open.language,
            code: open.lines.join("\n"),
        }),
        None => flush_prose(&mut prose, &mut blocks),
    }

    blocks
}

fn flush_prose(prose: &mut Vec<&str>, blocks: &mut Vec<MarkdownBlock>) {
    let joined = prose.join("\n");
    prose.clear();
    let trimmed = joined.trim_matches('\n');
    if !trimmed.trim().is_empty() {
        blocks.push(MarkdownBlock::Prose(trimmed.to_string()));
    }
}

fn fence_indent_ok(line: &str) -> Option<&str> {
    let stripped = line.trim_start_matches(' ');
    (line.len() - stripped.len() <= 3).then_some(stripped)
}

fn opens_fence(line: &str) -> Option<(char, usize, Option<String>)> {
    let stripped = fence_indent_ok(line)?;
    let marker = stripped.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }

    let width = stripped.chars().take_while(|ch| *ch == marker).count();
    if width < 3 {
        return None;
    }

    let info = stripped[width..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }

    let language = info
        .split_whitespace()
        .next()
        .map(str::to_string);
    Some((marker, width, language))
}

fn closes_fence(line: &str, marker: char, width: usize) -> bool {
    let Some(stripped) = fence_indent_ok(line) else {
        return false;
    };
    let run = stripped.chars().take_while(|ch| *ch == marker).count();
    run >= width && stripped[run..].trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentPart;

    #[test]
    fn plain_text_renders_as_one_prose_block() {
        let rendered = render_message(&ChatMessage::assistant("Hello **there**"), false);

        assert_eq!(rendered.label, "Assistant");
        assert_eq!(rendered.icon, RoleIcon::Assistant);
        assert_eq!(
            rendered.body,
            RenderedBody::Blocks(vec![MarkdownBlock::Prose("Hello **there**".to_string())])
        );
    }

    #[test]
    fn fenced_code_is_split_out_with_language() {
        let text = "Try this:\n\n```rust\nfn main() {}\n```\n\nThen run it.";

        assert_eq!(
            split_code_fences(text),
            vec![
                MarkdownBlock::Prose("Try this:".to_string()),
                MarkdownBlock::Code {
                    language: Some("rust".to_string()),
                    code: "fn main() {}".to_string(),
                },
                MarkdownBlock::Prose("Then run it.".to_string()),
            ]
        );
    }

    #[test]
    fn unclosed_fence_runs_to_end_while_streaming() {
        let blocks = split_code_fences("Here:\n~~~~\nline one\n```\nline two");

        assert_eq!(
            blocks,
            vec![
                MarkdownBlock::Prose("Here:".to_string()),
                MarkdownBlock::Code {
                    language: None,
                    code: "line one\n```\nline two".to_string(),
                },
            ]
        );
    }

    #[test]
    fn backticks_in_info_string_do_not_open_a_fence() {
        let blocks = split_code_fences("```not `a` fence```\nstill prose");

        assert_eq!(
            blocks,
            vec![MarkdownBlock::Prose(
                "```not `a` fence```\nstill prose".to_string()
            )]
        );
    }

    #[test]
    fn empty_and_non_text_content_use_placeholders() {
        let empty = ChatMessage::assistant("");
        assert_eq!(
            render_message(&empty, true).body,
            RenderedBody::Placeholder(WAITING_PLACEHOLDER)
        );
        assert_eq!(
            render_message(&empty, false).body,
            RenderedBody::Placeholder(EMPTY_PLACEHOLDER)
        );

        let image = ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text("look".to_string())]),
        };
        let rendered = render_message(&image, false);
        assert_eq!(rendered.label, "You");
        assert_eq!(
            rendered.body,
            RenderedBody::Placeholder(NON_TEXT_PLACEHOLDER)
        );
    }

    #[test]
    fn oversized_content_skips_fence_parsing() {
        let text = format!("```\n{}\n```", "x".repeat(MAX_STRUCTURED_BYTES));

        let rendered = render_message(&ChatMessage::assistant(text.clone()), false);

        assert_eq!(
            rendered.body,
            RenderedBody::Blocks(vec![MarkdownBlock::Prose(text)])
        );
    }
}
