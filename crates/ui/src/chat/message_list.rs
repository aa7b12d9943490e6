use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::ops::Range;
use std::rc::Rc;

use gpui::*;
use gpui_component::{
    ActiveTheme, Icon, IconName, Sizable,
    button::{Button, ButtonVariants},
    h_flex,
    label::Label,
    text::TextView,
    v_flex, v_virtual_list,
};
use nook_chat::{ChatMessage, MarkdownBlock, RenderedBody, RenderedMessage, RoleIcon, render_message};

use crate::chat::scroll_manager::ScrollManager;

const DEFAULT_CONTENT_WIDTH: Pixels = px(680.);
const LIST_HORIZONTAL_PADDING: Pixels = px(16.);
const WIDTH_EPSILON: f32 = 1.0;
const USER_BUBBLE_MAX_WIDTH: Pixels = px(540.);
const USER_BUBBLE_PADDING_X: Pixels = px(14.);
const USER_BUBBLE_PADDING_Y: Pixels = px(10.);
const HEADER_HEIGHT: Pixels = px(16.);
const BLOCK_GAP: Pixels = px(8.);
const CODE_HEADER_HEIGHT: Pixels = px(28.);
const CODE_PADDING_Y: Pixels = px(8.);
const LINE_HEIGHT: Pixels = px(18.);
const CHAR_WIDTH: f32 = 7.0;

#[derive(Clone, Copy)]
struct RowSize {
    layout_hash: u64,
    height: Pixels,
    measured: bool,
}

/// Virtualized transcript of the conversation.
///
/// Rows are keyed by position: history only ever grows at the tail or is cleared.
pub struct MessageList {
    rows: Vec<RenderedMessage>,
    row_sizes: Vec<RowSize>,
    item_sizes: Rc<Vec<Size<Pixels>>>,
    scroll_manager: ScrollManager,
    content_width: Option<Pixels>,
}

impl MessageList {
    pub fn new(_cx: &mut Context<Self>) -> Self {
        Self {
            rows: Vec::new(),
            row_sizes: Vec::new(),
            item_sizes: Rc::new(Vec::new()),
            scroll_manager: ScrollManager::new(),
            content_width: None,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replaces the transcript. `generating` marks the last entry as the one being streamed.
    pub fn set_messages(&mut self, history: &[ChatMessage], generating: bool, cx: &mut Context<Self>) {
        let last = history.len().checked_sub(1);
        let rows: Vec<RenderedMessage> = history
            .iter()
            .enumerate()
            .map(|(index, message)| render_message(message, generating && Some(index) == last))
            .collect();

        if rows.is_empty() {
            self.scroll_manager.reset();
        } else if rows.len() > self.rows.len() || generating {
            self.scroll_manager.request_scroll_to_bottom_if_following();
        }

        self.rows = rows;
        self.rebuild_item_sizes();
        cx.notify();
    }

    pub fn scroll_to_bottom(&mut self, cx: &mut Context<Self>) {
        self.scroll_manager.request_scroll_to_bottom();
        cx.notify();
    }

    fn content_width(&self) -> Pixels {
        self.content_width.unwrap_or(DEFAULT_CONTENT_WIDTH)
    }

    fn update_content_width(&mut self, cx: &mut Context<Self>) {
        let list_width = self.scroll_manager.bounds().size.width;
        if list_width <= Pixels::ZERO {
            return;
        }

        let next = max_pixels(list_width - LIST_HORIZONTAL_PADDING * 2, px(1.));
        let changed = self
            .content_width
            .is_none_or(|current| (f32::from(current) - f32::from(next)).abs() > WIDTH_EPSILON);
        if !changed {
            return;
        }

        self.content_width = Some(next);
        for size in &mut self.row_sizes {
            size.measured = false;
        }
        self.rebuild_item_sizes();
        cx.notify();
    }

    fn rebuild_item_sizes(&mut self) {
        let width = self.content_width();
        self.row_sizes.truncate(self.rows.len());

        for (index, row) in self.rows.iter().enumerate() {
            let hash = layout_hash(row);
            match self.row_sizes.get_mut(index) {
                Some(size) if size.layout_hash == hash && size.measured => {}
                Some(size) => {
                    *size = RowSize {
                        layout_hash: hash,
                        height: estimate_row_height(row, width),
                        measured: false,
                    };
                }
                None => self.row_sizes.push(RowSize {
                    layout_hash: hash,
                    height: estimate_row_height(row, width),
                    measured: false,
                }),
            }
        }

        self.item_sizes = Rc::new(
            self.row_sizes
                .iter()
                .map(|row| size(px(0.), row.height))
                .collect(),
        );
    }

    fn measure_visible_rows(&mut self, visible: Range<usize>, window: &mut Window, cx: &mut Context<Self>) {
        let available = size(
            AvailableSpace::Definite(self.content_width()),
            AvailableSpace::MinContent,
        );
        let mut changed = false;

        for index in visible {
            let Some(row) = self.rows.get(index).cloned() else {
                continue;
            };
            let measured = self.render_row(&row, index, cx).layout_as_root(available, window, cx).height;
            let Some(size) = self.row_sizes.get_mut(index) else {
                continue;
            };
            if !size.measured || (f32::from(size.height) - f32::from(measured)).abs() > 0.5 {
                size.height = measured;
                changed = true;
            }
            size.measured = true;
        }

        if changed {
            self.item_sizes = Rc::new(
                self.row_sizes
                    .iter()
                    .map(|row| size(px(0.), row.height))
                    .collect(),
            );
            cx.notify();
        }
    }

    fn render_row(&self, row: &RenderedMessage, index: usize, cx: &mut Context<Self>) -> AnyElement {
        let theme = cx.theme();

        if row.icon == RoleIcon::User {
            let text = match &row.body {
                RenderedBody::Blocks(blocks) => plain_text(blocks),
                RenderedBody::Placeholder(placeholder) => placeholder.to_string(),
            };
            return v_flex()
                .w_full()
                .items_end()
                .child(
                    div()
                        .max_w(USER_BUBBLE_MAX_WIDTH)
                        .px(USER_BUBBLE_PADDING_X)
                        .py(USER_BUBBLE_PADDING_Y)
                        .rounded_lg()
                        .bg(theme.accent)
                        .text_color(theme.accent_foreground)
                        .child(Label::new(text).text_sm()),
                )
                .into_any_element();
        }

        let icon = match row.icon {
            RoleIcon::System => IconName::Settings,
            _ => IconName::Bot,
        };
        let header = h_flex()
            .gap_1()
            .items_center()
            .text_color(theme.foreground.opacity(0.5))
            .child(Icon::new(icon).xsmall())
            .child(Label::new(row.label).text_xs());

        let body = match &row.body {
            RenderedBody::Placeholder(placeholder) => Label::new(*placeholder)
                .text_sm()
                .text_color(theme.foreground.opacity(0.65))
                .into_any_element(),
            RenderedBody::Blocks(blocks) => v_flex()
                .w_full()
                .gap_2()
                .children(
                    blocks
                        .iter()
                        .enumerate()
                        .map(|(block_index, block)| render_block(block, index, block_index, cx)),
                )
                .into_any_element(),
        };

        v_flex()
            .w_full()
            .gap_2()
            .child(header)
            .child(body)
            .into_any_element()
    }
}

fn render_block(block: &MarkdownBlock, row: usize, block_index: usize, cx: &App) -> AnyElement {
    let theme = cx.theme();
    match block {
        MarkdownBlock::Prose(text) => TextView::markdown(
            ElementId::Name(SharedString::from(format!("prose-{row}-{block_index}"))),
            text.clone(),
        )
        .selectable(true)
        .into_any_element(),
        MarkdownBlock::Code { language, code } => {
            let fenced = format!("```{}\n{code}\n```", language.as_deref().unwrap_or(""));
            let copied = code.clone();
            v_flex()
                .w_full()
                .rounded_md()
                .border_1()
                .border_color(theme.border)
                .bg(theme.muted)
                .child(
                    h_flex()
                        .w_full()
                        .px_2()
                        .justify_between()
                        .items_center()
                        .child(
                            Label::new(language.clone().unwrap_or_else(|| "code".to_string()))
                                .text_xs()
                                .text_color(theme.muted_foreground),
                        )
                        .child(
                            Button::new(SharedString::from(format!("copy-{row}-{block_index}")))
                                .ghost()
                                .xsmall()
                                .icon(IconName::Copy)
                                .child("Copy")
                                .on_click(move |_, _, cx| {
                                    cx.write_to_clipboard(ClipboardItem::new_string(copied.clone()));
                                }),
                        ),
                )
                .child(
                    TextView::markdown(
                        ElementId::Name(SharedString::from(format!("code-{row}-{block_index}"))),
                        fenced,
                    )
                    .selectable(true),
                )
                .into_any_element()
        }
    }
}

impl Render for MessageList {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        self.update_content_width(cx);
        self.scroll_manager.sync();

        v_flex().size_full().min_h_0().child(
            v_virtual_list(
                cx.entity().clone(),
                "message-list",
                self.item_sizes.clone(),
                |this, visible, window, cx| {
                    this.update_content_width(cx);
                    this.measure_visible_rows(visible.clone(), window, cx);
                    visible
                        .filter_map(|index| {
                            this.rows
                                .get(index)
                                .cloned()
                                .map(|row| this.render_row(&row, index, cx))
                        })
                        .collect::<Vec<_>>()
                },
            )
            .size_full()
            .px_4()
            .py_3()
            .gap_4()
            .track_scroll(self.scroll_manager.handle()),
        )
    }
}

fn plain_text(blocks: &[MarkdownBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            MarkdownBlock::Prose(text) => text.clone(),
            MarkdownBlock::Code { language, code } => {
                format!("```{}\n{code}\n```", language.as_deref().unwrap_or(""))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn layout_hash(row: &RenderedMessage) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(row.label.as_bytes());
    match &row.body {
        RenderedBody::Placeholder(placeholder) => {
            hasher.write_u8(0);
            hasher.write(placeholder.as_bytes());
        }
        RenderedBody::Blocks(blocks) => {
            hasher.write_u8(1);
            for block in blocks {
                match block {
                    MarkdownBlock::Prose(text) => {
                        hasher.write_u8(0);
                        hasher.write(text.as_bytes());
                    }
                    MarkdownBlock::Code { language, code } => {
                        hasher.write_u8(1);
                        hasher.write(language.as_deref().unwrap_or("").as_bytes());
                        hasher.write(code.as_bytes());
                    }
                }
            }
        }
    }
    hasher.finish()
}

fn estimate_row_height(row: &RenderedMessage, width: Pixels) -> Pixels {
    if row.icon == RoleIcon::User {
        let bubble = min_pixels(width, USER_BUBBLE_MAX_WIDTH);
        let text_width = max_pixels(bubble - USER_BUBBLE_PADDING_X * 2, px(1.));
        let text = match &row.body {
            RenderedBody::Blocks(blocks) => plain_text(blocks),
            RenderedBody::Placeholder(placeholder) => placeholder.to_string(),
        };
        return estimate_text_height(&text, text_width) + USER_BUBBLE_PADDING_Y * 2;
    }

    let body = match &row.body {
        RenderedBody::Placeholder(_) => LINE_HEIGHT,
        RenderedBody::Blocks(blocks) => {
            let mut total = Pixels::ZERO;
            for (index, block) in blocks.iter().enumerate() {
                if index > 0 {
                    total += BLOCK_GAP;
                }
                total += match block {
                    MarkdownBlock::Prose(text) => estimate_text_height(text, width),
                    MarkdownBlock::Code { code, .. } => {
                        CODE_HEADER_HEIGHT + CODE_PADDING_Y * 2 + estimate_text_height(code, width)
                    }
                };
            }
            max_pixels(total, LINE_HEIGHT)
        }
    };

    HEADER_HEIGHT + BLOCK_GAP + body
}

fn max_pixels(a: Pixels, b: Pixels) -> Pixels {
    if f32::from(a) >= f32::from(b) { a } else { b }
}

fn min_pixels(a: Pixels, b: Pixels) -> Pixels {
    if f32::from(a) <= f32::from(b) { a } else { b }
}

fn estimate_text_height(text: &str, width: Pixels) -> Pixels {
    let chars_per_line = (f32::from(width) / CHAR_WIDTH).floor().max(1.0) as usize;
    let mut lines: usize = text
        .lines()
        .map(|line| line.chars().count().max(1).div_ceil(chars_per_line))
        .sum();
    if text.ends_with('\n') {
        lines += 1;
    }
    LINE_HEIGHT * lines.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(history: &[ChatMessage], generating: bool) -> Vec<RenderedMessage> {
        let last = history.len().saturating_sub(1);
        history
            .iter()
            .enumerate()
            .map(|(index, message)| render_message(message, generating && index == last))
            .collect()
    }

    #[::core::prelude::v1::test]
    fn streaming_tail_only_changes_last_row_hash() {
        let mut history: Vec<ChatMessage> = (0..500)
            .map(|index| {
                if index % 2 == 0 {
                    ChatMessage::user(format!("question {index}"))
                } else {
                    ChatMessage::assistant(format!("answer {index}\n\n```rust\nlet x = {index};\n```"))
                }
            })
            .collect();
        history.push(ChatMessage::assistant(""));

        let before = rows(&history, true);
        let before_hashes: Vec<u64> = before.iter().map(layout_hash).collect();

        if let Some(last) = history.last_mut() {
            *last = ChatMessage::assistant("Streaming now");
        }
        let after = rows(&history, true);
        let after_hashes: Vec<u64> = after.iter().map(layout_hash).collect();

        assert_eq!(before_hashes[..500], after_hashes[..500]);
        assert_ne!(before_hashes[500], after_hashes[500]);
        assert!(
            after
                .iter()
                .all(|row| estimate_row_height(row, DEFAULT_CONTENT_WIDTH) > Pixels::ZERO)
        );
    }

    #[::core::prelude::v1::test]
    fn code_blocks_are_taller_than_the_same_text_as_prose() {
        let prose = render_message(&ChatMessage::assistant("let x = 1;"), false);
        let code = render_message(&ChatMessage::assistant("```rust\nlet x = 1;\n```"), false);

        assert!(
            estimate_row_height(&code, DEFAULT_CONTENT_WIDTH)
                > estimate_row_height(&prose, DEFAULT_CONTENT_WIDTH)
        );
    }

    #[::core::prelude::v1::test]
    fn narrow_width_wraps_into_more_lines() {
        let text = "x".repeat(200);

        assert_eq!(estimate_text_height(&text, px(70.)), LINE_HEIGHT * 20);
        assert_eq!(estimate_text_height("", px(70.)), LINE_HEIGHT);
    }
}
