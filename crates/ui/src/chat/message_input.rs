use gpui::*;
use gpui_component::{
    ActiveTheme, IconName, Sizable,
    button::{Button, ButtonVariants},
    input::{Input, InputEvent, InputState},
    v_flex,
};

use crate::chat::events::{DraftChanged, Stop, Submit};

/// Prompt box with a send button that turns into a stop button while a reply streams.
pub struct MessageInput {
    input_state: Entity<InputState>,
    generating: bool,
    // Shift+Enter inserts the newline itself and the input still reports PressEnter afterwards.
    swallow_next_enter: bool,
}

impl EventEmitter<Submit> for MessageInput {}
impl EventEmitter<Stop> for MessageInput {}
impl EventEmitter<DraftChanged> for MessageInput {}

impl MessageInput {
    pub fn new(window: &mut Window, cx: &mut Context<Self>) -> Self {
        let input_state = cx.new(|cx| {
            InputState::new(window, cx)
                .placeholder("Ask the model anything...")
                .clean_on_escape()
                .auto_grow(3, 10)
        });

        cx.subscribe_in(
            &input_state,
            window,
            |this, state, event: &InputEvent, window, cx| match event {
                InputEvent::Change => {
                    let text = state.read(cx).value().to_string();
                    cx.emit(DraftChanged { text });
                }
                InputEvent::PressEnter { secondary } => {
                    if *secondary || this.swallow_next_enter {
                        this.swallow_next_enter = false;
                        return;
                    }
                    this.strip_enter_newline(window, cx);
                    this.submit(window, cx);
                }
                _ => {}
            },
        )
        .detach();

        Self {
            input_state,
            generating: false,
            swallow_next_enter: false,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn set_generating(&mut self, generating: bool, cx: &mut Context<Self>) {
        if self.generating == generating {
            return;
        }
        self.generating = generating;
        self.swallow_next_enter = false;
        cx.notify();
    }

    pub fn text(&self, cx: &App) -> String {
        self.input_state.read(cx).value().to_string()
    }

    /// Mirrors the store's draft into the box when the two disagree.
    pub fn sync_text(&mut self, text: &str, window: &mut Window, cx: &mut Context<Self>) {
        if self.text(cx) == text {
            return;
        }
        let text = text.to_string();
        self.input_state.update(cx, |state, cx| {
            state.set_value(text, window, cx);
        });
    }

    fn insert_newline(&mut self, window: &mut Window, cx: &mut Context<Self>) {
        if self.generating {
            return;
        }

        self.swallow_next_enter = true;
        self.input_state.update(cx, |state, cx| {
            state.insert("\n", window, cx);
        });
    }

    fn strip_enter_newline(&mut self, window: &mut Window, cx: &mut Context<Self>) {
        self.input_state.update(cx, |state, cx| {
            let value = state.value().to_string();
            if let Some(trimmed) = value.strip_suffix('\n') {
                state.set_value(trimmed.to_string(), window, cx);
            }
        });
    }

    fn submit(&mut self, _window: &mut Window, cx: &mut Context<Self>) {
        if self.generating {
            return;
        }

        let content = self.text(cx);
        if content.trim().is_empty() {
            return;
        }

        // The store clears the draft once the send is accepted.
        cx.emit(Submit::new(content));
    }

    fn stop(&mut self, cx: &mut Context<Self>) {
        if self.generating {
            cx.emit(Stop);
        }
    }
}

impl Render for MessageInput {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();
        let generating = self.generating;
        let action = if generating {
            Button::new("stop")
                .small()
                .danger()
                .icon(IconName::CircleX)
                .child("Stop")
                .on_click(cx.listener(|this, _, _window, cx| this.stop(cx)))
                .into_any_element()
        } else {
            Button::new("send")
                .small()
                .primary()
                .icon(IconName::ArrowUp)
                .child("Send")
                .on_click(cx.listener(|this, _, window, cx| this.submit(window, cx)))
                .into_any_element()
        };

        v_flex()
            .bg(theme.background)
            .gap_2()
            .p_3()
            .child(
                div()
                    .w_full()
                    .px_3()
                    .py_2()
                    .rounded_lg()
                    .border_1()
                    .border_color(theme.border)
                    .on_key_down(cx.listener(|this, event: &KeyDownEvent, window, cx| {
                        if event.keystroke.key == "enter" && event.keystroke.modifiers.shift {
                            this.insert_newline(window, cx);
                        }
                    }))
                    .child(Input::new(&self.input_state).w_full().disabled(generating)),
            )
            .child(div().w_full().flex().justify_end().child(action))
    }
}
