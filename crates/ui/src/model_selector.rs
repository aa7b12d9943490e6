use gpui::prelude::FluentBuilder;
use gpui::*;
use gpui_component::{
    ActiveTheme, Disableable, Icon, IconName, Selectable, Sizable,
    button::{Button, ButtonVariants},
    h_flex, v_flex,
};
use nook_llm::{ModelDescriptor, ModelRegistry};

use crate::chat::events::ModelSelected;

/// Dropdown over the static model registry.
pub struct ModelSelector {
    models: Vec<ModelDescriptor>,
    current_model_id: String,
    is_open: bool,
    locked: bool,
}

impl EventEmitter<ModelSelected> for ModelSelector {}

impl ModelSelector {
    pub fn new(registry: &ModelRegistry, current_model_id: impl Into<String>) -> Self {
        Self {
            models: registry.models().to_vec(),
            current_model_id: current_model_id.into(),
            is_open: false,
            locked: false,
        }
    }

    pub fn set_model_id(&mut self, model_id: &str, cx: &mut Context<Self>) {
        if self.current_model_id != model_id {
            self.current_model_id = model_id.to_string();
            cx.notify();
        }
    }

    /// Locks the selector while a reply is generating.
    pub fn set_locked(&mut self, locked: bool, cx: &mut Context<Self>) {
        if self.locked == locked {
            return;
        }
        self.locked = locked;
        if locked {
            self.is_open = false;
        }
        cx.notify();
    }

    fn toggle_open(&mut self, _event: &ClickEvent, _window: &mut Window, cx: &mut Context<Self>) {
        if self.locked {
            return;
        }
        self.is_open = !self.is_open;
        cx.notify();
    }

    fn choose(&mut self, model_id: String, cx: &mut Context<Self>) {
        self.is_open = false;
        if model_id != self.current_model_id {
            self.current_model_id = model_id.clone();
            cx.emit(ModelSelected { model_id });
        }
        cx.notify();
    }

    fn current_display_name(&self) -> String {
        self.models
            .iter()
            .find(|model| model.id == self.current_model_id)
            .map(|model| model.display_name.clone())
            .unwrap_or_else(|| self.current_model_id.clone())
    }
}

fn model_details(model: &ModelDescriptor) -> Option<String> {
    let mut details = Vec::new();
    if let Some(description) = &model.description {
        details.push(description.clone());
    }
    if let Some(vram) = model.vram_required_mb {
        details.push(format!("{:.1} GB VRAM", vram / 1024.0));
    }
    if let Some(context) = model.context_window_size {
        details.push(format!("{context} tokens"));
    }
    (!details.is_empty()).then(|| details.join(" · "))
}

impl Render for ModelSelector {
    fn render(&mut self, _window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();
        let is_open = self.is_open;

        h_flex()
            .id("model-selector")
            .relative()
            .child(
                Button::new("model-selector-button")
                    .ghost()
                    .small()
                    .child(self.current_display_name())
                    .disabled(self.locked)
                    .when(is_open, |button| button.selected(true))
                    .on_click(cx.listener(Self::toggle_open)),
            )
            .when(is_open, |element| {
                element.child(
                    v_flex()
                        .id("model-selector-dropdown")
                        .absolute()
                        .top(px(32.))
                        .left_0()
                        .w(px(340.))
                        .max_h(px(420.))
                        .overflow_y_scroll()
                        .bg(theme.popover)
                        .rounded_md()
                        .shadow_md()
                        .border_1()
                        .border_color(theme.border)
                        .py_1()
                        .children(self.models.iter().map(|model| {
                            let model_id = model.id.clone();
                            let is_selected = model_id == self.current_model_id;

                            h_flex()
                                .id(ElementId::Name(format!("model-option-{model_id}").into()))
                                .px_3()
                                .py_2()
                                .gap_2()
                                .items_center()
                                .cursor_pointer()
                                .when(is_selected, |element| element.bg(theme.primary.opacity(0.1)))
                                .when(!is_selected, |element| {
                                    element.hover(|element| element.bg(theme.muted.opacity(0.5)))
                                })
                                .on_click(cx.listener(move |this, _event, _window, cx| {
                                    this.choose(model_id.clone(), cx);
                                }))
                                .child(
                                    v_flex()
                                        .flex_1()
                                        .gap_1()
                                        .child(
                                            div()
                                                .text_sm()
                                                .text_color(theme.foreground)
                                                .child(model.display_name.clone()),
                                        )
                                        .when_some(model_details(model), |element, details| {
                                            element.child(
                                                div()
                                                    .text_xs()
                                                    .text_color(theme.muted_foreground)
                                                    .child(details),
                                            )
                                        }),
                                )
                                .when(is_selected, |element| {
                                    element.child(
                                        Icon::new(IconName::Check)
                                            .size(px(16.))
                                            .text_color(theme.primary),
                                    )
                                })
                                .into_any_element()
                        })),
                )
            })
    }
}
