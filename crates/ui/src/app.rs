use std::sync::Arc;

use gpui::prelude::FluentBuilder;
use gpui::*;
use gpui_component::notification::NotificationList;
use gpui_component::{
    ActiveTheme, IconName, Sizable, Theme, ThemeMode,
    button::{Button, ButtonVariants},
    h_flex, v_flex,
};
use nook_chat::{ChatOrchestrator, SettingsStore, ThemeChoice};
use nook_llm::{RigBackend, WorkerEngineFactory};

use crate::chat::ChatView;

#[cfg(target_os = "macos")]
const WINDOW_TOOLBAR_LEFT_SAFE_PADDING: f32 = 78.0;
#[cfg(not(target_os = "macos"))]
const WINDOW_TOOLBAR_LEFT_SAFE_PADDING: f32 = 16.0;
#[cfg(target_os = "windows")]
const WINDOW_TOOLBAR_RIGHT_SAFE_PADDING: f32 = 120.0;
#[cfg(not(target_os = "windows"))]
const WINDOW_TOOLBAR_RIGHT_SAFE_PADDING: f32 = 16.0;

gpui::actions!(shell, [NewChat, ToggleTheme, Quit]);

fn window_toolbar_height(window: &Window) -> Pixels {
    (1.75 * window.rem_size()).max(px(34.0))
}

pub fn theme_mode(choice: ThemeChoice) -> ThemeMode {
    match choice {
        ThemeChoice::Light => ThemeMode::Light,
        ThemeChoice::Dark => ThemeMode::Dark,
    }
}

fn toggled(choice: ThemeChoice) -> ThemeChoice {
    match choice {
        ThemeChoice::Light => ThemeChoice::Dark,
        ThemeChoice::Dark => ThemeChoice::Light,
    }
}

/// Wires persisted settings into an orchestrator backed by the OpenAI-compatible worker.
pub fn build_orchestrator(settings: &SettingsStore) -> ChatOrchestrator {
    let current = settings.settings();
    let provider = current.to_provider_config();
    let factory = WorkerEngineFactory::new(move || RigBackend::new(provider.clone()));

    tracing::info!(
        endpoint = %current.endpoint,
        model = %current.default_model,
        "building chat orchestrator"
    );

    ChatOrchestrator::new(Arc::new(factory), settings.registry().clone())
        .with_options(current.generation_options())
        .with_persistent_cache(current.use_persistent_cache)
        .with_selected_model(&current.default_model)
}

/// Window shell: title bar with model picker and chat controls above the chat view.
pub struct NookShell {
    notification_list: Entity<NotificationList>,
    settings: Arc<SettingsStore>,
    chat_view: Entity<ChatView>,
    title_bar_should_move: bool,
}

impl NookShell {
    pub fn new(
        settings: Arc<SettingsStore>,
        notification_list: Entity<NotificationList>,
        window: &mut Window,
        cx: &mut Context<Self>,
    ) -> Self {
        let orchestrator = Arc::new(build_orchestrator(&settings));
        let chat_view = cx.new(|cx| ChatView::new(orchestrator, window, cx));

        Self {
            notification_list,
            settings,
            chat_view,
            title_bar_should_move: false,
        }
    }

    fn new_chat(&mut self, cx: &mut Context<Self>) {
        self.chat_view
            .update(cx, |chat_view, cx| chat_view.new_chat(cx));
    }

    fn toggle_theme(&mut self, window: &mut Window, cx: &mut Context<Self>) {
        let mut next = (*self.settings.settings()).clone();
        next.theme = toggled(next.theme);
        Theme::change(theme_mode(next.theme), Some(window), cx);

        if let Err(err) = self.settings.update(next) {
            tracing::warn!(error = %err, "failed to persist theme choice");
        }
        cx.notify();
    }
}

impl Render for NookShell {
    fn render(&mut self, window: &mut Window, cx: &mut Context<Self>) -> impl IntoElement {
        let theme = cx.theme();
        let toolbar_height = window_toolbar_height(window);

        div()
            .size_full()
            .relative()
            .bg(theme.background)
            .on_action(cx.listener(|this, _: &NewChat, _window, cx| this.new_chat(cx)))
            .on_action(cx.listener(|this, _: &ToggleTheme, window, cx| {
                this.toggle_theme(window, cx);
            }))
            .child(
                v_flex()
                    .id("app-shell-body")
                    .size_full()
                    .min_h_0()
                    .pt(toolbar_height)
                    .overflow_hidden()
                    .child(self.chat_view.clone()),
            )
            .child(
                div()
                    .absolute()
                    .top_0()
                    .left_0()
                    .right_0()
                    .child(self.render_top_bar(window, toolbar_height, cx)),
            )
            .child(self.notification_list.clone())
    }
}

impl NookShell {
    fn render_top_bar(
        &self,
        window: &Window,
        toolbar_height: Pixels,
        cx: &Context<Self>,
    ) -> impl IntoElement {
        let theme = cx.theme();
        let model_selector = self.chat_view.read(cx).model_selector().clone();
        let endpoint = self.settings.settings().endpoint.clone();
        let theme_icon = match self.settings.settings().theme {
            ThemeChoice::Light => IconName::Moon,
            ThemeChoice::Dark => IconName::Sun,
        };

        h_flex()
            .id("app-top-bar")
            .window_control_area(WindowControlArea::Drag)
            .on_mouse_down_out(cx.listener(|this, _, _window, _cx| {
                this.title_bar_should_move = false;
            }))
            .on_mouse_up(
                MouseButton::Left,
                cx.listener(|this, _, _window, _cx| {
                    this.title_bar_should_move = false;
                }),
            )
            .on_mouse_down(
                MouseButton::Left,
                cx.listener(|this, _, _window, _cx| {
                    this.title_bar_should_move = true;
                }),
            )
            .on_mouse_move(cx.listener(|this, _, window, _cx| {
                if this.title_bar_should_move {
                    this.title_bar_should_move = false;
                    window.start_window_move();
                }
            }))
            .w_full()
            .h(toolbar_height)
            .flex_shrink_0()
            .pl(px(WINDOW_TOOLBAR_LEFT_SAFE_PADDING))
            .pr(px(WINDOW_TOOLBAR_RIGHT_SAFE_PADDING))
            .items_center()
            .justify_between()
            .bg(theme.background)
            .border_b_1()
            .border_color(theme.border)
            .child(
                h_flex()
                    .gap_2()
                    .items_center()
                    .child(model_selector)
                    .child(
                        div()
                            .id("endpoint-badge")
                            .px_2()
                            .py_1()
                            .rounded_full()
                            .bg(theme.muted)
                            .border_1()
                            .border_color(theme.border)
                            .text_xs()
                            .text_color(theme.muted_foreground)
                            .child(endpoint),
                    ),
            )
            .child(
                h_flex()
                    .gap_1()
                    .items_center()
                    .child(
                        Button::new("new-chat")
                            .ghost()
                            .small()
                            .icon(IconName::Plus)
                            .child("New chat")
                            .on_click(cx.listener(|this, _, _window, cx| this.new_chat(cx))),
                    )
                    .child(
                        Button::new("toggle-theme")
                            .ghost()
                            .small()
                            .icon(theme_icon)
                            .on_click(cx.listener(|this, _, window, cx| {
                                this.toggle_theme(window, cx);
                            })),
                    )
                    .child(self.render_linux_window_controls(window, cx)),
            )
            .when(
                cfg!(target_os = "linux") && window.window_controls().window_menu,
                |title_bar| {
                    title_bar.on_mouse_down(MouseButton::Right, |event, window, _| {
                        window.show_window_menu(event.position);
                    })
                },
            )
    }

    fn render_linux_window_controls(&self, window: &Window, cx: &Context<Self>) -> AnyElement {
        #[cfg(target_os = "linux")]
        {
            let maximize_icon = if window.is_maximized() {
                IconName::WindowRestore
            } else {
                IconName::WindowMaximize
            };

            h_flex()
                .id("linux-window-controls")
                .items_center()
                // Keep control clicks out of the title bar drag and double-click handlers.
                .on_mouse_down(MouseButton::Left, |_, _, cx| cx.stop_propagation())
                .on_mouse_down(MouseButton::Right, |_, _, cx| cx.stop_propagation())
                .gap_2()
                .ml_2()
                .child(
                    Button::new("linux-window-minimize")
                        .ghost()
                        .small()
                        .icon(IconName::WindowMinimize)
                        .on_click(cx.listener(|_, _, window, _| window.minimize_window())),
                )
                .child(
                    Button::new("linux-window-maximize")
                        .ghost()
                        .small()
                        .icon(maximize_icon)
                        .on_click(cx.listener(|_, _, window, _| window.zoom_window())),
                )
                .child(
                    Button::new("linux-window-close")
                        .ghost()
                        .small()
                        .icon(IconName::WindowClose)
                        .on_click(cx.listener(|_, _, window, _| window.remove_window())),
                )
                .into_any_element()
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (window, cx);
            div().into_any_element()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[::core::prelude::v1::test]
    fn theme_toggle_alternates_and_maps_to_modes() {
        assert_eq!(toggled(ThemeChoice::Light), ThemeChoice::Dark);
        assert_eq!(toggled(toggled(ThemeChoice::Light)), ThemeChoice::Light);
        assert!(theme_mode(ThemeChoice::Dark).is_dark());
        assert!(!theme_mode(ThemeChoice::Light).is_dark());
    }
}
