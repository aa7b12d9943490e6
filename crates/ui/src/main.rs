use std::sync::Arc;

use gpui::*;
use gpui_component::notification::NotificationList;
use gpui_component::{Root, Theme};
use nook_chat::SettingsStore;
use nook_llm::ModelRegistry;

use nook::app::{NewChat, NookShell, Quit, ToggleTheme, theme_mode};

fn main() {
    tracing_subscriber::fmt::init();

    let settings = Arc::new(SettingsStore::load(ModelRegistry::builtin()));
    tracing::info!(path = ?settings.config_path(), "settings loaded");

    let app = Application::new().with_assets(gpui_component_assets::Assets);

    app.run(move |cx| {
        gpui_tokio_bridge::init(cx);
        // Must run before any Root is created.
        gpui_component::init(cx);

        Theme::change(theme_mode(settings.settings().theme), None, cx);

        cx.on_action(|_: &Quit, cx| {
            cx.quit();
        });

        cx.bind_keys([
            KeyBinding::new("cmd-q", Quit, None),
            KeyBinding::new("ctrl-q", Quit, None),
            KeyBinding::new("cmd-n", NewChat, None),
            KeyBinding::new("ctrl-n", NewChat, None),
            KeyBinding::new("cmd-shift-t", ToggleTheme, None),
        ]);

        cx.spawn(async move |cx| {
            let opened = cx.update(|cx| {
                let options = WindowOptions {
                    window_bounds: Some(WindowBounds::Windowed(Bounds::centered(
                        None,
                        size(px(960.), px(760.)),
                        cx,
                    ))),
                    titlebar: Some(TitlebarOptions {
                        title: Some("Nook".into()),
                        appears_transparent: true,
                        traffic_light_position: Some(point(px(9.), px(9.))),
                    }),
                    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
                    window_decorations: Some(WindowDecorations::Client),
                    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
                    window_decorations: None,
                    ..Default::default()
                };

                let window = cx.open_window(options, |window, cx| {
                    let notification_list = cx.new(|cx| NotificationList::new(window, cx));
                    let shell =
                        cx.new(|cx| NookShell::new(settings, notification_list, window, cx));
                    cx.new(|cx| Root::new(shell, window, cx))
                });
                cx.activate(true);
                window
            });

            match opened {
                Ok(Ok(_)) => tracing::info!("main window opened"),
                Ok(Err(err)) => tracing::error!(error = %err, "failed to open main window"),
                Err(err) => tracing::error!(error = %err, "app quit before the window opened"),
            }
        })
        .detach();
    });
}
