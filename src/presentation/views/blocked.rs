use crate::presentation::app::BleMonitorApp;
use crate::presentation::components;
use crate::presentation::theme::Palette;
use ble_stream_monitor::domain::models::AdapterState;
use eframe::egui;

pub fn render(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    let state = app.state.adapter_state;
    let palette = Palette::new(app.is_dark_mode);

    components::card(ui, "Bluetooth Unavailable", |ui| {
        components::status_banner(ui, &state.to_string().to_uppercase(), palette.adapter(state));
        ui.add_space(8.0);

        let message = match state {
            AdapterState::Unauthorized => {
                "Bluetooth access was denied. Allow access in system settings, then restart the app."
            }
            _ => "This system has no Bluetooth LE adapter this app can use.",
        };
        ui.label(message);

        #[cfg(windows)]
        {
            if ui.button("Bluetooth Settings").clicked() {
                let _ = std::process::Command::new("explorer")
                    .arg("ms-settings:bluetooth")
                    .spawn();
            }
        }

        if !app.settings.get().simulated_adapter {
            ui.add_space(8.0);
            ui.label(
                egui::RichText::new(format!(
                    "Set \"simulated_adapter\": true in {} to try the app with a demo sensor.",
                    app.settings.path().display()
                ))
                .weak(),
            );
        }
    });
}
