use crate::presentation::app::BleMonitorApp;
use crate::presentation::components;
use crate::presentation::theme::Palette;
use ble_stream_monitor::domain::models::{BluetoothCommand, DiscoveredDevice};
use eframe::egui;

pub fn render(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    ui.heading("Nearby Devices");
    ui.add_space(12.0);

    ui_scan_panel(app, ui);
    ui.add_space(12.0);

    ui_device_list(app, ui);
    ui_connecting_overlay(app, ui);
}

fn ui_connecting_overlay(app: &BleMonitorApp, ui: &mut egui::Ui) {
    let Some(label) = app.state.connecting_label() else {
        return;
    };

    let screen = ui.ctx().screen_rect();
    egui::Area::new(egui::Id::new("connecting_backdrop"))
        .order(egui::Order::Middle)
        .fixed_pos(screen.min)
        .interactable(true)
        .show(ui.ctx(), |ui| {
            ui.allocate_rect(screen, egui::Sense::click());
            ui.painter()
                .rect_filled(screen, 0.0, egui::Color32::from_black_alpha(120));
        });

    egui::Window::new("Connecting")
        .id(egui::Id::new("connecting_overlay"))
        .title_bar(false)
        .collapsible(false)
        .resizable(false)
        .order(egui::Order::Foreground)
        .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
        .show(ui.ctx(), |ui| {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label(format!("Connecting to {}...", label));
            });
        });
}

fn ui_scan_panel(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    let palette = Palette::new(app.is_dark_mode);
    let adapter_state = app.state.adapter_state;

    components::card(ui, "Scanner", |ui| {
        let (text, color) = if app.state.connecting.is_some() {
            ("CONNECTING...".to_string(), palette.busy)
        } else if app.state.is_scanning {
            ("SCANNING...".to_string(), palette.info)
        } else {
            (
                format!("BLUETOOTH {}", adapter_state.to_string().to_uppercase()),
                palette.adapter(adapter_state),
            )
        };
        components::status_banner(ui, &text, color);
        ui.add_space(6.0);

        ui.horizontal(|ui| {
            let label = if app.state.devices.is_empty() {
                "Scan for Devices"
            } else {
                "Scan Again"
            };
            if ui
                .add_enabled(app.state.can_scan(), egui::Button::new(label))
                .clicked()
            {
                app.send(BluetoothCommand::StartScan);
            }

            if app.state.is_scanning {
                if ui.button("Stop Scan").clicked() {
                    app.send(BluetoothCommand::StopScan);
                }
                ui.spinner();
            }
        });

        if !adapter_state.is_powered_on() {
            ui.label(
                egui::RichText::new("Turn Bluetooth on to scan for devices.").color(palette.busy),
            );
        }
    });
}

fn ui_device_list(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    let count = app.state.devices.len();
    let title = format!("Devices Found ({})", count);
    let mut selected: Option<DiscoveredDevice> = None;

    components::card(ui, &title, |ui| {
        if count == 0 {
            ui.label(egui::RichText::new("No devices yet. Start a scan.").weak());
            return;
        }

        let can_connect = app.state.connecting.is_none();
        egui::ScrollArea::vertical()
            .id_salt("device_list")
            .max_height(360.0)
            .show(ui, |ui| {
                egui::Grid::new("device_grid")
                    .num_columns(4)
                    .striped(true)
                    .spacing([24.0, 8.0])
                    .show(ui, |ui| {
                        for device in &app.state.devices {
                            ui.label(
                                egui::RichText::new(
                                    device.name.as_deref().unwrap_or("Unknown Device"),
                                )
                                .strong(),
                            );
                            ui.monospace(device.id.as_str());
                            match device.signal_strength {
                                Some(rssi) => ui.label(format!("{} dBm", rssi)),
                                None => ui.label("-"),
                            };

                            let is_target = app.state.connecting.as_ref() == Some(&device.id);
                            if is_target {
                                ui.spinner();
                            } else if ui
                                .add_enabled(can_connect, egui::Button::new("Connect"))
                                .clicked()
                            {
                                selected = Some(device.clone());
                            }
                            ui.end_row();
                        }
                    });
            });
    });

    if let Some(device) = selected {
        app.send(BluetoothCommand::Connect(device.id));
    }
}
