use crate::presentation::app::BleMonitorApp;
use crate::presentation::components;
use crate::presentation::theme::Palette;
use ble_stream_monitor::domain::models::BluetoothCommand;
use eframe::egui;
use egui_extras::{Column, TableBuilder};

pub fn render(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    ui_device_panel(app, ui);
    ui.add_space(12.0);
    ui_sample_table(app, ui);
}

fn ui_device_panel(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    let palette = Palette::new(app.is_dark_mode);
    let Some(device) = app.state.connected.clone() else {
        return;
    };

    components::card(ui, "Connected Device", |ui| {
        let (text, color) = if app.state.is_streaming {
            ("STREAMING", palette.ok)
        } else {
            ("CONNECTED", palette.info)
        };
        components::status_banner(ui, text, color);
        ui.add_space(6.0);

        egui::Grid::new("device_info")
            .spacing([32.0, 6.0])
            .show(ui, |ui| {
                ui.label("Name:");
                ui.label(egui::RichText::new(device.display_name()).strong());
                ui.end_row();

                ui.label("ID:");
                ui.monospace(device.id.as_str());
                ui.end_row();

                ui.label("Bluetooth:");
                ui.label(
                    egui::RichText::new(app.state.adapter_state.to_string())
                        .color(palette.adapter(app.state.adapter_state)),
                );
                ui.end_row();
            });

        ui.add_space(6.0);
        ui.horizontal(|ui| {
            if app.state.is_streaming {
                if ui.button("Stop Streaming").clicked() {
                    app.send(BluetoothCommand::StopStreaming);
                }
            } else if ui.button("Start Streaming").clicked() {
                app.send(BluetoothCommand::StartStreaming);
            }

            if ui.button("Disconnect").clicked() {
                app.send(BluetoothCommand::Disconnect);
            }
        });
    });
}

fn ui_sample_table(app: &mut BleMonitorApp, ui: &mut egui::Ui) {
    let samples = &app.state.samples;
    let title = format!("Samples ({}/{})", samples.len(), samples.capacity());

    components::card(ui, &title, |ui| {
        if samples.is_empty() {
            let hint = if app.state.is_streaming {
                "Waiting for notifications..."
            } else {
                "Start streaming to capture notifications."
            };
            ui.label(egui::RichText::new(hint).weak());
            return;
        }

        let rows: Vec<_> = samples.iter().collect();
        TableBuilder::new(ui)
            .striped(true)
            .max_scroll_height(420.0)
            .column(Column::auto().at_least(100.0))
            .column(Column::auto().at_least(120.0).clip(true))
            .column(Column::auto().at_least(120.0).clip(true))
            .column(Column::remainder())
            .header(22.0, |mut header| {
                header.col(|ui| {
                    ui.strong("Time");
                });
                header.col(|ui| {
                    ui.strong("Service");
                });
                header.col(|ui| {
                    ui.strong("Characteristic");
                });
                header.col(|ui| {
                    ui.strong("Value");
                });
            })
            .body(|body| {
                body.rows(20.0, rows.len(), |mut row| {
                    let sample = rows[row.index()];
                    row.col(|ui| {
                        ui.monospace(components::format_timestamp(sample.captured_at));
                    });
                    row.col(|ui| {
                        ui.monospace(&sample.service_id);
                    });
                    row.col(|ui| {
                        ui.monospace(&sample.characteristic_id);
                    });
                    row.col(|ui| {
                        ui.monospace(&sample.raw_value);
                    });
                });
            });
    });
}
