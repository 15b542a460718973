mod presentation;

use eframe::egui;
use presentation::app::BleMonitorApp;

fn main() -> Result<(), eframe::Error> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 680.0])
            .with_min_inner_size([480.0, 400.0])
            .with_title("BLE Stream Monitor"),
        ..Default::default()
    };

    eframe::run_native(
        "BLE Stream Monitor",
        options,
        Box::new(|cc| Ok(Box::new(BleMonitorApp::new(cc)?))),
    )
}
