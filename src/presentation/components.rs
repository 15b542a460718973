use eframe::egui;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn card<R>(
    ui: &mut egui::Ui,
    title: &str,
    add_contents: impl FnOnce(&mut egui::Ui) -> R,
) -> R {
    let stroke = ui.style().visuals.widgets.noninteractive.bg_stroke;
    let bg = ui.style().visuals.widgets.noninteractive.bg_fill;

    egui::Frame::none()
        .inner_margin(egui::Margin::same(14.0))
        .rounding(egui::Rounding::same(6.0))
        .stroke(stroke)
        .fill(bg)
        .show(ui, |ui| {
            ui.set_width(ui.available_width());
            ui.label(egui::RichText::new(title).strong().size(18.0));
            ui.add_space(6.0);
            add_contents(ui)
        })
        .inner
}

pub fn status_banner(ui: &mut egui::Ui, text: &str, bg_color: egui::Color32) {
    ui.add_sized(
        [ui.available_width(), 32.0],
        egui::Label::new(
            egui::RichText::new(format!(" {} ", text))
                .color(egui::Color32::BLACK)
                .background_color(bg_color)
                .size(16.0)
                .strong(),
        )
        .wrap_mode(egui::TextWrapMode::Extend),
    );
}

/// `HH:MM:SS.mmm` (UTC) of a capture time.
pub fn format_timestamp(at: SystemTime) -> String {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let of_day = millis % 86_400_000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        of_day / 3_600_000,
        of_day / 60_000 % 60,
        of_day / 1000 % 60,
        of_day % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_timestamp() {
        let at = UNIX_EPOCH + Duration::from_millis(86_400_000 + 3_723_045);
        assert_eq!(format_timestamp(at), "01:02:03.045");
        assert_eq!(format_timestamp(UNIX_EPOCH), "00:00:00.000");
    }
}
