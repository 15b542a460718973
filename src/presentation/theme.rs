use ble_stream_monitor::domain::models::{AdapterState, NoticeSeverity};
use eframe::egui;

pub struct Palette {
    pub bg: egui::Color32,
    pub fg: egui::Color32,
    pub stroke: egui::Color32,
    pub ok: egui::Color32,
    pub busy: egui::Color32,
    pub info: egui::Color32,
    pub error: egui::Color32,
}

impl Palette {
    pub fn new(is_dark: bool) -> Self {
        if is_dark {
            Self {
                bg: egui::Color32::from_rgb(25, 25, 25),
                fg: egui::Color32::WHITE,
                stroke: egui::Color32::from_gray(200),
                ok: egui::Color32::from_rgb(0, 200, 110),
                busy: egui::Color32::from_rgb(255, 200, 0),
                info: egui::Color32::from_rgb(0, 180, 255),
                error: egui::Color32::from_rgb(255, 80, 80),
            }
        } else {
            Self {
                bg: egui::Color32::from_rgb(245, 245, 245),
                fg: egui::Color32::BLACK,
                stroke: egui::Color32::from_gray(40),
                ok: egui::Color32::from_rgb(0, 160, 80),
                busy: egui::Color32::from_rgb(230, 170, 0),
                info: egui::Color32::from_rgb(0, 120, 220),
                error: egui::Color32::from_rgb(220, 40, 40),
            }
        }
    }

    pub fn adapter(&self, state: AdapterState) -> egui::Color32 {
        match state {
            AdapterState::PoweredOn => self.ok,
            AdapterState::Unknown | AdapterState::Resetting => self.busy,
            AdapterState::PoweredOff => egui::Color32::from_gray(120),
            AdapterState::Unsupported | AdapterState::Unauthorized => self.error,
        }
    }

    pub fn severity(&self, severity: NoticeSeverity) -> egui::Color32 {
        match severity {
            NoticeSeverity::Info => self.info,
            NoticeSeverity::Success => self.ok,
            NoticeSeverity::Warning => self.busy,
            NoticeSeverity::Error => self.error,
        }
    }
}

pub fn configure_style(ctx: &egui::Context, is_dark: bool) {
    let palette = Palette::new(is_dark);
    let mut style = (*ctx.style()).clone();
    style.visuals = if is_dark {
        egui::Visuals::dark()
    } else {
        egui::Visuals::light()
    };

    style
        .text_styles
        .iter_mut()
        .for_each(|(text_style, font_id)| {
            font_id.size = match text_style {
                egui::TextStyle::Heading => 24.0,
                egui::TextStyle::Body | egui::TextStyle::Button => 15.0,
                egui::TextStyle::Monospace => 13.0,
                _ => font_id.size,
            };
        });

    style.spacing.item_spacing = egui::vec2(10.0, 10.0);
    style.spacing.button_padding = egui::vec2(14.0, 8.0);

    style.visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.5, palette.stroke);
    style.visuals.widgets.noninteractive.bg_fill = palette.bg;
    style.visuals.widgets.inactive.rounding = egui::Rounding::same(4.0);
    style.visuals.widgets.hovered.rounding = egui::Rounding::same(4.0);
    style.visuals.widgets.active.rounding = egui::Rounding::same(4.0);
    style.visuals.selection.bg_fill = palette.info;
    style.visuals.window_fill = palette.bg;
    style.visuals.panel_fill = palette.bg;
    style.visuals.override_text_color = Some(palette.fg);

    ctx.set_style(style);
}
