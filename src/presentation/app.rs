use crate::presentation::state::MonitorState;
use crate::presentation::{theme, views};
use ble_stream_monitor::domain::models::{AppEvent, BluetoothCommand};
use ble_stream_monitor::domain::session::View;
use ble_stream_monitor::domain::settings::{Settings, SettingsService};
use ble_stream_monitor::infrastructure::bluetooth::mock::MockBleAdapter;
#[cfg(not(windows))]
use ble_stream_monitor::infrastructure::bluetooth::unsupported::UnsupportedAdapter;
#[cfg(windows)]
use ble_stream_monitor::infrastructure::bluetooth::winrt::WinRtAdapter;
use ble_stream_monitor::infrastructure::bluetooth::{BleAdapter, BluetoothService};
use ble_stream_monitor::infrastructure::logging::{init_logger, LoggingGuard};
use eframe::egui;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct BleMonitorApp {
    pub(crate) settings: SettingsService,
    pub(crate) state: MonitorState,
    pub(crate) is_dark_mode: bool,

    bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,
    worker: Option<JoinHandle<()>>,

    _logging_guard: Option<LoggingGuard>,
}

async fn create_adapter(settings: &Settings) -> Arc<dyn BleAdapter> {
    if settings.simulated_adapter {
        info!("Using simulated Bluetooth adapter");
        return Arc::new(
            MockBleAdapter::with_sample_data().with_feed(settings.simulated_feed_interval()),
        );
    }

    #[cfg(windows)]
    let adapter: Arc<dyn BleAdapter> = Arc::new(WinRtAdapter::new().await);
    #[cfg(not(windows))]
    let adapter: Arc<dyn BleAdapter> = Arc::new(UnsupportedAdapter::new());
    adapter
}

fn spawn_worker(
    settings: Settings,
    commands: mpsc::UnboundedReceiver<BluetoothCommand>,
    events: mpsc::UnboundedSender<AppEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("bluetooth".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime for Bluetooth: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let adapter = create_adapter(&settings).await;
                BluetoothService::new(adapter, &settings, events)
                    .run(commands)
                    .await;
            });
            info!("Bluetooth worker stopped");
        })
}

impl BleMonitorApp {
    pub fn new(cc: &eframe::CreationContext<'_>) -> anyhow::Result<Self> {
        let settings = SettingsService::new()?;

        let logging_guard = init_logger(&settings.get().log_settings)
            .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
            .ok();

        info!("Starting BLE Stream Monitor");
        info!("Settings file: {}", settings.path().display());

        let is_dark_mode = settings.get().dark_mode;
        theme::configure_style(&cc.egui_ctx, is_dark_mode);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (bluetooth_tx, command_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(settings.get().clone(), command_rx, event_tx)?;

        Ok(Self {
            state: MonitorState::new(settings.get().sample_capacity),
            settings,
            is_dark_mode,
            bluetooth_tx,
            event_rx,
            worker: Some(worker),
            _logging_guard: logging_guard,
        })
    }

    pub(crate) fn send(&self, command: BluetoothCommand) {
        if self.bluetooth_tx.send(command).is_err() {
            warn!("Bluetooth worker is gone, command dropped");
        }
    }

    fn toggle_theme(&mut self, ctx: &egui::Context) {
        self.is_dark_mode = !self.is_dark_mode;
        theme::configure_style(ctx, self.is_dark_mode);
        self.settings.get_mut().dark_mode = self.is_dark_mode;
        if let Err(e) = self.settings.save() {
            warn!("Failed to save settings: {:#}", e);
        }
    }

    fn show_notices(&mut self, ctx: &egui::Context) {
        let palette = theme::Palette::new(self.is_dark_mode);

        self.state.expire_toast(Instant::now());
        if let Some((notice, _)) = &self.state.toast {
            egui::TopBottomPanel::bottom("toast").show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.label(
                        egui::RichText::new(&notice.title)
                            .strong()
                            .color(palette.severity(notice.severity)),
                    );
                    ui.label(&notice.body);
                });
            });
        }

        let mut dismissed = false;
        if let Some(notice) = &self.state.dialog {
            egui::Window::new(
                egui::RichText::new(&notice.title).color(palette.severity(notice.severity)),
            )
            .id(egui::Id::new("notice_dialog"))
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(&notice.body);
                ui.add_space(8.0);
                if ui.button("OK").clicked() {
                    dismissed = true;
                }
            });
        }
        if dismissed {
            self.state.dialog = None;
        }
    }
}

impl eframe::App for BleMonitorApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.state.apply(event);
        }

        // Events arrive from another thread; poll for them.
        ctx.request_repaint_after(Duration::from_millis(100));

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.label(egui::RichText::new("BLE Stream Monitor").strong());
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let switch_icon = if self.is_dark_mode {
                        "☀ Light"
                    } else {
                        "🌙 Dark"
                    };
                    if ui.button(switch_icon).clicked() {
                        self.toggle_theme(ctx);
                    }
                });
            });
        });

        self.show_notices(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                ui.vertical_centered(|ui| {
                    ui.set_max_width(900.0);
                    ui.add_space(16.0);
                    match self.state.view() {
                        View::Blocked => views::blocked::render(self, ui),
                        View::Discovery => views::discovery::render(self, ui),
                        View::Stream => views::stream::render(self, ui),
                    }
                    ui.add_space(40.0);
                });
            });
        });
    }
}

impl Drop for BleMonitorApp {
    fn drop(&mut self) {
        let _ = self.bluetooth_tx.send(BluetoothCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Bluetooth worker panicked");
            }
        }
    }
}
