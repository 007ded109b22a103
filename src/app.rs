use crate::device::{self, Control};
use crate::registry::SessionObserver;
use crate::session::{SessionId, SessionSnapshot, LARGE_MOTOR, LED_NUMBER, SMALL_MOTOR};
use crossbeam_channel::{Receiver, Sender};
use eframe::egui;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the status window learns about, sent from the server thread
#[derive(Debug, Clone)]
pub enum GuiEvent {
    Links(Vec<String>),
    SessionAdded(SessionId),
    SessionChanged(SessionSnapshot),
    SessionRemoved(SessionId),
    /// The server ended normally, e.g. on Ctrl-C
    ServerStopped,
    ServerFailed(String),
}

/// Registry observer that queues events for the status window
pub struct GuiObserver {
    events: Sender<GuiEvent>,
}

impl GuiObserver {
    pub fn new(events: Sender<GuiEvent>) -> Self {
        Self { events }
    }

    fn push(&self, event: GuiEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow::anyhow!("Status window is gone"))
    }
}

impl SessionObserver for GuiObserver {
    fn session_added(&self, id: SessionId) -> anyhow::Result<()> {
        self.push(GuiEvent::SessionAdded(id))
    }

    fn session_changed(&self, _id: SessionId, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        self.push(GuiEvent::SessionChanged(snapshot.clone()))
    }

    fn session_removed(&self, id: SessionId) -> anyhow::Result<()> {
        self.push(GuiEvent::SessionRemoved(id))
    }
}

/// What the window shows, rebuilt from queued events
#[derive(Debug, Default)]
pub struct StatusModel {
    pub links: Vec<String>,
    pub sessions: BTreeMap<SessionId, Option<SessionSnapshot>>,
    pub stopped: bool,
    pub server_error: Option<String>,
}

impl StatusModel {
    pub fn apply(&mut self, event: GuiEvent) {
        match event {
            GuiEvent::Links(links) => self.links = links,
            GuiEvent::SessionAdded(id) => {
                self.sessions.insert(id, None);
            }
            GuiEvent::SessionChanged(snapshot) => {
                // Late changes of a removed session must not bring it back
                if let Some(slot) = self.sessions.get_mut(&snapshot.id) {
                    *slot = Some(snapshot);
                }
            }
            GuiEvent::SessionRemoved(id) => {
                self.sessions.remove(&id);
            }
            GuiEvent::ServerStopped => self.stopped = true,
            GuiEvent::ServerFailed(message) => {
                self.stopped = true;
                self.server_error = Some(message);
            }
        }
    }

    /// Apply every queued event without blocking
    pub fn drain(&mut self, events: &Receiver<GuiEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            self.apply(event);
            count += 1;
        }
        count
    }
}

/// Buttons and pad directions currently held, in name order. Analog controls are
/// shown separately.
pub fn held_controls(snapshot: &SessionSnapshot) -> Vec<&str> {
    snapshot
        .state
        .iter()
        .filter(|(name, value)| {
            matches!(
                device::lookup(snapshot.mode, name),
                Some(Control::Button(_) | Control::Direction(_))
            ) && **value != 0.0
        })
        .map(|(name, _)| name.as_str())
        .collect()
}

pub struct StatusApp {
    events: Receiver<GuiEvent>,
    model: StatusModel,
    stop: CancellationToken,
    show_values: bool,
}

impl StatusApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        events: Receiver<GuiEvent>,
        stop: CancellationToken,
    ) -> Self {
        cc.egui_ctx.set_fonts(egui::FontDefinitions::default());
        Self {
            events,
            model: StatusModel::default(),
            stop,
            show_values: false,
        }
    }

    fn render_links(&self, ui: &mut egui::Ui) {
        ui.heading("Open on your phone");
        ui.add_space(5.0);
        if self.model.links.is_empty() {
            ui.label("Starting server...");
        }
        for link in &self.model.links {
            ui.hyperlink(link);
        }
    }

    fn render_session(&self, ui: &mut egui::Ui, id: SessionId, snapshot: Option<&SessionSnapshot>) {
        ui.group(|ui| {
            let Some(snapshot) = snapshot else {
                ui.label(format!("Session {}: connecting", id));
                return;
            };

            ui.horizontal(|ui| {
                ui.label(egui::RichText::new(format!("Session {}", id)).strong());
                ui.separator();
                ui.label(snapshot.mode.as_str());
                ui.separator();
                let led = snapshot.feedback(LED_NUMBER) as u8;
                let led_text = if led == 0 {
                    egui::RichText::new("LED off").color(egui::Color32::DARK_GRAY)
                } else {
                    egui::RichText::new(format!("LED {}", led)).color(egui::Color32::GREEN)
                };
                ui.label(led_text);
            });

            ui.add(
                egui::ProgressBar::new(snapshot.feedback(LARGE_MOTOR).clamp(0.0, 1.0))
                    .text("Large motor"),
            );
            ui.add(
                egui::ProgressBar::new(snapshot.feedback(SMALL_MOTOR).clamp(0.0, 1.0))
                    .text("Small motor"),
            );

            ui.horizontal(|ui| {
                ui.label(format!(
                    "L ({:.2}, {:.2})",
                    snapshot.value("LSx"),
                    snapshot.value("LSy")
                ));
                ui.label(format!(
                    "R ({:.2}, {:.2})",
                    snapshot.value("RSx"),
                    snapshot.value("RSy")
                ));
            });
            ui.columns(2, |columns| {
                columns[0].add(
                    egui::ProgressBar::new(snapshot.value("LT").clamp(0.0, 1.0)).text("LT"),
                );
                columns[1].add(
                    egui::ProgressBar::new(snapshot.value("RT").clamp(0.0, 1.0)).text("RT"),
                );
            });

            ui.label(format!("Active: {}", held_controls(snapshot).join(" ")));

            if self.show_values {
                egui::Grid::new(("values", id)).striped(true).show(ui, |ui| {
                    for (name, value) in &snapshot.state {
                        ui.label(name);
                        ui.label(format!("{:.2}", value));
                        ui.end_row();
                    }
                });
            }
        });
    }
}

impl eframe::App for StatusApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.model.drain(&self.events);

        if ctx.input(|input| input.viewport().close_requested()) {
            log::info!("Status window closed");
            self.stop.cancel();
        }

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("Padlink");
                ui.separator();
                ui.checkbox(&mut self.show_values, "Values");
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let status = if self.model.server_error.is_some() {
                        egui::RichText::new("Failed").color(egui::Color32::RED)
                    } else if self.model.stopped {
                        egui::RichText::new("Stopped").color(egui::Color32::GRAY)
                    } else {
                        egui::RichText::new(format!("{} connected", self.model.sessions.len()))
                            .color(egui::Color32::GREEN)
                    };
                    ui.label(status);
                });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            if let Some(error) = &self.model.server_error {
                ui.label(egui::RichText::new(error).color(egui::Color32::RED));
                ui.add_space(10.0);
            }

            self.render_links(ui);
            ui.add_space(15.0);

            egui::ScrollArea::vertical().show(ui, |ui| {
                for (id, snapshot) in &self.model.sessions {
                    self.render_session(ui, *id, snapshot.as_ref());
                    ui.add_space(5.0);
                }
            });
        });

        ctx.request_repaint_after(Duration::from_millis(50));
    }
}
