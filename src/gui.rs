// src/gui.rs
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use eframe::egui;
use egui::{Color32, RichText};
use egui_plot::{Legend, Line, Plot, PlotPoints};
use log::{info, warn};

use crate::config::{
    self, AppParameters, ParamValue, COLUMN_NAMES, PARAMS_FILE, PLOT_GROUP, PSD_GROUP,
    RAW_PLOT_GROUP, RECORD_GROUP, ROW_NAMES, SAMPLING_GROUP,
};
use crate::drivers::{
    render_spectrum_png, render_waveform_png, PlotStyle, PsdScaling, TimeSeriesFrame,
};
use crate::session::Session;

const LOG_LINES: usize = 10;

pub struct MuxAcqApp {
    session: Session,
    log_messages: Vec<String>,
}

impl MuxAcqApp {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            log_messages: vec!["muxacq ready.".to_owned()],
        }
    }

    fn log(&mut self, msg: &str) {
        self.log_messages.push(format!("> {msg}"));
        if self.log_messages.len() > LOG_LINES {
            self.log_messages.remove(0);
        }
    }

    fn apply(&mut self, path: &str, value: ParamValue) {
        if let Err(e) = self.session.set_param(path, value) {
            warn!("{e}");
            self.log(&e.to_string());
        }
    }

    fn float_row(&mut self, ui: &mut egui::Ui, label: &str, path: &str, speed: f64) {
        let Ok(ParamValue::Float(mut v)) = self.session.params().get(path) else {
            return;
        };
        ui.horizontal(|ui| {
            ui.label(label);
            if ui.add(egui::DragValue::new(&mut v).speed(speed)).changed() {
                self.apply(path, ParamValue::Float(v));
            }
        });
    }

    fn int_row(&mut self, ui: &mut egui::Ui, label: &str, path: &str) {
        let Ok(ParamValue::Int(mut v)) = self.session.params().get(path) else {
            return;
        };
        ui.horizontal(|ui| {
            ui.label(label);
            if ui.add(egui::DragValue::new(&mut v).speed(1.0)).changed() {
                self.apply(path, ParamValue::Int(v));
            }
        });
    }

    fn bool_box(&mut self, ui: &mut egui::Ui, label: &str, path: &str) {
        let Ok(ParamValue::Bool(mut on)) = self.session.params().get(path) else {
            return;
        };
        if ui.checkbox(&mut on, label).changed() {
            self.apply(path, ParamValue::Bool(on));
        }
    }

    fn sampling_group(&mut self, ui: &mut egui::Ui) {
        ui.collapsing(SAMPLING_GROUP, |ui| {
            self.float_row(ui, "FsxCh", config::PATH_FSXCH, 10.0);
            if let Ok(fs) = self.session.params().get(config::PATH_FS) {
                ui.label(format!("Fs: {fs} Hz"));
            }
            self.int_row(ui, "nSampsCo", config::PATH_NSAMPSCO);
            self.int_row(ui, "nDiscard", config::PATH_NDISCARD);
            self.int_row(ui, "nBlocks", config::PATH_NBLOCKS);
            ui.label("Rows");
            ui.horizontal_wrapped(|ui| {
                for row in ROW_NAMES {
                    self.bool_box(ui, row, &config::row_path(row));
                }
            });
            ui.label("Columns");
            ui.horizontal_wrapped(|ui| {
                for column in COLUMN_NAMES {
                    self.bool_box(ui, column, &config::column_path(column));
                }
            });
            ui.label("Simulation");
            self.float_row(ui, "Amplitude", &config::sim_path("Amplitude"), 1e-4);
            self.float_row(ui, "Noise", &config::sim_path("Noise"), 1e-5);
            self.float_row(ui, "Frequency", &config::sim_path("Frequency"), 0.5);
        });
    }

    fn plot_group(&mut self, ui: &mut egui::Ui, group: &str) {
        ui.collapsing(group, |ui| {
            let fs = self.session.params().get(&config::leaf_path(group, "Fs"));
            if let Ok(fs) = fs {
                ui.label(format!("Fs: {fs} Hz"));
            }
            self.float_row(ui, "ViewTime", &config::leaf_path(group, "ViewTime"), 0.05);
            self.float_row(ui, "RefreshTime", &config::leaf_path(group, "RefreshTime"), 0.05);
            self.float_row(ui, "YRange (0 = auto)", &config::leaf_path(group, "YRange"), 1e-4);
        });
    }

    fn psd_group(&mut self, ui: &mut egui::Ui) {
        ui.collapsing(PSD_GROUP, |ui| {
            self.int_row(ui, "nFFT", &config::leaf_path(PSD_GROUP, "nFFT"));
            self.int_row(ui, "nAvg", &config::leaf_path(PSD_GROUP, "nAvg"));
            self.float_row(ui, "RefreshTime", &config::leaf_path(PSD_GROUP, "RefreshTime"), 0.05);
            let current = self.session.params().psd.scaling;
            let mut chosen = current;
            egui::ComboBox::from_id_source("psd_scaling")
                .selected_text(current.label())
                .show_ui(ui, |ui| {
                    for scaling in PsdScaling::ALL {
                        ui.selectable_value(&mut chosen, scaling, scaling.label());
                    }
                });
            if chosen != current {
                self.apply(
                    &config::leaf_path(PSD_GROUP, "Scaling"),
                    ParamValue::Text(chosen.label().to_owned()),
                );
            }
        });
    }

    fn record_group(&mut self, ui: &mut egui::Ui) {
        ui.collapsing(RECORD_GROUP, |ui| {
            let path = config::leaf_path(RECORD_GROUP, "File Path");
            let mut file = self.session.params().record.file_path.clone();
            ui.label("File Path (empty = no recording)");
            if ui.text_edit_singleline(&mut file).changed() {
                self.apply(&path, ParamValue::Text(file));
            }
            self.int_row(ui, "MaxSize", &config::leaf_path(RECORD_GROUP, "MaxSize"));
        });
    }

    fn save_params(&mut self) {
        match self.session.params().save(PARAMS_FILE) {
            Ok(()) => self.log(&format!("parameters saved to {PARAMS_FILE}")),
            Err(e) => self.log(&format!("{e:#}")),
        }
    }

    fn load_params(&mut self) {
        match AppParameters::load(PARAMS_FILE) {
            Ok(params) => {
                self.session.replace_params(params);
                self.log(&format!("parameters loaded from {PARAMS_FILE}"));
            }
            Err(e) => {
                warn!("{e:#}");
                self.log(&format!("{e:#}"));
            }
        }
    }

    fn export(&mut self, name: &str, png: anyhow::Result<Vec<u8>>) {
        let path = PathBuf::from(format!("muxacq_{name}.png"));
        let result = png.and_then(|bytes| {
            fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))
        });
        match result {
            Ok(()) => {
                info!("exported {}", path.display());
                self.log(&format!("exported {}", path.display()));
            }
            Err(e) => self.log(&format!("{e:#}")),
        }
    }
}

fn waveform_plot(ui: &mut egui::Ui, id: &str, frame: Option<&TimeSeriesFrame>, height: f32) {
    let mut plot = Plot::new(id)
        .height(height)
        .legend(Legend::default())
        .auto_bounds_x();
    if let Some((lo, hi)) = frame.and_then(|f| f.y_range) {
        plot = plot.include_y(lo as f64).include_y(hi as f64);
    }
    plot.show(ui, |plot_ui| {
        let Some(frame) = frame else {
            return;
        };
        for (i, (label, stats)) in frame.channel_labels.iter().zip(&frame.stats).enumerate() {
            let name = format!("{label} (rms {:.2e})", stats.rms);
            plot_ui.line(Line::new(PlotPoints::new(frame.points(i))).name(name));
        }
    });
}

impl eframe::App for MuxAcqApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        for msg in self.session.poll_events() {
            self.log(&msg);
        }
        if self.session.is_running() {
            ctx.request_repaint_after(Duration::from_millis(50));
        }

        egui::SidePanel::left("params").min_width(320.0).show(ctx, |ui| {
            ui.add_space(10.0);
            ui.heading("muxacq");
            ui.label("8x8 multiplexed acquisition");
            ui.separator();

            let fill = if self.session.is_running() {
                Color32::DARK_RED
            } else {
                Color32::DARK_GREEN
            };
            let text = RichText::new(self.session.button_text()).color(Color32::WHITE);
            let button = egui::Button::new(text).fill(fill);
            if ui.add(button).clicked() {
                if let Err(e) = self.session.on_btn_start() {
                    warn!("{e}");
                    self.log(&e.to_string());
                }
            }
            ui.separator();

            egui::ScrollArea::vertical().max_height(520.0).show(ui, |ui| {
                self.sampling_group(ui);
                self.plot_group(ui, PLOT_GROUP);
                self.plot_group(ui, RAW_PLOT_GROUP);
                self.psd_group(ui);
                self.record_group(ui);
            });

            ui.horizontal(|ui| {
                if ui.button("Save parameters").clicked() {
                    self.save_params();
                }
                if ui.button("Load parameters").clicked() {
                    self.load_params();
                }
            });

            ui.add_space(10.0);
            egui::ScrollArea::vertical()
                .id_source("log")
                .max_height(140.0)
                .show(ui, |ui| {
                    for m in &self.log_messages {
                        ui.monospace(m);
                    }
                });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            let stats = self.session.stats();
            ui.horizontal_wrapped(|ui| {
                ui.label(format!("blocks: {}", stats.blocks));
                if let (Some(last), Some(mean)) = (stats.last_interval, stats.mean_interval) {
                    ui.label(format!(
                        "interval: {:.1} ms (mean {:.1} ms)",
                        last.as_secs_f64() * 1e3,
                        mean.as_secs_f64() * 1e3
                    ));
                }
                for c in &stats.consumers {
                    let text = format!("{}: {} dropped", c.name, c.dropped);
                    if c.dropped > 0 {
                        ui.label(RichText::new(text).color(Color32::YELLOW));
                    } else {
                        ui.label(text);
                    }
                }
                if let Some(path) = &stats.recording {
                    let text = format!("recording {}", path.display());
                    ui.label(RichText::new(text).color(Color32::RED));
                } else if let Some(record) = &stats.last_record {
                    ui.label(format!(
                        "last recording: {} samples in {} file(s)",
                        record.samples,
                        record.files.len()
                    ));
                }
            });

            let processed = self.session.processed_frame();
            let raw = self.session.raw_frame();
            let psd = self.session.psd_frame();

            ui.horizontal(|ui| {
                let span = processed.as_ref().map_or(0.0, |f| f.duration_seconds());
                ui.label(format!("Processed ({span:.2} s)"));
                if ui.button("Export PNG").clicked() {
                    let png = processed
                        .as_ref()
                        .context("no processed frame yet")
                        .and_then(|f| Ok(render_waveform_png(f, PlotStyle::default())?));
                    self.export("processed", png);
                }
            });
            waveform_plot(ui, "processed_plot", processed.as_ref(), 220.0);

            ui.label("Raw");
            waveform_plot(ui, "raw_plot", raw.as_ref(), 160.0);

            ui.horizontal(|ui| {
                match &psd {
                    Some(frame) => ui.label(format!(
                        "PSD (log10 {}, {} segments)",
                        frame.scaling.label(),
                        frame.segments
                    )),
                    None => ui.label("PSD (log10)"),
                };
                if ui.button("Export PNG").clicked() {
                    let png = psd
                        .as_ref()
                        .context("no spectrum yet")
                        .and_then(|f| Ok(render_spectrum_png(f, PlotStyle::default())?));
                    self.export("psd", png);
                }
            });
            Plot::new("psd_plot")
                .legend(Legend::default())
                .show(ui, |plot_ui| {
                    let Some(frame) = &psd else {
                        return;
                    };
                    for (label, bins) in frame.channel_labels.iter().zip(&frame.psd) {
                        let points: Vec<[f64; 2]> = frame
                            .frequencies_hz
                            .iter()
                            .zip(bins)
                            .skip(1)
                            .map(|(&f, &p)| [f, p.max(1e-30).log10()])
                            .collect();
                        plot_ui.line(Line::new(PlotPoints::new(points)).name(label));
                    }
                });
        });
    }
}
