// src/main.rs
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]
mod config;
mod drivers;
mod gui;
mod recorder;
mod session;
mod types;
use eframe::egui;
use log::{info, warn};

use config::{AppParameters, PARAMS_FILE};
use session::Session;

fn main() -> eframe::Result<()> {
    env_logger::init();
    let params = match AppParameters::load(PARAMS_FILE) {
        Ok(params) => params,
        Err(e) => {
            warn!("{e:#}; using default parameters");
            AppParameters::default()
        }
    };
    info!(
        "{} channels configured, Fs {:.1} Hz",
        params.sampling.channel_names().len(),
        params.sampling.fs()
    );
    let viewport = egui::ViewportBuilder::default()
        .with_inner_size([1400.0, 900.0])
        .with_min_inner_size([1000.0, 700.0])
        .with_title("muxacq");
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };
    eframe::run_native(
        "muxacq",
        options,
        Box::new(move |_cc| Box::new(gui::MuxAcqApp::new(Session::new(params)))),
    )
}
