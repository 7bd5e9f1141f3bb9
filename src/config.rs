// src/config.rs
//! Typed parameter tree of the acquisition window.
//!
//! Every leaf has a dotted path (`SampSettingConf.Sampling Settings.FsxCh`,
//! `Plot options.ViewTime`, ...). [`AppParameters::set`] is the only way the
//! GUI edits a leaf: it validates, applies and reports what changed, so the
//! session can route changes to running workers.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::{MuxLayout, PlotterSettings, PsdScaling, PsdSettings, SimSettings, YScale};
use crate::types::BlockPart;

pub const ROW_NAMES: [&str; 8] = ["Ch01", "Ch02", "Ch03", "Ch04", "Ch05", "Ch06", "Ch07", "Ch08"];
pub const COLUMN_NAMES: [&str; 8] = [
    "Col01", "Col02", "Col03", "Col04", "Col05", "Col06", "Col07", "Col08",
];

/// Longest history a time-domain plot may keep.
pub const MAX_VIEW_TIME: f64 = 600.0;

/// Parameter file looked up in the working directory.
pub const PARAMS_FILE: &str = "muxacq_params.json";

pub const SAMPLING_GROUP: &str = "SampSettingConf";
pub const PLOT_GROUP: &str = "Plot options";
pub const RAW_PLOT_GROUP: &str = "Raw Plot";
pub const PSD_GROUP: &str = "PSD Options";
pub const RECORD_GROUP: &str = "Record File";

pub const PATH_FSXCH: &str = "SampSettingConf.Sampling Settings.FsxCh";
pub const PATH_FS: &str = "SampSettingConf.Sampling Settings.Fs";
pub const PATH_NSAMPSCO: &str = "SampSettingConf.Sampling Settings.nSampsCo";
pub const PATH_NDISCARD: &str = "SampSettingConf.Sampling Settings.nDiscard";
pub const PATH_NBLOCKS: &str = "SampSettingConf.Sampling Settings.nBlocks";
const ROWS_PREFIX: &str = "SampSettingConf.Channels Config.Rows.";
const COLUMNS_PREFIX: &str = "SampSettingConf.Channels Config.Columns.";
const SIM_PREFIX: &str = "SampSettingConf.Simulation.";

pub fn row_path(row: &str) -> String {
    format!("{ROWS_PREFIX}{row}")
}
pub fn column_path(column: &str) -> String {
    format!("{COLUMNS_PREFIX}{column}")
}
pub fn sim_path(leaf: &str) -> String {
    format!("{SIM_PREFIX}{leaf}")
}
pub fn leaf_path(group: &str, leaf: &str) -> String {
    format!("{group}.{leaf}")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Float(_) => "float",
            ParamValue::Int(_) => "int",
            ParamValue::Bool(_) => "bool",
            ParamValue::Text(_) => "text",
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("parameter '{path}' expects a {expected} value, got {got}")]
    Type {
        path: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("parameter '{0}' is read-only")]
    ReadOnly(String),
    #[error("parameter '{path}': {reason}")]
    Range { path: String, reason: String },
}

/// One entry of a tree-changed notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamChange {
    pub path: String,
    pub value: ParamValue,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamUpdate {
    pub changes: Vec<ParamChange>,
    /// Rows or columns changed: channel lists must be rebuilt.
    pub new_conf: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub fs_x_ch: f64,
    pub n_samps_co: usize,
    pub n_discard: usize,
    pub n_blocks: usize,
    pub rows: [bool; 8],
    pub columns: [bool; 8],
    pub simulation: SimSettings,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            fs_x_ch: 1000.0,
            n_samps_co: 20,
            n_discard: 4,
            n_blocks: 100,
            rows: [true; 8],
            columns: [true; 8],
            simulation: SimSettings::default(),
        }
    }
}

impl SamplingParams {
    pub fn rows(&self) -> Vec<String> {
        enabled(&ROW_NAMES, &self.rows)
    }
    pub fn columns(&self) -> Vec<String> {
        enabled(&COLUMN_NAMES, &self.columns)
    }
    pub fn n_columns(&self) -> usize {
        self.columns.iter().filter(|&&on| on).count()
    }
    /// Raw ADC rate per row.
    pub fn fs(&self) -> f64 {
        self.fs_x_ch * (self.n_samps_co * self.n_columns()) as f64
    }
    pub fn layout(&self) -> MuxLayout {
        MuxLayout {
            fs_x_ch: self.fs_x_ch,
            n_samps_co: self.n_samps_co,
            n_discard: self.n_discard,
            n_blocks: self.n_blocks,
            rows: self.rows(),
            columns: self.columns(),
        }
    }
    /// Output channel name -> index in the demultiplexed block.
    pub fn channel_names(&self) -> BTreeMap<String, usize> {
        self.layout()
            .channel_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect()
    }
    /// Enabled row name -> index in the raw block.
    pub fn raw_channel_names(&self) -> BTreeMap<String, usize> {
        let mut rows = self.rows();
        rows.sort();
        rows.into_iter().enumerate().map(|(i, r)| (r, i)).collect()
    }
}

fn enabled(names: &[&str; 8], flags: &[bool; 8]) -> Vec<String> {
    names
        .iter()
        .zip(flags)
        .filter(|(_, &on)| on)
        .map(|(n, _)| (*n).to_owned())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotterParams {
    pub fs: f64,
    pub view_time: f64,
    pub refresh_time: f64,
    /// 0 follows the data, anything else fixes the axis to +/- this value.
    pub y_range: f64,
    #[serde(skip)]
    pub channels: BTreeMap<String, usize>,
}

impl Default for PlotterParams {
    fn default() -> Self {
        Self {
            fs: 1000.0,
            view_time: 5.0,
            refresh_time: 0.2,
            y_range: 0.0,
            channels: BTreeMap::new(),
        }
    }
}

impl PlotterParams {
    /// Replace the plotted channel set without emitting change notifications.
    pub fn set_channels(&mut self, channels: BTreeMap<String, usize>) {
        self.channels = channels;
    }
    pub fn settings(&self, show_time: bool, part: BlockPart) -> PlotterSettings {
        PlotterSettings {
            n_channels: self.channels.len(),
            channel_conf: self.channels.clone(),
            fs: self.fs,
            view_time: self.view_time,
            refresh_time: self.refresh_time,
            show_time,
            y_scale: if self.y_range > 0.0 {
                YScale::Fixed(self.y_range as f32)
            } else {
                YScale::Auto
            },
            part,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsdParams {
    pub fs: f64,
    pub n_fft: usize,
    pub n_avg: usize,
    pub scaling: PsdScaling,
    pub refresh_time: f64,
}

impl Default for PsdParams {
    fn default() -> Self {
        Self {
            fs: 1000.0,
            n_fft: 1024,
            n_avg: 4,
            scaling: PsdScaling::Density,
            refresh_time: 1.0,
        }
    }
}

impl PsdParams {
    pub fn settings(&self, channels: &BTreeMap<String, usize>) -> PsdSettings {
        PsdSettings {
            n_channels: channels.len(),
            channel_conf: channels.clone(),
            fs: self.fs,
            n_fft: self.n_fft,
            n_avg: self.n_avg,
            scaling: self.scaling,
            refresh_time: self.refresh_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordParams {
    pub file_path: String,
    /// Samples per channel per file part.
    pub max_size: usize,
}

impl Default for RecordParams {
    fn default() -> Self {
        Self {
            file_path: String::new(),
            max_size: 1_000_000,
        }
    }
}

impl RecordParams {
    pub fn file_path(&self) -> Option<&str> {
        let p = self.file_path.trim();
        (!p.is_empty()).then_some(p)
    }
}

/// Root of the tree (`App Parameters`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppParameters {
    pub sampling: SamplingParams,
    pub plot: PlotterParams,
    pub raw_plot: PlotterParams,
    pub psd: PsdParams,
    pub record: RecordParams,
}

impl Default for AppParameters {
    fn default() -> Self {
        let mut params = Self {
            sampling: SamplingParams::default(),
            plot: PlotterParams::default(),
            raw_plot: PlotterParams {
                view_time: 0.2,
                ..PlotterParams::default()
            },
            psd: PsdParams::default(),
            record: RecordParams::default(),
        };
        params.sync_derived();
        params
    }
}

fn expect_f64(path: &str, value: &ParamValue) -> Result<f64, ParamError> {
    value.as_f64().ok_or(ParamError::Type {
        path: path.to_owned(),
        expected: "float",
        got: value.kind(),
    })
}

fn expect_positive(path: &str, value: &ParamValue) -> Result<f64, ParamError> {
    let v = expect_f64(path, value)?;
    if !(v.is_finite() && v > 0.0) {
        return Err(ParamError::Range {
            path: path.to_owned(),
            reason: format!("{v} must be greater than zero"),
        });
    }
    Ok(v)
}

fn expect_count(path: &str, value: &ParamValue, min: usize) -> Result<usize, ParamError> {
    match value {
        ParamValue::Int(v) if *v >= min as i64 => Ok(*v as usize),
        ParamValue::Int(v) => Err(ParamError::Range {
            path: path.to_owned(),
            reason: format!("{v} must be at least {min}"),
        }),
        other => Err(ParamError::Type {
            path: path.to_owned(),
            expected: "int",
            got: other.kind(),
        }),
    }
}

fn expect_bool(path: &str, value: &ParamValue) -> Result<bool, ParamError> {
    match value {
        ParamValue::Bool(v) => Ok(*v),
        other => Err(ParamError::Type {
            path: path.to_owned(),
            expected: "bool",
            got: other.kind(),
        }),
    }
}

fn expect_text<'a>(path: &str, value: &'a ParamValue) -> Result<&'a str, ParamError> {
    match value {
        ParamValue::Text(v) => Ok(v),
        other => Err(ParamError::Type {
            path: path.to_owned(),
            expected: "text",
            got: other.kind(),
        }),
    }
}

impl AppParameters {
    /// Rebuild the values that follow from the sampling group.
    pub fn sync_derived(&mut self) {
        self.plot.fs = self.sampling.fs_x_ch;
        self.psd.fs = self.sampling.fs_x_ch;
        self.raw_plot.fs = self.sampling.fs();
        self.plot.set_channels(self.sampling.channel_names());
        self.raw_plot.set_channels(self.sampling.raw_channel_names());
    }

    pub fn get(&self, path: &str) -> Result<ParamValue, ParamError> {
        let s = &self.sampling;
        let value = match path {
            PATH_FSXCH => ParamValue::Float(s.fs_x_ch),
            PATH_FS => ParamValue::Float(s.fs()),
            PATH_NSAMPSCO => ParamValue::Int(s.n_samps_co as i64),
            PATH_NDISCARD => ParamValue::Int(s.n_discard as i64),
            PATH_NBLOCKS => ParamValue::Int(s.n_blocks as i64),
            "SampSettingConf.Simulation.Amplitude" => ParamValue::Float(s.simulation.amplitude),
            "SampSettingConf.Simulation.Noise" => ParamValue::Float(s.simulation.noise),
            "SampSettingConf.Simulation.Frequency" => ParamValue::Float(s.simulation.frequency_hz),
            "PSD Options.Fs" => ParamValue::Float(self.psd.fs),
            "PSD Options.nFFT" => ParamValue::Int(self.psd.n_fft as i64),
            "PSD Options.nAvg" => ParamValue::Int(self.psd.n_avg as i64),
            "PSD Options.Scaling" => ParamValue::Text(self.psd.scaling.label().to_owned()),
            "PSD Options.RefreshTime" => ParamValue::Float(self.psd.refresh_time),
            "Record File.File Path" => ParamValue::Text(self.record.file_path.clone()),
            "Record File.MaxSize" => ParamValue::Int(self.record.max_size as i64),
            _ => {
                if let Some(row) = path.strip_prefix(ROWS_PREFIX) {
                    let idx = ROW_NAMES
                        .iter()
                        .position(|r| *r == row)
                        .ok_or_else(|| ParamError::Unknown(path.to_owned()))?;
                    ParamValue::Bool(s.rows[idx])
                } else if let Some(col) = path.strip_prefix(COLUMNS_PREFIX) {
                    let idx = COLUMN_NAMES
                        .iter()
                        .position(|c| *c == col)
                        .ok_or_else(|| ParamError::Unknown(path.to_owned()))?;
                    ParamValue::Bool(s.columns[idx])
                } else {
                    let (plot, leaf) = self.plot_leaf(path)?;
                    match leaf {
                        "Fs" => ParamValue::Float(plot.fs),
                        "ViewTime" => ParamValue::Float(plot.view_time),
                        "RefreshTime" => ParamValue::Float(plot.refresh_time),
                        "YRange" => ParamValue::Float(plot.y_range),
                        _ => return Err(ParamError::Unknown(path.to_owned())),
                    }
                }
            }
        };
        Ok(value)
    }

    fn plot_leaf<'a>(&self, path: &'a str) -> Result<(&PlotterParams, &'a str), ParamError> {
        if let Some(leaf) = path.strip_prefix("Plot options.") {
            Ok((&self.plot, leaf))
        } else if let Some(leaf) = path.strip_prefix("Raw Plot.") {
            Ok((&self.raw_plot, leaf))
        } else {
            Err(ParamError::Unknown(path.to_owned()))
        }
    }

    /// Apply one edit. On error nothing changes.
    pub fn set(&mut self, path: &str, value: ParamValue) -> Result<ParamUpdate, ParamError> {
        let mut update = ParamUpdate::default();
        let mut fs_changed = false;
        match path {
            PATH_FS => return Err(ParamError::ReadOnly(path.to_owned())),
            PATH_FSXCH => {
                self.sampling.fs_x_ch = expect_positive(path, &value)?;
                fs_changed = true;
            }
            PATH_NSAMPSCO => {
                let n = expect_count(path, &value, 1)?;
                if n <= self.sampling.n_discard {
                    return Err(ParamError::Range {
                        path: path.to_owned(),
                        reason: format!("must exceed nDiscard ({})", self.sampling.n_discard),
                    });
                }
                self.sampling.n_samps_co = n;
                fs_changed = true;
            }
            PATH_NDISCARD => {
                let n = expect_count(path, &value, 0)?;
                if n >= self.sampling.n_samps_co {
                    return Err(ParamError::Range {
                        path: path.to_owned(),
                        reason: format!("must be below nSampsCo ({})", self.sampling.n_samps_co),
                    });
                }
                self.sampling.n_discard = n;
            }
            PATH_NBLOCKS => self.sampling.n_blocks = expect_count(path, &value, 1)?,
            "SampSettingConf.Simulation.Amplitude" => {
                self.sampling.simulation.amplitude = expect_f64(path, &value)?.abs()
            }
            "SampSettingConf.Simulation.Noise" => {
                self.sampling.simulation.noise = expect_f64(path, &value)?.abs()
            }
            "SampSettingConf.Simulation.Frequency" => {
                self.sampling.simulation.frequency_hz = expect_positive(path, &value)?
            }
            "PSD Options.Fs" => self.psd.fs = expect_positive(path, &value)?,
            "PSD Options.nFFT" => {
                let n = expect_count(path, &value, 16)?;
                if !n.is_power_of_two() {
                    return Err(ParamError::Range {
                        path: path.to_owned(),
                        reason: format!("{n} is not a power of two"),
                    });
                }
                self.psd.n_fft = n;
            }
            "PSD Options.nAvg" => self.psd.n_avg = expect_count(path, &value, 1)?,
            "PSD Options.Scaling" => {
                let label = expect_text(path, &value)?;
                self.psd.scaling = PsdScaling::from_label(label).ok_or(ParamError::Range {
                    path: path.to_owned(),
                    reason: format!("unknown scaling '{label}'"),
                })?;
            }
            "PSD Options.RefreshTime" => self.psd.refresh_time = expect_positive(path, &value)?,
            "Record File.File Path" => {
                let file = expect_text(path, &value)?;
                let target = Path::new(file.trim()).file_name();
                if target.is_some_and(|name| name == PARAMS_FILE) {
                    return Err(ParamError::Range {
                        path: path.to_owned(),
                        reason: format!("recording would replace {PARAMS_FILE}"),
                    });
                }
                self.record.file_path = file.to_owned();
            }
            "Record File.MaxSize" => self.record.max_size = expect_count(path, &value, 1)?,
            _ => {
                if let Some(row) = path.strip_prefix(ROWS_PREFIX) {
                    let on = expect_bool(path, &value)?;
                    let idx = ROW_NAMES
                        .iter()
                        .position(|r| *r == row)
                        .ok_or_else(|| ParamError::Unknown(path.to_owned()))?;
                    self.sampling.rows[idx] = on;
                    update.new_conf = true;
                } else if let Some(col) = path.strip_prefix(COLUMNS_PREFIX) {
                    let on = expect_bool(path, &value)?;
                    let idx = COLUMN_NAMES
                        .iter()
                        .position(|c| *c == col)
                        .ok_or_else(|| ParamError::Unknown(path.to_owned()))?;
                    self.sampling.columns[idx] = on;
                    update.new_conf = true;
                    fs_changed = true;
                } else {
                    self.set_plot_leaf(path, &value)?;
                }
            }
        }
        update.changes.push(ParamChange {
            path: path.to_owned(),
            value,
        });
        if fs_changed {
            update.changes.push(ParamChange {
                path: PATH_FS.to_owned(),
                value: ParamValue::Float(self.sampling.fs()),
            });
        }
        Ok(update)
    }

    fn set_plot_leaf(&mut self, path: &str, value: &ParamValue) -> Result<(), ParamError> {
        let (plot, leaf) = if let Some(leaf) = path.strip_prefix("Plot options.") {
            (&mut self.plot, leaf)
        } else if let Some(leaf) = path.strip_prefix("Raw Plot.") {
            (&mut self.raw_plot, leaf)
        } else {
            return Err(ParamError::Unknown(path.to_owned()));
        };
        match leaf {
            "Fs" => plot.fs = expect_positive(path, value)?,
            "ViewTime" => {
                let seconds = expect_positive(path, value)?;
                if seconds > MAX_VIEW_TIME {
                    return Err(ParamError::Range {
                        path: path.to_owned(),
                        reason: format!("{seconds} s exceeds {MAX_VIEW_TIME} s"),
                    });
                }
                plot.view_time = seconds;
            }
            "RefreshTime" => plot.refresh_time = expect_positive(path, value)?,
            "YRange" => plot.y_range = expect_f64(path, value)?.max(0.0),
            _ => return Err(ParamError::Unknown(path.to_owned())),
        }
        Ok(())
    }

    /// Every leaf that `set` accepts, in an order where cross-checks hold.
    fn editable_paths() -> Vec<String> {
        let mut paths: Vec<String> = [PATH_FSXCH, PATH_NSAMPSCO, PATH_NDISCARD, PATH_NBLOCKS]
            .into_iter()
            .map(str::to_owned)
            .collect();
        paths.extend(["Amplitude", "Noise", "Frequency"].map(sim_path));
        paths.extend(ROW_NAMES.map(row_path));
        paths.extend(COLUMN_NAMES.map(column_path));
        let leaves: [(&str, &[&str]); 4] = [
            (PLOT_GROUP, &["Fs", "ViewTime", "RefreshTime", "YRange"]),
            (RAW_PLOT_GROUP, &["Fs", "ViewTime", "RefreshTime", "YRange"]),
            (PSD_GROUP, &["Fs", "nFFT", "nAvg", "Scaling", "RefreshTime"]),
            (RECORD_GROUP, &["File Path", "MaxSize"]),
        ];
        for (group, names) in leaves {
            paths.extend(names.iter().map(|leaf| leaf_path(group, leaf)));
        }
        paths
    }

    /// Check every value against the rules `set` enforces.
    pub fn validate(&self) -> Result<(), ParamError> {
        let mut scratch = self.clone();
        for path in Self::editable_paths() {
            let value = self.get(&path)?;
            scratch.set(&path, value)?;
        }
        Ok(())
    }

    /// Read parameters from a JSON file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut params: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        params
            .validate()
            .with_context(|| format!("invalid parameters in {}", path.display()))?;
        params.sync_derived();
        Ok(params)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }
}
