use std::io::Cursor;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::LineSeries;
use plotters::prelude::*;
use crate::drivers::error::AcqError;
use crate::drivers::psd::PsdFrame;
use crate::drivers::TimeSeriesFrame;
// Snapshots are drawn without text so no system font stack is needed.
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}
impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
        }
    }
}
fn bounds(values: impl Iterator<Item = f64>, fallback: (f64, f64)) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo > hi || (hi - lo).abs() < f64::EPSILON {
        fallback
    } else {
        (lo, hi)
    }
}
pub fn render_waveform_png(
    frame: &TimeSeriesFrame,
    style: PlotStyle,
) -> Result<Vec<u8>, AcqError> {
    if frame.samples.iter().all(|c| c.is_empty()) {
        return Err(AcqError::Plot("time-series frame has no samples".into()));
    }
    let series: Vec<Vec<[f64; 2]>> = (0..frame.samples.len()).map(|i| frame.points(i)).collect();
    let x = bounds(series.iter().flatten().map(|p| p[0]), (0.0, 1.0));
    let y = match frame.y_range {
        Some((lo, hi)) => (lo as f64, hi as f64),
        None => bounds(series.iter().flatten().map(|p| p[1]), (-1.0, 1.0)),
    };
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(x.0..x.1, y.0..y.1)?;
        for (idx, points) in series.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            chart.draw_series(LineSeries::new(points.iter().map(|p| (p[0], p[1])), &color))?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
/// PSD snapshot, y axis in log10 units.
pub fn render_spectrum_png(spectrum: &PsdFrame, style: PlotStyle) -> Result<Vec<u8>, AcqError> {
    if spectrum.psd.is_empty() {
        return Err(AcqError::Plot("spectrum has no channels".into()));
    }
    let log_psd: Vec<Vec<f64>> = spectrum
        .psd
        .iter()
        .map(|bins| bins.iter().map(|p| p.max(1e-30).log10()).collect())
        .collect();
    let f_max = spectrum.frequencies_hz.last().copied().unwrap_or(1.0).max(1e-3);
    let y = bounds(log_psd.iter().flatten().copied(), (-12.0, 0.0));
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(0f64..f_max, y.0..y.1)?;
        for (idx, bins) in log_psd.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = spectrum
                .frequencies_hz
                .iter()
                .copied()
                .zip(bins.iter().copied())
                .skip(1);
            chart.draw_series(LineSeries::new(series, &color))?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, AcqError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| AcqError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
