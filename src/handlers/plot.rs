use anyhow::{Context, Result};
use std::path::Path;

/// Parsed contents of the tab-separated metrics log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl MetricsTable {
    pub fn column(&self, idx: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().filter_map(move |row| row.get(idx).copied())
    }
}

pub fn read_metrics_log(path: &Path) -> Result<MetricsTable> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut lines = contents.lines().filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Ok(MetricsTable::default());
    };
    let columns: Vec<String> = header.split('\t').map(str::to_string).collect();

    let mut rows = Vec::new();
    for (idx, line) in lines.enumerate() {
        let row = line
            .split('\t')
            .map(|value| value.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("bad value on data row {} of {}", idx + 1, path.display()))?;
        if row.len() != columns.len() {
            return Err(anyhow::anyhow!(
                "data row {} of {} has {} values for {} columns",
                idx + 1,
                path.display(),
                row.len(),
                columns.len()
            ));
        }
        rows.push(row);
    }

    Ok(MetricsTable { columns, rows })
}

/// Draw one line chart per metric column, stacked vertically.
#[cfg(feature = "plot")]
pub fn create_plots(logs_path: &Path, plot_path: &Path) -> Result<()> {
    use plotters::prelude::*;

    let table = read_metrics_log(logs_path)?;
    if table.columns.is_empty() || table.rows.is_empty() {
        return Ok(());
    }

    let panel_height = 200u32;
    let root = SVGBackend::new(plot_path, (1000, panel_height * table.columns.len() as u32))
        .into_drawing_area();
    root.fill(&WHITE)
        .map_err(|err| anyhow::anyhow!("failed to draw plot: {err}"))?;

    let panels = root.split_evenly((table.columns.len(), 1));
    let x_max = table.rows.len().max(2) as f64;
    for (idx, (panel, name)) in panels.iter().zip(&table.columns).enumerate() {
        let (mut lo, mut hi) = table
            .column(idx)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        if !lo.is_finite() || !hi.is_finite() {
            continue;
        }
        if hi - lo < 1e-9 {
            lo -= 0.5;
            hi += 0.5;
        }

        let mut chart = ChartBuilder::on(panel)
            .caption(name, ("sans-serif", 16))
            .margin(8)
            .x_label_area_size(24)
            .y_label_area_size(56)
            .build_cartesian_2d(1f64..x_max, lo..hi)
            .map_err(|err| anyhow::anyhow!("failed to draw plot: {err}"))?;
        chart
            .configure_mesh()
            .x_desc("Log row")
            .draw()
            .map_err(|err| anyhow::anyhow!("failed to draw plot: {err}"))?;
        chart
            .draw_series(LineSeries::new(
                table
                    .column(idx)
                    .enumerate()
                    .map(|(row, value)| ((row + 1) as f64, value)),
                &BLUE,
            ))
            .map_err(|err| anyhow::anyhow!("failed to draw plot: {err}"))?;
    }

    root.present()
        .map_err(|err| anyhow::anyhow!("failed to write {}: {err}", plot_path.display()))?;
    Ok(())
}

/// Plotting is compiled out; warn once and skip.
#[cfg(not(feature = "plot"))]
pub fn create_plots(_logs_path: &Path, _plot_path: &Path) -> Result<()> {
    static WARNED: std::sync::Once = std::sync::Once::new();
    WARNED.call_once(|| {
        log::warn!("loss plots will not be generated -- built without the `plot` feature");
    });
    Ok(())
}
