//! Plain-text epoch reports.

use std::collections::BTreeMap;

use tracing::info;

use super::trainer::{EpochSummary, Phase, TaskConfig};

/// Renders rows as a grid table with a header separator.
pub fn grid_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let rule = |fill: char| {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&fill.to_string().repeat(w + 2));
            line.push('+');
        }
        line
    };
    let mut out = vec![rule('-'), row_line(headers, &widths), rule('=')];
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push(row_line(&cells, &widths));
        out.push(rule('-'));
    }
    if rows.is_empty() {
        out.pop();
        out.push(rule('-'));
    }
    out.join("\n")
}

fn row_line(cells: &[&str], widths: &[usize]) -> String {
    let mut out = String::from("|");
    for (cell, w) in cells.iter().zip(widths) {
        out.push_str(&format!(" {:<width$} |", cell, width = w));
    }
    out
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "N/A".to_string()
    } else {
        format!("{:.4}", v)
    }
}

// node_recall_metric -> Recall
fn metric_title(function: &str) -> String {
    let word = function.split('_').nth(1).unwrap_or(function);
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn log_summary(phase: Phase, summary: &EpochSummary, tasks: &BTreeMap<String, TaskConfig>) {
    for (task, config) in tasks {
        let avg = summary.task_losses.get(task).copied().unwrap_or(f32::NAN);
        info!("{} Task: {}, Avg Loss: {:.4}", phase.label(), task, avg);

        if let Some(dist) = summary.class_distribution.get(task) {
            let rows: Vec<Vec<String>> = dist
                .iter()
                .map(|(class, count)| vec![format!("Class {}", class), count.to_string()])
                .collect();
            info!("  Class Distribution for Task: {}\n{}", task, grid_table(&["Class", "Count"], &rows));
        }

        for (term, record) in config.loss.iter().zip(summary.term_losses.get(task).into_iter().flatten()) {
            let params = serde_json::to_string(&term.params).unwrap_or_default();
            info!(
                "  Loss: {}({}, {}), Weight: {:.2}, Params: {}, Value: {:.4}",
                record.function, record.src_node, record.target_node, record.weight, params, record.value
            );
        }

        for metric in summary.task_metrics.get(task).into_iter().flatten() {
            let mut rows: Vec<Vec<String>> = metric
                .result
                .per_class
                .iter()
                .enumerate()
                .map(|(k, v)| vec![format!("Class {}", k), format_value(*v)])
                .collect();
            rows.push(vec!["Avg".to_string(), format_value(metric.result.avg)]);
            let title = metric_title(&metric.function);
            info!(
                "  Metric: {}({}, {})\n{}",
                metric.function,
                metric.src_node,
                metric.target_node,
                grid_table(&["Class", title.as_str()], &rows)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_table_layout() {
        let table = grid_table(
            &["Class", "Count"],
            &[vec!["Class 0".into(), "12".into()], vec!["Class 1".into(), "3".into()]],
        );
        let expected = "\
+---------+-------+
| Class   | Count |
+=========+=======+
| Class 0 | 12    |
+---------+-------+
| Class 1 | 3     |
+---------+-------+";
        assert_eq!(table, expected);
    }

    #[test]
    fn test_nan_renders_as_na() {
        assert_eq!(format_value(f64::NAN), "N/A");
        assert_eq!(format_value(0.5), "0.5000");
    }

    #[test]
    fn test_metric_title() {
        assert_eq!(metric_title("node_recall_metric"), "Recall");
        assert_eq!(metric_title("custom"), "Custom");
    }
}
