// ABOUTME: Export of a session notebook to the Jupyter nbformat 4.5 document format
// Image artifacts are inlined as base64 here and only here; the live model keeps paths

use crate::notebook::{Notebook, Output, StreamKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

/// Builds an `.ipynb` document for the notebook. `workspace_dir` is where
/// image artifact paths resolve; a missing artifact degrades to a note
/// instead of failing the whole export.
pub fn to_ipynb(notebook: &Notebook, workspace_dir: &Path) -> Value {
    let cells: Vec<Value> = notebook
        .cells
        .iter()
        .map(|cell| {
            let outputs: Vec<Value> = cell
                .outputs
                .iter()
                .map(|output| render_output(output, cell.execution_count, workspace_dir))
                .collect();
            json!({
                "cell_type": "code",
                "id": format!("cell-{}", cell.index),
                "metadata": {},
                "execution_count": cell.execution_count,
                "source": lines_keepends(&cell.source),
                "outputs": outputs,
            })
        })
        .collect();

    json!({
        "cells": cells,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3",
            },
            "language_info": {
                "name": "python",
            },
        },
        "nbformat": 4,
        "nbformat_minor": 5,
    })
}

fn render_output(output: &Output, execution_count: Option<u32>, workspace_dir: &Path) -> Value {
    match output {
        Output::Text { text, stream } => match stream {
            StreamKind::Stdout => json!({
                "output_type": "stream",
                "name": "stdout",
                "text": lines_keepends(text),
            }),
            StreamKind::Stderr => json!({
                "output_type": "stream",
                "name": "stderr",
                "text": lines_keepends(text),
            }),
            StreamKind::Result => json!({
                "output_type": "execute_result",
                "execution_count": execution_count,
                "metadata": {},
                "data": { "text/plain": lines_keepends(text) },
            }),
        },
        Output::Error {
            ename,
            evalue,
            traceback,
        } => json!({
            "output_type": "error",
            "ename": ename,
            "evalue": evalue,
            "traceback": traceback,
        }),
        Output::Image { path, mime } => match std::fs::read(workspace_dir.join(path)) {
            Ok(bytes) => {
                let mut data = serde_json::Map::new();
                data.insert(mime.clone(), Value::String(BASE64.encode(bytes)));
                json!({
                    "output_type": "display_data",
                    "metadata": {},
                    "data": data,
                })
            }
            Err(err) => {
                warn!(artifact = path.as_str(), "artifact missing during export: {}", err);
                json!({
                    "output_type": "stream",
                    "name": "stderr",
                    "text": [format!("[missing artifact: {}]\n", path)],
                })
            }
        },
        Output::Table {
            columns,
            rows,
            truncated,
        } => {
            let html = table_html(columns, rows, *truncated);
            let plain = table_plain(columns, rows, *truncated);
            json!({
                "output_type": "display_data",
                "metadata": {},
                "data": {
                    "text/html": lines_keepends(&html),
                    "text/plain": lines_keepends(&plain),
                },
            })
        }
        Output::Markup { html } => json!({
            "output_type": "display_data",
            "metadata": {},
            "data": { "text/html": lines_keepends(html) },
        }),
    }
}

/// nbformat stores multi-line text as a list of lines with their newlines.
fn lines_keepends(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find('\n') {
        lines.push(rest[..=idx].to_string());
        rest = &rest[idx + 1..];
    }
    if !rest.is_empty() {
        lines.push(rest.to_string());
    }
    lines
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn table_html(columns: &[String], rows: &[Vec<String>], truncated: bool) -> String {
    let mut html = String::from("<table>\n<thead><tr>");
    for col in columns {
        html.push_str(&format!("<th>{}</th>", escape_html(col)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        html.push_str("<tr>");
        for value in row {
            html.push_str(&format!("<td>{}</td>", escape_html(value)));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>");
    if truncated {
        html.push_str("\n<p>(truncated)</p>");
    }
    html
}

fn table_plain(columns: &[String], rows: &[Vec<String>], truncated: bool) -> String {
    let mut out = columns.join(" | ");
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(" | "));
        out.push('\n');
    }
    if truncated {
        out.push_str("(truncated)\n");
    }
    out
}
