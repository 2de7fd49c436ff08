//! Formatted output helpers for CLI commands.
//!
//! Tables are left-aligned, with every column as wide as its widest cell.

#![allow(clippy::print_stdout)]

/// Renders rows under a header line, columns separated by three spaces.
#[must_use]
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = render_row(headers.iter().copied(), &widths);
    for row in rows {
        out.push('\n');
        out.push_str(&render_row(row.iter().map(String::as_str), &widths));
    }
    out
}

fn render_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let line = cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("   ");
    line.trim_end().to_string()
}

/// Prints a table to stdout.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    println!("{}", format_table(headers, rows));
}

/// Prints a line to stdout.
pub fn print_line(line: &str) {
    println!("{line}");
}

/// Writes text to stdout as-is.
pub fn print_raw(text: &str) {
    print!("{text}");
}

/// Returns `-` for an absent value.
#[must_use]
pub fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}
