//! Terminal output helpers: notes, colored job statuses, plain tables.

use netwarden_scheduler::JobStatus;

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";

pub fn supports_color() -> bool {
    std::env::var("NO_COLOR").is_err()
        && (std::env::var("COLORTERM").is_ok()
            || std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false))
}

/// Remove ANSI escape sequences, for width computations.
pub fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn note(color: &str, symbol: &str, label: &str, msg: &str) -> String {
    if supports_color() {
        format!("{color}{BOLD}{symbol}{RESET} {msg}")
    } else {
        format!("{label}: {msg}")
    }
}

pub fn note_warn(msg: &str) {
    println!("{}", note(YELLOW, "!", "WARN", msg));
}

pub fn note_error(msg: &str) {
    eprintln!("{}", note(RED, "x", "ERROR", msg));
}

pub fn note_success(msg: &str) {
    println!("{}", note(GREEN, "ok", "OK", msg));
}

/// Job status, colored when the terminal allows it.
pub fn status_cell(status: JobStatus) -> String {
    if !supports_color() {
        return status.as_str().to_string();
    }
    let color = match status {
        JobStatus::Success => GREEN,
        JobStatus::Failure => RED,
        JobStatus::Running => CYAN,
        JobStatus::Cancelled => DIM,
        _ => YELLOW,
    };
    format!("{color}{}{RESET}", status.as_str())
}

#[derive(Clone, Copy)]
pub enum Align {
    Left,
    Right,
}

pub struct Column {
    pub header: &'static str,
    pub align: Align,
}

impl Column {
    pub fn left(header: &'static str) -> Self {
        Self { header, align: Align::Left }
    }

    pub fn right(header: &'static str) -> Self {
        Self { header, align: Align::Right }
    }
}

pub fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.header.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(strip_ansi(cell).chars().count());
        }
    }

    let line = |cells: Vec<String>| format!("  {}\n", cells.join("  ").trim_end());
    let mut out = String::new();
    out.push_str(&line(
        columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| pad(c.header, *w, c.align))
            .collect(),
    ));
    out.push_str(&line(widths.iter().map(|w| "-".repeat(*w)).collect()));
    for row in rows {
        out.push_str(&line(
            columns
                .iter()
                .zip(&widths)
                .enumerate()
                .map(|(i, (c, w))| pad(row.get(i).map(String::as_str).unwrap_or(""), *w, c.align))
                .collect(),
        ));
    }
    out
}

fn pad(s: &str, width: usize, align: Align) -> String {
    let fill = " ".repeat(width.saturating_sub(strip_ansi(s).chars().count()));
    match align {
        Align::Left => format!("{s}{fill}"),
        Align::Right => format!("{fill}{s}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi() {
        assert_eq!(strip_ansi(&format!("{GREEN}SUCCESS{RESET}")), "SUCCESS");
    }

    #[test]
    fn table_aligns_columns() {
        let table = render_table(
            &[Column::right("ID"), Column::left("TYPE")],
            &[
                vec!["7".into(), "TakeSnapshot".into()],
                vec!["12".into(), "PurgeDatabase".into()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "  ID  TYPE");
        assert_eq!(lines[1], "  --  -------------");
        assert_eq!(lines[2], "   7  TakeSnapshot");
        assert_eq!(lines[3], "  12  PurgeDatabase");
    }
}
