//! Line-oriented terminal output. Results go to stdout; warnings, errors and
//! prompts go to stderr so `--format json` output stays clean.

use crate::ui::{err_theme, theme, Icons};
use owo_colors::OwoColorize;

pub fn header(icon: &str, text: &str) {
    println!("{} {}", icon, text.style(theme().title.clone()));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().ok.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(err_theme().failure.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(err_theme().caution.clone()));
}

/// A `label: value` line
pub fn info(label: &str, value: &str) {
    println!("  {}: {}", label.style(theme().label.clone()), value);
}

/// Follow-up line under an error, on stderr
pub fn hint(text: &str) {
    eprintln!("  {} {}", Icons::INFO, text.style(err_theme().label.clone()));
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(theme().title.clone()));
}

